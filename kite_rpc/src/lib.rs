// Copyright (c) 2024 Kite RPC Contributors.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `kite_rpc` provides the wire-protocol components an RPC transport needs:
//! the binary frame codec, the HPACK header-compression tables, the Huffman
//! coder and the connection-scoped metadata interner.
//!
//! The framing layer follows the [HTTP/2] wire format; header compression
//! follows [HPACK]. Message payloads are opaque byte sequences, and the
//! surrounding transport machinery (flow control, stream multiplexing, the
//! connection event loop) lives in `kite_rpc_transport`.
//!
//! [HTTP/2]: https://httpwg.org/specs/rfc9113.html
//! [HPACK]: https://httpwg.org/specs/rfc7541.html

mod decoder;
mod encoder;
mod error;
mod frame;
mod hpack;
mod huffman;
mod metadata;

pub use decoder::{FrameDecoder, FrameKind, Frames, FramesIntoIter};
pub use encoder::{FrameEncoder, FrameEncoderErr};
pub use error::{ErrorCode, Http2Error};
pub use frame::{
    validate_preface, Data, Frame, FrameFlags, Goaway, Headers, Payload, Ping, PushPromise,
    RstStream, Setting, Settings, SettingsBuilder, StreamId, WindowUpdate, CONNECTION_PREFACE,
};
pub use hpack::{HpackDecoder, HpackEncoder};
pub use metadata::{Metadata, MetadataInterner, MetadataList, SharedInterner};

#[cfg(test)]
pub(crate) mod test_util;
