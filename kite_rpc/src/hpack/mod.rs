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

//! [HPACK] implementation for metadata compression.
//!
//! [HPACK]: https://httpwg.org/specs/rfc7541.html
//!
//! HPACK eliminates redundant header fields with a shared table of
//! previously seen fields, limits vulnerability to known security attacks,
//! and has a bounded memory requirement. The format is intentionally simple
//! and inflexible; both characteristics reduce the risk of interoperability
//! or security issues due to implementation error.
//!
//! The dynamic table state is a function of decode order, so each side of a
//! connection must run its decoder (and encoder) strictly sequentially.

mod decoder;
mod encoder;
mod integer;
mod representation;
pub(crate) mod table;

pub use decoder::HpackDecoder;
pub use encoder::HpackEncoder;
