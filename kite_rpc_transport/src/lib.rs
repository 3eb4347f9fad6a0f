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

//! `kite_rpc_transport` turns one bidirectional byte stream into many
//! multiplexed, flow-controlled message streams, each carrying compressed
//! metadata and opaque binary payloads over the HTTP/2 framing of
//! [`kite_rpc`].
//!
//! One connection is driven by three cooperating tasks: a read coroutine
//! that decodes frames off the socket, a write coroutine that owns every
//! socket write (the single-writer rule), and a manager that owns all
//! shared connection state: the stream map, both levels of flow-control
//! windows, and the stream state machines. Call-layer handles communicate
//! with the manager exclusively through message passing, so no connection
//! state is ever mutated concurrently.
//!
//! - [`Transport`] owns a connection and opens streams on it.
//! - [`StreamHandle`] is the per-call surface: send data and trailing
//!   metadata, cancel, and receive [`StreamEvent`]s.

// kite_rpc crate re-export.
pub use kite_rpc::{ErrorCode, Http2Error, Metadata, MetadataList, SharedInterner};

mod buffer;
mod call;
mod config;
mod dispatcher;
mod error;
mod input;
mod manager;
mod output;
mod streams;

pub use call::{CallCredentials, StreamEvent, StreamHandle, StreamStatus};
pub use config::TransportConfig;
pub use dispatcher::Transport;
pub use error::{DispatchError, TransportError};

// Runtime components import adapter.
pub(crate) mod runtime {
    pub(crate) use tokio::io::{
        split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
    };
    pub(crate) use tokio::spawn;
    pub(crate) use tokio::sync::mpsc::{
        channel as bounded_channel, error::SendError, unbounded_channel,
        Receiver as BoundedReceiver, Sender as BoundedSender, UnboundedReceiver, UnboundedSender,
    };
    pub(crate) use tokio::task::JoinHandle;
}
