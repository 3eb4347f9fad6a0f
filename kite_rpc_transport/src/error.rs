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

use core::fmt;

use kite_rpc::Http2Error;

/// Causes that terminate connection machinery: a protocol error, an I/O
/// failure, an internal channel tear-down, or the peer hanging up.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum DispatchError {
    /// A wire protocol error, at stream or connection level.
    H2(Http2Error),
    /// An I/O error on the underlying byte stream.
    Io(std::io::ErrorKind),
    /// An internal channel between the connection tasks closed.
    ChannelClosed,
    /// The peer closed the byte stream.
    Disconnect,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::H2(e) => write!(f, "{e}"),
            DispatchError::Io(kind) => write!(f, "io error: {kind:?}"),
            DispatchError::ChannelClosed => write!(f, "connection task channel closed"),
            DispatchError::Disconnect => write!(f, "remote peer closed"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<std::io::Error> for DispatchError {
    fn from(value: std::io::Error) -> Self {
        DispatchError::Io(value.kind())
    }
}

impl From<Http2Error> for DispatchError {
    fn from(err: Http2Error) -> Self {
        DispatchError::H2(err)
    }
}

/// Errors surfaced on the public call-layer interfaces.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is shut down or going away; no new streams may be
    /// opened and no further operations are accepted.
    ConnectionClosed,
    /// The local side already finished sending on this stream. This is a
    /// usage error of the caller; no frame is emitted.
    StreamClosedLocally,
    /// The configured call credentials refused the call before any bytes
    /// were sent.
    CredentialsRejected(String),
    /// The connection machinery failed underneath the call.
    Dispatch(DispatchError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionClosed => write!(f, "connection closed"),
            TransportError::StreamClosedLocally => {
                write!(f, "stream already closed for sending")
            }
            TransportError::CredentialsRejected(reason) => {
                write!(f, "call credentials rejected the call: {reason}")
            }
            TransportError::Dispatch(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<DispatchError> for TransportError {
    fn from(err: DispatchError) -> Self {
        TransportError::Dispatch(err)
    }
}
