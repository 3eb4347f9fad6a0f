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

//! The call-layer surface of one stream.
//!
//! A [`StreamHandle`] belongs to exactly one logical call. Its operations
//! are messages to the connection manager, which serializes them against
//! the shared connection state; events flow back over a bounded per-stream
//! channel, which is the backpressure boundary between the socket reader
//! and a slow consumer.

use kite_rpc::{ErrorCode, MetadataList};

use crate::error::{DispatchError, TransportError};
use crate::runtime::{BoundedReceiver, BoundedSender, UnboundedSender};

/// Events delivered to the call layer, in receive order. `Closed` arrives
/// exactly once per stream, on every teardown path.
#[derive(Debug)]
pub enum StreamEvent {
    /// The peer's initial metadata.
    InitialMetadata(MetadataList),
    /// One message payload fragment.
    Data(Vec<u8>),
    /// The peer's trailing metadata; the peer's side is finished.
    TrailingMetadata(MetadataList),
    /// The stream reached its terminal state.
    Closed(StreamStatus),
}

/// Terminal status of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// Both sides finished cleanly.
    Completed,
    /// The local side cancelled the stream.
    Cancelled(ErrorCode),
    /// The peer reset the stream.
    Reset(ErrorCode),
    /// The stream was refused or abandoned by a GOAWAY.
    GoneAway(ErrorCode),
    /// The whole connection failed underneath the stream.
    TransportError(DispatchError),
}

/// Credential collaborators attach metadata elements to the outgoing set
/// before the initial metadata is encoded, and may reject a call before
/// any bytes are sent.
pub trait CallCredentials: Send + Sync {
    /// Amends the outgoing initial metadata, or rejects the call. New
    /// elements are minted through the connection's interner.
    fn apply(
        &self,
        interner: &kite_rpc::SharedInterner,
        metadata: &mut MetadataList,
    ) -> Result<(), TransportError>;
}

// Operations a handle submits to the connection manager. Every message of
// one handle carries the same token; the manager maps tokens to wire
// stream ids, which it allocates itself so ids go out in increasing order.
pub(crate) enum CallMessage {
    Open {
        token: u64,
        metadata: MetadataList,
        end_stream: bool,
        events: BoundedSender<StreamEvent>,
    },
    Data {
        token: u64,
        chunk: Vec<u8>,
        end_stream: bool,
    },
    Trailers {
        token: u64,
        metadata: MetadataList,
    },
    Cancel {
        token: u64,
        code: ErrorCode,
    },
}

/// Handle of one open stream.
///
/// Sending never blocks: operations queue at the manager and are paced by
/// the flow-control windows there. Sending after the local side finished
/// (`end_stream`, trailers or cancel) is a usage error reported locally
/// without emitting a frame.
pub struct StreamHandle {
    token: u64,
    sender: UnboundedSender<CallMessage>,
    receiver: BoundedReceiver<StreamEvent>,
    end_sent: bool,
    cancelled: Option<ErrorCode>,
    done: bool,
}

impl StreamHandle {
    pub(crate) fn new(
        token: u64,
        sender: UnboundedSender<CallMessage>,
        receiver: BoundedReceiver<StreamEvent>,
        end_sent: bool,
    ) -> Self {
        Self {
            token,
            sender,
            receiver,
            end_sent,
            cancelled: None,
            done: false,
        }
    }

    /// Sends one opaque payload chunk, optionally half-closing the local
    /// side.
    pub fn send_data(&mut self, chunk: Vec<u8>, end_stream: bool) -> Result<(), TransportError> {
        if self.end_sent {
            return Err(TransportError::StreamClosedLocally);
        }
        self.sender
            .send(CallMessage::Data {
                token: self.token,
                chunk,
                end_stream,
            })
            .map_err(|_| TransportError::ConnectionClosed)?;
        self.end_sent = end_stream;
        Ok(())
    }

    /// Sends trailing metadata and half-closes the local side.
    pub fn send_trailing_metadata(&mut self, metadata: MetadataList) -> Result<(), TransportError> {
        if self.end_sent {
            return Err(TransportError::StreamClosedLocally);
        }
        self.sender
            .send(CallMessage::Trailers {
                token: self.token,
                metadata,
            })
            .map_err(|_| TransportError::ConnectionClosed)?;
        self.end_sent = true;
        Ok(())
    }

    /// Cancels the stream: a RST_STREAM is emitted and the stream's windows
    /// and queued frames are released immediately, without waiting for the
    /// peer.
    pub fn cancel(&mut self, code: ErrorCode) -> Result<(), TransportError> {
        if self.done || self.cancelled.is_some() {
            return Ok(());
        }
        self.sender
            .send(CallMessage::Cancel {
                token: self.token,
                code,
            })
            .map_err(|_| TransportError::ConnectionClosed)?;
        self.end_sent = true;
        self.cancelled = Some(code);
        Ok(())
    }

    /// Receives the next event of the stream. After `Closed` has been
    /// delivered, further calls report the connection as closed.
    pub async fn recv(&mut self) -> Result<StreamEvent, TransportError> {
        if self.done {
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(code) = self.cancelled.take() {
            self.done = true;
            return Ok(StreamEvent::Closed(StreamStatus::Cancelled(code)));
        }
        match self.receiver.recv().await {
            Some(event) => {
                if matches!(event, StreamEvent::Closed(_)) {
                    self.done = true;
                }
                Ok(event)
            }
            None => {
                self.done = true;
                Err(TransportError::ConnectionClosed)
            }
        }
    }
}

// Event sender of one stream, as stored by the manager.
pub(crate) type StreamEventSender = BoundedSender<StreamEvent>;

#[cfg(test)]
mod ut_call {
    use super::*;
    use crate::runtime::{bounded_channel, unbounded_channel};

    /// UT test case for local half-close bookkeeping on the handle.
    ///
    /// # Brief
    /// 1. Sends data with END_STREAM through a handle.
    /// 2. Checks that further sends are reported as local usage errors
    ///    without reaching the manager channel.
    #[test]
    fn ut_stream_handle_local_close() {
        let (tx, mut rx) = unbounded_channel();
        let (_events_tx, events_rx) = bounded_channel(1);
        let mut handle = StreamHandle::new(1, tx, events_rx, false);

        assert!(handle.send_data(b"a".to_vec(), true).is_ok());
        assert_eq!(
            handle.send_data(b"b".to_vec(), false).err(),
            Some(TransportError::StreamClosedLocally)
        );
        assert_eq!(
            handle.send_trailing_metadata(MetadataList::new()).err(),
            Some(TransportError::StreamClosedLocally)
        );

        // Exactly one operation reached the manager channel.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    /// UT test case for opening with END_STREAM set.
    ///
    /// # Brief
    /// 1. Creates a handle whose local side is already finished.
    /// 2. Checks that sending trailing metadata is refused.
    #[test]
    fn ut_stream_handle_end_on_open() {
        let (tx, _rx) = unbounded_channel();
        let (_events_tx, events_rx) = bounded_channel(1);
        let mut handle = StreamHandle::new(1, tx, events_rx, true);
        assert_eq!(
            handle.send_trailing_metadata(MetadataList::new()).err(),
            Some(TransportError::StreamClosedLocally)
        );
    }
}
