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

//! Stream bookkeeping: the id-to-stream arena, the per-stream state
//! machine, the pending queues that pace sending against concurrency and
//! flow-control limits, and the per-stream outbound frame queues.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use kite_rpc::{
    Data, ErrorCode, Frame, FrameFlags, Headers, Http2Error, MetadataList, Payload, StreamId,
};

use crate::buffer::{FlowControl, RecvWindow, SendWindow};
use crate::error::DispatchError;
use crate::runtime::UnboundedSender;

pub(crate) const INITIAL_MAX_SEND_STREAM_ID: StreamId = u32::MAX >> 1;
pub(crate) const INITIAL_MAX_RECV_STREAM_ID: StreamId = u32::MAX >> 1;

const DEFAULT_MAX_STREAM_ID: StreamId = u32::MAX >> 1;
const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) enum FrameRecvState {
    OK,
    Ignore,
    Err(Http2Error),
}

#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) enum StreamEndState {
    OK,
    Ignore,
    Err(Http2Error),
}

/// Result of asking a stream for its next outbound frame.
pub(crate) enum NextFrame {
    /// Nothing is queued.
    Idle,
    /// Queued data is blocked on a flow-control window; the stream has
    /// been parked and will be rescheduled by the next WINDOW_UPDATE.
    Pending,
    /// A frame ready for the wire.
    Frame(Frame),
    /// The stream is closed (or unknown); queued output was discarded.
    Closed,
}

//                 +--------+
//        send H   |        |
//     ,-----------|  idle  |
//     |           |        |
//     |           +--------+
//     v               |
// +----------+        | send H (END_STREAM)
// |          |        v
// |   open   |    +----------+
// |          |    |   half   |
// +----------+    |  closed  |
//     |    \      | (local)  |
//     |     \     +----------+
//     |      \        |
//     | send  \ recv  | recv ES /
//     | ES     \ ES   | recv R
//     v         v     v
// +----------+  +--------+
// |   half   |  |        |
// |  closed  |->| closed |
// | (remote) |  |        |
// +----------+  +--------+
#[derive(Copy, Clone, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) enum StreamState {
    Idle,
    // Send and receive travel independently: the peer may answer before
    // the local side finished sending.
    Open {
        send: ActiveState,
        recv: ActiveState,
    },
    // The local side finished sending and is waiting for the peer.
    LocalHalfClosed(ActiveState),
    // The peer finished while the local side is still sending.
    RemoteHalfClosed(ActiveState),
    Closed(CloseReason),
}

#[derive(Copy, Clone, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) enum CloseReason {
    LocalRst,
    RemoteRst,
    RemoteGoAway,
    LocalGoAway,
    EndStream,
}

/// Phase of one direction: the initial metadata has not passed yet, or
/// data (and trailing metadata) is in flight.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) enum ActiveState {
    WaitHeaders,
    WaitData,
}

pub(crate) struct Stream {
    pub(crate) recv_window: RecvWindow,
    pub(crate) send_window: SendWindow,
    pub(crate) state: StreamState,
    // Chunks the call layer queued and the wire has not carried yet.
    outbound: VecDeque<Outbound>,
    // Whether the peer's initial metadata has been delivered; the next
    // header block is trailing metadata.
    pub(crate) saw_initial: bool,
    // Whether the stream occupies a concurrency slot. Streams parked in
    // the pending-concurrency queue do not, so closing one must not give
    // a slot back.
    counted: bool,
}

macro_rules! release_concurrency {
    ($streams: expr, $stream: expr) => {
        if $stream.counted {
            $stream.counted = false;
            $streams.current_concurrent_streams -= 1;
        }
    };
}

enum Outbound {
    Headers {
        metadata: MetadataList,
        end_stream: bool,
    },
    Data {
        chunk: Vec<u8>,
        pos: usize,
        end_stream: bool,
    },
    Trailers {
        metadata: MetadataList,
    },
}

enum FrontKind {
    Metadata,
    Data { stream_available: u32, remaining: usize },
}

pub(crate) struct Streams {
    // The last stream id the peer's GOAWAY promised to process.
    pub(crate) max_send_id: StreamId,
    // The last stream id a local GOAWAY promised to process.
    pub(crate) max_recv_id: StreamId,
    // Highest peer-initiated stream id seen; the transport never enables
    // push, so this stays zero and is what local GOAWAY frames carry.
    pub(crate) latest_remote_id: StreamId,
    pub(crate) stream_recv_window_size: u32,
    pub(crate) stream_send_window_size: u32,
    max_concurrent_streams: u32,
    current_concurrent_streams: u32,
    flow_control: FlowControl,
    pending_concurrency: VecDeque<StreamId>,
    pending_stream_window: HashSet<StreamId>,
    pending_conn_window: VecDeque<StreamId>,
    pending_send: VecDeque<StreamId>,
    pub(crate) stream_map: HashMap<StreamId, Stream>,
    next_stream_id: StreamId,
}

impl Streams {
    pub(crate) fn new(
        recv_window_size: u32,
        send_window_size: u32,
        flow_control: FlowControl,
    ) -> Self {
        Self {
            max_send_id: INITIAL_MAX_SEND_STREAM_ID,
            max_recv_id: INITIAL_MAX_RECV_STREAM_ID,
            latest_remote_id: 0,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            current_concurrent_streams: 0,
            stream_recv_window_size: recv_window_size,
            stream_send_window_size: send_window_size,
            flow_control,
            pending_concurrency: VecDeque::new(),
            pending_stream_window: HashSet::new(),
            pending_conn_window: VecDeque::new(),
            pending_send: VecDeque::new(),
            stream_map: HashMap::new(),
            next_stream_id: 1,
        }
    }

    /// Allocates the next client-initiated (odd) stream id.
    pub(crate) fn generate_id(&mut self) -> Result<StreamId, DispatchError> {
        let id = self.next_stream_id;
        if self.next_stream_id < DEFAULT_MAX_STREAM_ID {
            self.next_stream_id += 2;
            Ok(id)
        } else {
            Err(DispatchError::H2(Http2Error::Connection(
                ErrorCode::ProtocolError,
            )))
        }
    }

    /// Registers a new stream with its initial metadata queued. A counted
    /// stream occupies one of the peer-advertised concurrency slots right
    /// away; an uncounted one waits in the pending-concurrency queue.
    pub(crate) fn insert(
        &mut self,
        id: StreamId,
        metadata: MetadataList,
        end_stream: bool,
        counted: bool,
    ) {
        let send_window = SendWindow::new(self.stream_send_window_size as i32);
        let recv_window = RecvWindow::new(self.stream_recv_window_size as i32);
        let mut outbound = VecDeque::new();
        outbound.push_back(Outbound::Headers {
            metadata,
            end_stream,
        });
        if counted {
            self.current_concurrent_streams += 1;
        }
        self.stream_map.insert(
            id,
            Stream {
                recv_window,
                send_window,
                state: StreamState::Idle,
                outbound,
                saw_initial: false,
                counted,
            },
        );
    }

    /// Queues one payload chunk. Chunks for closed or locally finished
    /// streams are dropped; the handle has already reported the misuse.
    pub(crate) fn queue_data(&mut self, id: StreamId, chunk: Vec<u8>, end_stream: bool) {
        if let Some(stream) = self.stream_map.get_mut(&id) {
            match stream.state {
                StreamState::Closed(_) | StreamState::LocalHalfClosed(_) => {}
                _ => stream.outbound.push_back(Outbound::Data {
                    chunk,
                    pos: 0,
                    end_stream,
                }),
            }
        }
    }

    /// Queues trailing metadata, which half-closes the local side once it
    /// reaches the wire.
    pub(crate) fn queue_trailers(&mut self, id: StreamId, metadata: MetadataList) {
        if let Some(stream) = self.stream_map.get_mut(&id) {
            match stream.state {
                StreamState::Closed(_) | StreamState::LocalHalfClosed(_) => {}
                _ => stream.outbound.push_back(Outbound::Trailers { metadata }),
            }
        }
    }

    /// Produces the stream's next outbound frame, applying flow control and
    /// the send-side state transitions. Streams blocked on a window are
    /// parked and rescheduled when the window refills.
    pub(crate) fn next_outbound_frame(&mut self, id: StreamId) -> Result<NextFrame, Http2Error> {
        let kind = {
            let stream = match self.stream_map.get_mut(&id) {
                None => return Ok(NextFrame::Closed),
                Some(stream) => stream,
            };
            if matches!(stream.state, StreamState::Closed(_)) {
                stream.outbound.clear();
                return Ok(NextFrame::Closed);
            }
            match stream.outbound.front() {
                None => return Ok(NextFrame::Idle),
                Some(Outbound::Headers { .. }) | Some(Outbound::Trailers { .. }) => {
                    FrontKind::Metadata
                }
                Some(Outbound::Data { chunk, pos, .. }) => FrontKind::Data {
                    stream_available: stream.send_window.size_available(),
                    remaining: chunk.len() - *pos,
                },
            }
        };

        match kind {
            FrontKind::Metadata => self.outbound_metadata_frame(id),
            // An empty chunk (a bare half-close) needs no window.
            FrontKind::Data { remaining: 0, .. } => self.outbound_data_frame(id, 0),
            FrontKind::Data {
                stream_available, ..
            } => {
                if stream_available == 0 {
                    self.pending_stream_window.insert(id);
                    return Ok(NextFrame::Pending);
                }
                let conn_available = self.flow_control.send_size_available() as u32;
                if conn_available == 0 {
                    self.pending_conn_window.push_back(id);
                    return Ok(NextFrame::Pending);
                }
                self.outbound_data_frame(id, stream_available.min(conn_available))
            }
        }
    }

    fn outbound_metadata_frame(&mut self, id: StreamId) -> Result<NextFrame, Http2Error> {
        let (metadata, end_stream, is_initial) = {
            let stream = match self.stream_map.get_mut(&id) {
                Some(stream) => stream,
                None => return Ok(NextFrame::Closed),
            };
            match stream.outbound.pop_front() {
                Some(Outbound::Headers {
                    metadata,
                    end_stream,
                }) => (metadata, end_stream, true),
                Some(Outbound::Trailers { metadata }) => (metadata, true, false),
                _ => unreachable!("peeked metadata entry disappeared"),
            }
        };
        let state = if is_initial {
            self.send_headers_transition(id, end_stream)
        } else {
            self.send_trailers_transition(id)
        };
        if let FrameRecvState::Err(e) = state {
            return Err(e);
        }
        let mut flags = FrameFlags::empty();
        flags.set_end_headers(true);
        flags.set_end_stream(end_stream);
        Ok(NextFrame::Frame(Frame::new(
            id,
            flags,
            Payload::Headers(Headers::new(metadata)),
        )))
    }

    fn outbound_data_frame(&mut self, id: StreamId, budget: u32) -> Result<NextFrame, Http2Error> {
        let (bytes, eos) = {
            let stream = match self.stream_map.get_mut(&id) {
                Some(stream) => stream,
                None => return Ok(NextFrame::Closed),
            };
            let (bytes, eos, finished) = match stream.outbound.front_mut() {
                Some(Outbound::Data {
                    chunk,
                    pos,
                    end_stream,
                }) => {
                    let len = (chunk.len() - *pos).min(budget as usize);
                    let bytes = chunk[*pos..*pos + len].to_vec();
                    *pos += len;
                    let finished = *pos == chunk.len();
                    (bytes, finished && *end_stream, finished)
                }
                _ => unreachable!("peeked data entry disappeared"),
            };
            if finished {
                stream.outbound.pop_front();
            }
            stream.send_window.send_data(bytes.len() as u32);
            (bytes, eos)
        };
        self.flow_control.send_data(bytes.len() as u32);
        if let FrameRecvState::Err(e) = self.send_data_transition(id, eos) {
            return Err(e);
        }
        let mut flags = FrameFlags::empty();
        flags.set_end_stream(eos);
        Ok(NextFrame::Frame(Frame::new(
            id,
            flags,
            Payload::Data(Data::new(bytes)),
        )))
    }

    fn send_headers_transition(&mut self, id: StreamId, eos: bool) -> FrameRecvState {
        match self.stream_map.get_mut(&id) {
            None => FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            Some(stream) => match stream.state {
                StreamState::Idle => {
                    stream.state = if eos {
                        StreamState::LocalHalfClosed(ActiveState::WaitHeaders)
                    } else {
                        StreamState::Open {
                            send: ActiveState::WaitData,
                            recv: ActiveState::WaitHeaders,
                        }
                    };
                    FrameRecvState::OK
                }
                _ => FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            },
        }
    }

    fn send_data_transition(&mut self, id: StreamId, eos: bool) -> FrameRecvState {
        match self.stream_map.get_mut(&id) {
            None => FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            Some(stream) => match stream.state {
                StreamState::Open {
                    send: ActiveState::WaitData,
                    recv,
                } => {
                    if eos {
                        stream.state = StreamState::LocalHalfClosed(recv);
                    }
                    FrameRecvState::OK
                }
                StreamState::RemoteHalfClosed(ActiveState::WaitData) => {
                    if eos {
                        stream.state = StreamState::Closed(CloseReason::EndStream);
                        release_concurrency!(self, stream);
                    }
                    FrameRecvState::OK
                }
                _ => FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            },
        }
    }

    fn send_trailers_transition(&mut self, id: StreamId) -> FrameRecvState {
        // Trailing metadata always carries END_STREAM.
        self.send_data_transition(id, true)
    }

    /// Applies an incoming header block to the stream's receive side.
    pub(crate) fn recv_headers(&mut self, id: StreamId, eos: bool) -> FrameRecvState {
        if id > self.max_recv_id {
            return FrameRecvState::Ignore;
        }
        match self.stream_map.get_mut(&id) {
            None => FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            Some(stream) => match stream.state {
                StreamState::Idle => {
                    stream.state = if eos {
                        StreamState::RemoteHalfClosed(ActiveState::WaitHeaders)
                    } else {
                        StreamState::Open {
                            send: ActiveState::WaitHeaders,
                            recv: ActiveState::WaitData,
                        }
                    };
                    FrameRecvState::OK
                }
                StreamState::Open {
                    send,
                    recv: ActiveState::WaitHeaders,
                } => {
                    stream.state = if eos {
                        StreamState::RemoteHalfClosed(send)
                    } else {
                        StreamState::Open {
                            send,
                            recv: ActiveState::WaitData,
                        }
                    };
                    FrameRecvState::OK
                }
                StreamState::Open {
                    send,
                    recv: ActiveState::WaitData,
                } => {
                    // A second header block is trailing metadata and must
                    // end the peer's side.
                    if !eos {
                        return FrameRecvState::Err(Http2Error::Connection(
                            ErrorCode::ProtocolError,
                        ));
                    }
                    stream.state = StreamState::RemoteHalfClosed(send);
                    FrameRecvState::OK
                }
                StreamState::LocalHalfClosed(ActiveState::WaitHeaders) => {
                    stream.state = if eos {
                        release_concurrency!(self, stream);
                        StreamState::Closed(CloseReason::EndStream)
                    } else {
                        StreamState::LocalHalfClosed(ActiveState::WaitData)
                    };
                    FrameRecvState::OK
                }
                StreamState::LocalHalfClosed(ActiveState::WaitData) => {
                    if !eos {
                        return FrameRecvState::Err(Http2Error::Connection(
                            ErrorCode::ProtocolError,
                        ));
                    }
                    stream.state = StreamState::Closed(CloseReason::EndStream);
                    release_concurrency!(self, stream);
                    FrameRecvState::OK
                }
                StreamState::Closed(CloseReason::LocalRst | CloseReason::LocalGoAway) => {
                    FrameRecvState::Ignore
                }
                _ => FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            },
        }
    }

    /// Applies an incoming DATA frame to the stream's receive side.
    pub(crate) fn recv_data(&mut self, id: StreamId, eos: bool) -> FrameRecvState {
        if id > self.max_recv_id {
            return FrameRecvState::Ignore;
        }
        match self.stream_map.get_mut(&id) {
            None => FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            Some(stream) => match stream.state {
                StreamState::Open {
                    send,
                    recv: ActiveState::WaitData,
                } => {
                    if eos {
                        stream.state = StreamState::RemoteHalfClosed(send);
                    }
                    FrameRecvState::OK
                }
                StreamState::LocalHalfClosed(ActiveState::WaitData) => {
                    if eos {
                        stream.state = StreamState::Closed(CloseReason::EndStream);
                        release_concurrency!(self, stream);
                    }
                    FrameRecvState::OK
                }
                StreamState::Closed(CloseReason::LocalRst | CloseReason::LocalGoAway) => {
                    FrameRecvState::Ignore
                }
                _ => FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            },
        }
    }

    /// Applies a peer RST_STREAM.
    pub(crate) fn recv_remote_reset(&mut self, id: StreamId) -> StreamEndState {
        if id > self.max_recv_id {
            return StreamEndState::Ignore;
        }
        match self.stream_map.get_mut(&id) {
            None => StreamEndState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            Some(stream) => match stream.state {
                StreamState::Closed(..) => StreamEndState::Ignore,
                _ => {
                    stream.state = StreamState::Closed(CloseReason::RemoteRst);
                    stream.outbound.clear();
                    release_concurrency!(self, stream);
                    StreamEndState::OK
                }
            },
        }
    }

    /// Closes a stream from the local side (cancellation or a local stream
    /// error), releasing its queued output immediately.
    pub(crate) fn send_local_reset(&mut self, id: StreamId) -> StreamEndState {
        match self.stream_map.get_mut(&id) {
            None => StreamEndState::Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            Some(stream) => match stream.state {
                StreamState::Closed(
                    CloseReason::LocalRst
                    | CloseReason::LocalGoAway
                    | CloseReason::RemoteRst
                    | CloseReason::RemoteGoAway,
                ) => StreamEndState::Ignore,
                StreamState::Closed(CloseReason::EndStream) => {
                    stream.state = StreamState::Closed(CloseReason::LocalRst);
                    StreamEndState::Ignore
                }
                _ => {
                    stream.state = StreamState::Closed(CloseReason::LocalRst);
                    stream.outbound.clear();
                    release_concurrency!(self, stream);
                    StreamEndState::OK
                }
            },
        }
    }

    /// Fails every stream above the peer's GOAWAY last-stream-id and
    /// returns their ids.
    pub(crate) fn get_goaway_streams(&mut self, last_stream_id: StreamId) -> Vec<StreamId> {
        let mut ids = vec![];
        for (id, stream) in self.stream_map.iter_mut() {
            if *id > last_stream_id {
                if matches!(stream.state, StreamState::Closed(_)) {
                    continue;
                }
                release_concurrency!(self, stream);
                stream.state = StreamState::Closed(CloseReason::RemoteGoAway);
                stream.outbound.clear();
                ids.push(*id);
            }
        }
        ids
    }

    /// Fails every live stream on connection teardown and returns their
    /// ids. Every teardown path notifies each live stream exactly once.
    pub(crate) fn get_all_unclosed_streams(&mut self) -> Vec<StreamId> {
        let mut ids = vec![];
        for (id, stream) in self.stream_map.iter_mut() {
            match stream.state {
                StreamState::Closed(_) => {}
                _ => {
                    stream.outbound.clear();
                    stream.state = StreamState::Closed(CloseReason::LocalGoAway);
                    ids.push(*id);
                }
            }
        }
        ids
    }

    pub(crate) fn clear_streams_states(&mut self) {
        self.pending_stream_window.clear();
        self.pending_send.clear();
        self.pending_conn_window.clear();
        self.pending_concurrency.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.stream_map
            .values()
            .all(|stream| matches!(stream.state, StreamState::Closed(_)))
    }

    pub(crate) fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.stream_map.get(&id).map(|stream| stream.state)
    }

    pub(crate) fn saw_initial(&self, id: StreamId) -> bool {
        self.stream_map
            .get(&id)
            .map(|stream| stream.saw_initial)
            .unwrap_or(false)
    }

    pub(crate) fn mark_initial_seen(&mut self, id: StreamId) {
        if let Some(stream) = self.stream_map.get_mut(&id) {
            stream.saw_initial = true;
        }
    }

    pub(crate) fn reach_max_concurrency(&self) -> bool {
        self.current_concurrent_streams >= self.max_concurrent_streams
    }

    pub(crate) fn apply_max_concurrent_streams(&mut self, num: u32) {
        self.max_concurrent_streams = num;
    }

    /// Applies the peer's SETTINGS_INITIAL_WINDOW_SIZE to every stream's
    /// send window and reschedules streams that were parked on an empty
    /// window.
    pub(crate) fn apply_send_initial_window_size(&mut self, size: u32) -> Result<(), Http2Error> {
        let current = self.stream_send_window_size;
        self.stream_send_window_size = size;

        match current.cmp(&size) {
            Ordering::Less => {
                let excess = size - current;
                for stream in self.stream_map.values_mut() {
                    stream.send_window.increase_size(excess)?;
                }
                for id in self.pending_stream_window.drain() {
                    self.pending_send.push_back(id);
                }
            }
            Ordering::Greater => {
                let excess = current - size;
                for stream in self.stream_map.values_mut() {
                    stream.send_window.reduce_size(excess);
                }
            }
            Ordering::Equal => {}
        }
        Ok(())
    }

    /// Applies an acknowledged local SETTINGS_INITIAL_WINDOW_SIZE to every
    /// stream's receive window.
    pub(crate) fn apply_recv_initial_window_size(&mut self, size: u32) {
        let current = self.stream_recv_window_size;
        self.stream_recv_window_size = size;
        match current.cmp(&size) {
            Ordering::Less => {
                let extra = size - current;
                for stream in self.stream_map.values_mut() {
                    stream.recv_window.increase_notification(extra);
                    stream.recv_window.increase_actual(extra);
                }
            }
            Ordering::Greater => {
                for stream in self.stream_map.values_mut() {
                    stream.recv_window.reduce_notification(current - size);
                }
            }
            Ordering::Equal => {}
        }
    }

    /// Accounts received DATA bytes against a stream's receive window and
    /// emits the WINDOW_UPDATE once enough is unreleased. Driving the
    /// window negative is a fatal flow-control violation.
    pub(crate) fn release_stream_recv_window(
        &mut self,
        id: StreamId,
        size: u32,
        sender: &UnboundedSender<Frame>,
    ) -> Result<(), DispatchError> {
        if let Some(stream) = self.stream_map.get_mut(&id) {
            if stream.recv_window.notification_available() < size {
                return Err(Http2Error::Connection(ErrorCode::FlowControlError).into());
            }
            stream.recv_window.recv_data(size);
            if stream.recv_window.unreleased_size().is_some() {
                if !stream.is_receiving() {
                    return Ok(());
                }
                if let Some(window_update) = stream.recv_window.check_window_update(id) {
                    sender
                        .send(window_update)
                        .map_err(|_e| DispatchError::ChannelClosed)?;
                }
            }
        }
        Ok(())
    }

    /// Connection-level counterpart of [`Streams::release_stream_recv_window`].
    pub(crate) fn release_conn_recv_window(
        &mut self,
        size: u32,
        sender: &UnboundedSender<Frame>,
    ) -> Result<(), DispatchError> {
        if self.flow_control.recv_notification_size_available() < size {
            return Err(Http2Error::Connection(ErrorCode::FlowControlError).into());
        }
        self.flow_control.recv_data(size);
        if let Some(window_update) = self.flow_control.check_conn_recv_window_update() {
            sender
                .send(window_update)
                .map_err(|_e| DispatchError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Applies a connection-level WINDOW_UPDATE.
    pub(crate) fn increase_conn_send_window(&mut self, size: u32) -> Result<(), Http2Error> {
        self.flow_control.increase_send_size(size)
    }

    /// Reschedules every stream parked on the connection window.
    pub(crate) fn reassign_conn_send_window(&mut self) {
        while let Some(id) = self.pending_conn_window.pop_front() {
            self.pending_send.push_back(id);
        }
    }

    /// Applies a stream-level WINDOW_UPDATE and reschedules the stream if
    /// it was parked.
    pub(crate) fn reassign_stream_send_window(
        &mut self,
        id: StreamId,
        size: u32,
    ) -> Result<(), Http2Error> {
        if let Some(stream) = self.stream_map.get_mut(&id) {
            stream.send_window.increase_size(size).map_err(|_| {
                // Overflowing a single stream's window resets the stream,
                // not the connection.
                Http2Error::Stream(id, ErrorCode::FlowControlError)
            })?;
        }
        if self.pending_stream_window.remove(&id) {
            self.pending_send.push_back(id);
        }
        Ok(())
    }

    pub(crate) fn push_back_pending_send(&mut self, id: StreamId) {
        self.pending_send.push_back(id);
    }

    pub(crate) fn push_pending_concurrency(&mut self, id: StreamId) {
        self.pending_concurrency.push_back(id);
    }

    pub(crate) fn is_pending_concurrency_empty(&self) -> bool {
        self.pending_concurrency.is_empty()
    }

    pub(crate) fn next_pending_stream(&mut self) -> Option<StreamId> {
        self.pending_send.pop_front()
    }

    pub(crate) fn pending_stream_num(&self) -> usize {
        self.pending_send.len()
    }

    /// Moves parked streams into the send queue while concurrency slots
    /// are available. Streams that were cancelled while parked are
    /// skipped.
    pub(crate) fn try_consume_pending_concurrency(&mut self) {
        while !self.reach_max_concurrency() {
            match self.pending_concurrency.pop_front() {
                None => return,
                Some(id) => {
                    if let Some(stream) = self.stream_map.get_mut(&id) {
                        if matches!(stream.state, StreamState::Closed(_)) {
                            continue;
                        }
                        stream.counted = true;
                        self.current_concurrent_streams += 1;
                        self.pending_send.push_back(id);
                    }
                }
            }
        }
    }
}

impl Stream {
    // WINDOW_UPDATE is only worth sending while the stream still receives.
    fn is_receiving(&self) -> bool {
        matches!(
            self.state,
            StreamState::Idle
                | StreamState::Open {
                    recv: ActiveState::WaitData,
                    ..
                }
                | StreamState::LocalHalfClosed(ActiveState::WaitData)
        )
    }
}

#[cfg(test)]
mod ut_streams {
    use super::*;
    use kite_rpc::SharedInterner;

    fn streams() -> Streams {
        Streams::new(100, 100, FlowControl::new(100, 100))
    }

    fn metadata() -> MetadataList {
        SharedInterner::new().list_from_pairs([(":method", "POST"), (":path", "/svc/Method")])
    }

    fn open_stream(streams: &mut Streams, end_stream: bool) -> StreamId {
        let id = streams.generate_id().unwrap();
        streams.insert(id, metadata(), end_stream, true);
        id
    }

    fn expect_frame(next: NextFrame) -> Frame {
        match next {
            NextFrame::Frame(frame) => frame,
            NextFrame::Idle => panic!("stream unexpectedly idle!"),
            NextFrame::Pending => panic!("stream unexpectedly blocked!"),
            NextFrame::Closed => panic!("stream unexpectedly closed!"),
        }
    }

    /// UT test case for `Streams::generate_id`.
    ///
    /// # Brief
    /// 1. Generates several stream ids.
    /// 2. Checks they are odd and increasing.
    #[test]
    fn ut_streams_generate_id() {
        let mut streams = streams();
        assert_eq!(streams.generate_id().unwrap(), 1);
        assert_eq!(streams.generate_id().unwrap(), 3);
        assert_eq!(streams.generate_id().unwrap(), 5);
    }

    /// UT test case for the outbound pump of a full request.
    ///
    /// # Brief
    /// 1. Opens a stream, queues data with END_STREAM.
    /// 2. Pumps frames and checks HEADERS then DATA, with the send window
    ///    debited and the state reaching LocalHalfClosed.
    #[test]
    fn ut_streams_outbound_pump() {
        let mut streams = streams();
        let id = open_stream(&mut streams, false);

        let frame = expect_frame(streams.next_outbound_frame(id).unwrap());
        assert!(matches!(frame.payload(), Payload::Headers(_)));
        assert!(!frame.flags().is_end_stream());
        assert_eq!(
            streams.stream_state(id).unwrap(),
            StreamState::Open {
                send: ActiveState::WaitData,
                recv: ActiveState::WaitHeaders,
            }
        );

        streams.queue_data(id, b"hello".to_vec(), true);
        let frame = expect_frame(streams.next_outbound_frame(id).unwrap());
        match frame.payload() {
            Payload::Data(data) => assert_eq!(data.data(), b"hello"),
            _ => panic!("unexpected payload type!"),
        }
        assert!(frame.flags().is_end_stream());
        assert_eq!(
            streams.stream_state(id).unwrap(),
            StreamState::LocalHalfClosed(ActiveState::WaitHeaders)
        );
        let stream = streams.stream_map.get(&id).unwrap();
        assert_eq!(stream.send_window.size_available(), 95);

        assert!(matches!(
            streams.next_outbound_frame(id).unwrap(),
            NextFrame::Idle
        ));
    }

    /// UT test case for window-blocked sending.
    ///
    /// # Brief
    /// 1. Opens a stream whose send window is empty.
    /// 2. Checks the stream parks as Pending and no DATA frame is produced.
    /// 3. Replenishes the window and checks the stream is rescheduled and
    ///    the data drains.
    #[test]
    fn ut_streams_outbound_window_blocked() {
        let mut streams = Streams::new(100, 0, FlowControl::new(100, 100));
        let id = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(id).unwrap());

        streams.queue_data(id, b"hello".to_vec(), true);
        assert!(matches!(
            streams.next_outbound_frame(id).unwrap(),
            NextFrame::Pending
        ));
        assert_eq!(streams.pending_stream_num(), 0);

        streams.reassign_stream_send_window(id, 5).unwrap();
        assert_eq!(streams.next_pending_stream(), Some(id));
        let frame = expect_frame(streams.next_outbound_frame(id).unwrap());
        match frame.payload() {
            Payload::Data(data) => assert_eq!(data.data(), b"hello"),
            _ => panic!("unexpected payload type!"),
        }
    }

    /// UT test case for partial sends against a small window.
    ///
    /// # Brief
    /// 1. Gives the stream a 3-byte window and queues 5 bytes with
    ///    END_STREAM.
    /// 2. Checks the first frame carries 3 bytes without END_STREAM, then
    ///    the remainder after a WINDOW_UPDATE carries the flag.
    #[test]
    fn ut_streams_outbound_partial_window() {
        let mut streams = Streams::new(100, 3, FlowControl::new(100, 100));
        let id = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(id).unwrap());

        streams.queue_data(id, b"hello".to_vec(), true);
        let frame = expect_frame(streams.next_outbound_frame(id).unwrap());
        match frame.payload() {
            Payload::Data(data) => assert_eq!(data.data(), b"hel"),
            _ => panic!("unexpected payload type!"),
        }
        assert!(!frame.flags().is_end_stream());

        assert!(matches!(
            streams.next_outbound_frame(id).unwrap(),
            NextFrame::Pending
        ));
        streams.reassign_stream_send_window(id, 10).unwrap();
        let frame = expect_frame(streams.next_outbound_frame(id).unwrap());
        match frame.payload() {
            Payload::Data(data) => assert_eq!(data.data(), b"lo"),
            _ => panic!("unexpected payload type!"),
        }
        assert!(frame.flags().is_end_stream());
    }

    /// UT test case for trailing metadata sends.
    ///
    /// # Brief
    /// 1. Opens a stream, sends data without END_STREAM, then trailers.
    /// 2. Checks the trailer frame flags and the final state.
    #[test]
    fn ut_streams_outbound_trailers() {
        let mut streams = streams();
        let id = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(id).unwrap());
        streams.queue_data(id, b"hi".to_vec(), false);
        expect_frame(streams.next_outbound_frame(id).unwrap());
        streams.queue_trailers(id, metadata());
        let frame = expect_frame(streams.next_outbound_frame(id).unwrap());
        assert!(matches!(frame.payload(), Payload::Headers(_)));
        assert!(frame.flags().is_end_stream());
        assert_eq!(
            streams.stream_state(id).unwrap(),
            StreamState::LocalHalfClosed(ActiveState::WaitHeaders)
        );
    }

    /// UT test case for the receive-side state machine.
    ///
    /// # Brief
    /// 1. Walks a stream through HEADERS, DATA with END_STREAM from the
    ///    peer after a local half-close.
    /// 2. Checks the deterministic path to Closed.
    #[test]
    fn ut_streams_recv_transitions() {
        let mut streams = streams();
        let id = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(id).unwrap());
        streams.queue_data(id, b"hello".to_vec(), true);
        expect_frame(streams.next_outbound_frame(id).unwrap());

        assert_eq!(streams.recv_headers(id, false), FrameRecvState::OK);
        assert_eq!(
            streams.stream_state(id).unwrap(),
            StreamState::LocalHalfClosed(ActiveState::WaitData)
        );
        assert_eq!(streams.recv_data(id, false), FrameRecvState::OK);
        assert_eq!(streams.recv_data(id, true), FrameRecvState::OK);
        assert_eq!(
            streams.stream_state(id).unwrap(),
            StreamState::Closed(CloseReason::EndStream)
        );

        // Further frames on the closed stream are protocol errors, since
        // the closure was not locally initiated.
        assert_eq!(
            streams.recv_data(id, false),
            FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test case for trailing metadata reception.
    ///
    /// # Brief
    /// 1. Receives initial metadata, then a trailing block with END_STREAM.
    /// 2. Receives a trailing block without END_STREAM on another stream.
    /// 3. Checks the results.
    #[test]
    fn ut_streams_recv_trailers() {
        let mut streams = streams();
        let id = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(id).unwrap());
        streams.queue_data(id, b"hi".to_vec(), true);
        expect_frame(streams.next_outbound_frame(id).unwrap());

        assert_eq!(streams.recv_headers(id, false), FrameRecvState::OK);
        assert_eq!(streams.recv_data(id, false), FrameRecvState::OK);
        assert_eq!(streams.recv_headers(id, true), FrameRecvState::OK);
        assert_eq!(
            streams.stream_state(id).unwrap(),
            StreamState::Closed(CloseReason::EndStream)
        );

        let id = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(id).unwrap());
        assert_eq!(streams.recv_headers(id, false), FrameRecvState::OK);
        assert_eq!(streams.recv_data(id, false), FrameRecvState::OK);
        assert_eq!(
            streams.recv_headers(id, false),
            FrameRecvState::Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test case for local and remote resets.
    ///
    /// # Brief
    /// 1. Resets one stream locally and one from the peer.
    /// 2. Checks repeat resets are ignored and queued output is dropped.
    #[test]
    fn ut_streams_resets() {
        let mut streams = streams();
        let id = open_stream(&mut streams, false);
        streams.queue_data(id, b"pending".to_vec(), true);
        assert_eq!(streams.send_local_reset(id), StreamEndState::OK);
        assert_eq!(streams.send_local_reset(id), StreamEndState::Ignore);
        assert!(matches!(
            streams.next_outbound_frame(id).unwrap(),
            NextFrame::Closed
        ));

        let id = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(id).unwrap());
        assert_eq!(streams.recv_remote_reset(id), StreamEndState::OK);
        assert_eq!(streams.recv_remote_reset(id), StreamEndState::Ignore);
        assert_eq!(
            streams.stream_state(id).unwrap(),
            StreamState::Closed(CloseReason::RemoteRst)
        );

        assert_eq!(
            streams.send_local_reset(99),
            StreamEndState::Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test case for GOAWAY stream collection.
    ///
    /// # Brief
    /// 1. Opens three streams and applies a GOAWAY covering the first.
    /// 2. Checks only streams above the last-stream-id are failed.
    #[test]
    fn ut_streams_goaway() {
        let mut streams = streams();
        let first = open_stream(&mut streams, false);
        let second = open_stream(&mut streams, false);
        let third = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(first).unwrap());
        expect_frame(streams.next_outbound_frame(second).unwrap());

        let failed = streams.get_goaway_streams(first);
        assert_eq!(failed.len(), 2);
        assert!(failed.contains(&second) && failed.contains(&third));
        assert_eq!(
            streams.stream_state(second).unwrap(),
            StreamState::Closed(CloseReason::RemoteGoAway)
        );
        assert!(matches!(
            streams.stream_state(first).unwrap(),
            StreamState::Open { .. }
        ));
    }

    /// UT test case for concurrency limiting.
    ///
    /// # Brief
    /// 1. Limits concurrency to one and parks a second stream.
    /// 2. Closes the first stream and consumes the parked one.
    #[test]
    fn ut_streams_concurrency() {
        let mut streams = streams();
        streams.apply_max_concurrent_streams(1);
        let first = open_stream(&mut streams, false);
        assert!(streams.reach_max_concurrency());
        let second = streams.generate_id().unwrap();
        streams.insert(second, metadata(), true, false);
        streams.push_pending_concurrency(second);

        streams.try_consume_pending_concurrency();
        assert_eq!(streams.pending_stream_num(), 0);

        assert_eq!(streams.send_local_reset(first), StreamEndState::OK);
        streams.try_consume_pending_concurrency();
        assert_eq!(streams.next_pending_stream(), Some(second));
    }

    /// UT test case for initial-window-size application.
    ///
    /// # Brief
    /// 1. Adjusts the peer's initial window size up and down.
    /// 2. Checks every live stream's send window follows.
    #[test]
    fn ut_streams_apply_send_initial_window_size() {
        let mut streams = streams();
        let id = open_stream(&mut streams, false);

        assert!(streams.apply_send_initial_window_size(200).is_ok());
        let stream = streams.stream_map.get(&id).unwrap();
        assert_eq!(stream.send_window.size_available(), 200);

        assert!(streams.apply_send_initial_window_size(50).is_ok());
        let stream = streams.stream_map.get(&id).unwrap();
        assert_eq!(stream.send_window.size_available(), 50);
    }

    /// UT test case for receive-window release and violation.
    ///
    /// # Brief
    /// 1. Releases received bytes within the window.
    /// 2. Releases more than the remaining window.
    /// 3. Checks the flow-control violation.
    #[test]
    fn ut_streams_release_recv_window() {
        let (tx, mut rx) = crate::runtime::unbounded_channel();
        let mut streams = streams();
        let id = open_stream(&mut streams, false);
        expect_frame(streams.next_outbound_frame(id).unwrap());
        assert_eq!(streams.recv_headers(id, false), FrameRecvState::OK);

        assert!(streams.release_stream_recv_window(id, 60, &tx).is_ok());
        // More than half the 100-byte window was consumed, so an update
        // frame was emitted.
        let update = rx.try_recv().unwrap();
        assert!(matches!(update.payload(), Payload::WindowUpdate(_)));

        assert_eq!(
            streams.release_conn_recv_window(101, &tx),
            Err(DispatchError::H2(Http2Error::Connection(
                ErrorCode::FlowControlError
            )))
        );
    }
}
