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

//! The connection manager task.
//!
//! The manager is the single owner of all shared connection state. It
//! dispatches decoded frames to streams, drains call-layer operations,
//! paces outbound frames against flow-control and concurrency limits, and
//! converts failures into RST_STREAM or GOAWAY plus exactly one terminal
//! event per live stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use kite_rpc::{
    ErrorCode, Frame, FrameFlags, Goaway, Http2Error, Payload, Ping, RstStream, Setting, StreamId,
};
use tracing::{debug, warn};

use crate::call::{CallMessage, StreamEvent, StreamStatus};
use crate::dispatcher::{OutputMessage, SettingsState, SettingsSync, StreamController};
use crate::error::DispatchError;
use crate::runtime::{BoundedReceiver, UnboundedReceiver, UnboundedSender};
use crate::streams::{FrameRecvState, NextFrame, StreamEndState, StreamState};

#[derive(Copy, Clone)]
enum ManagerState {
    // Parked event deliveries must drain before new frames are taken.
    Send,
    Receive,
    Exit(DispatchError),
}

pub(crate) struct ConnManager {
    state: ManagerState,
    next_state: ManagerState,
    // Synchronizes locally sent SETTINGS frames with their acknowledgment.
    settings: Arc<Mutex<SettingsSync>>,
    // Frames bound for the write coroutine.
    input_tx: UnboundedSender<Frame>,
    // Frames decoded by the read coroutine.
    resp_rx: BoundedReceiver<OutputMessage>,
    // Operations submitted by stream handles.
    req_rx: UnboundedReceiver<CallMessage>,
    controller: StreamController,
}

impl Future for ConnManager {
    type Output = Result<(), DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let manager = self.get_mut();
        loop {
            match manager.state {
                ManagerState::Send => {
                    if manager.poll_blocked_frames(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
                ManagerState::Receive => match manager.resp_rx.poll_recv(cx) {
                    Poll::Ready(Some(message)) => match message {
                        OutputMessage::Output(frame) => {
                            if manager.poll_recv_message(cx, frame)?.is_pending() {
                                return Poll::Pending;
                            }
                        }
                        OutputMessage::OutputExit(e) => {
                            // After a GOAWAY the reader's exit is expected;
                            // keep draining the allowed streams.
                            if manager.controller.go_away_error_code.is_some() {
                                continue;
                            }
                            if manager.manage_resp_error(cx, e)?.is_pending() {
                                return Poll::Pending;
                            }
                        }
                    },
                    Poll::Ready(None) => {
                        return manager.poll_channel_closed_exit(cx);
                    }
                    Poll::Pending => {
                        return manager.manage_pending_state(cx);
                    }
                },
                ManagerState::Exit(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl ConnManager {
    pub(crate) fn new(
        settings: Arc<Mutex<SettingsSync>>,
        input_tx: UnboundedSender<Frame>,
        resp_rx: BoundedReceiver<OutputMessage>,
        req_rx: UnboundedReceiver<CallMessage>,
        controller: StreamController,
    ) -> Self {
        Self {
            state: ManagerState::Receive,
            next_state: ManagerState::Receive,
            settings,
            input_tx,
            resp_rx,
            req_rx,
            controller,
        }
    }

    fn manage_pending_state(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), DispatchError>> {
        // A previously received GOAWAY: exit once the allowed streams have
        // completed.
        if let Some(error_code) = self.controller.go_away_error_code {
            self.poll_deal_with_go_away(error_code)?;
            return Poll::Pending;
        }
        self.poll_recv_request(cx)?;
        self.poll_input_request(cx)?;
        if self.controller.has_blocked_messages() {
            self.state = ManagerState::Send;
            self.next_state = ManagerState::Receive;
        }
        Poll::Pending
    }

    // Drains call operations submitted by stream handles. Stream ids are
    // allocated here, inside the serialized manager, so HEADERS go out in
    // increasing id order.
    fn poll_recv_request(&mut self, cx: &mut Context<'_>) -> Result<(), DispatchError> {
        loop {
            let message = match self.req_rx.poll_recv(cx) {
                Poll::Ready(Some(message)) => message,
                Poll::Ready(None) => return Err(DispatchError::ChannelClosed),
                Poll::Pending => break,
            };
            match message {
                CallMessage::Open {
                    token,
                    metadata,
                    end_stream,
                    events,
                } => {
                    let id = match self.controller.streams.generate_id() {
                        Ok(id) => id,
                        Err(e) => {
                            let _ = events
                                .try_send(StreamEvent::Closed(StreamStatus::TransportError(e)));
                            break;
                        }
                    };
                    let counted = !self.controller.streams.reach_max_concurrency()
                        && self.controller.streams.is_pending_concurrency_empty();
                    if counted {
                        self.controller.streams.push_back_pending_send(id);
                    } else {
                        self.controller.streams.push_pending_concurrency(id);
                    }
                    self.controller.tokens.insert(token, id);
                    self.controller.senders.insert(id, events);
                    self.controller
                        .streams
                        .insert(id, metadata, end_stream, counted);
                }
                CallMessage::Data {
                    token,
                    chunk,
                    end_stream,
                } => {
                    if let Some(&id) = self.controller.tokens.get(&token) {
                        self.controller.streams.queue_data(id, chunk, end_stream);
                        self.controller.streams.push_back_pending_send(id);
                    }
                }
                CallMessage::Trailers { token, metadata } => {
                    if let Some(&id) = self.controller.tokens.get(&token) {
                        self.controller.streams.queue_trailers(id, metadata);
                        self.controller.streams.push_back_pending_send(id);
                    }
                }
                CallMessage::Cancel { token, code } => {
                    if let Some(id) = self.controller.tokens.remove(&token) {
                        if let StreamEndState::OK = self.controller.streams.send_local_reset(id) {
                            let frame = Frame::new(
                                id,
                                FrameFlags::empty(),
                                Payload::RstStream(RstStream::new(code.into_code())),
                            );
                            self.input_tx
                                .send(frame)
                                .map_err(|_e| DispatchError::ChannelClosed)?;
                        }
                        // The handle reports its own terminal state; the
                        // event channel just goes away.
                        self.controller.senders.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    // Pumps queued outbound frames of every scheduled stream.
    fn poll_input_request(&mut self, cx: &mut Context<'_>) -> Result<(), DispatchError> {
        self.controller.streams.try_consume_pending_concurrency();
        let size = self.controller.streams.pending_stream_num();
        let mut index = 0;
        while index < size {
            match self.controller.streams.next_pending_stream() {
                None => break,
                Some(id) => self.pump_stream_frames(cx, id)?,
            }
            index += 1;
        }
        Ok(())
    }

    fn pump_stream_frames(
        &mut self,
        cx: &mut Context<'_>,
        id: StreamId,
    ) -> Result<(), DispatchError> {
        loop {
            match self.controller.streams.next_outbound_frame(id) {
                Ok(NextFrame::Frame(frame)) => {
                    self.input_tx
                        .send(frame)
                        .map_err(|_e| DispatchError::ChannelClosed)?;
                    // A local half-close after the peer's completes the
                    // stream; this is the only send-side close path.
                    if matches!(
                        self.controller.streams.stream_state(id),
                        Some(StreamState::Closed(_))
                    ) {
                        let _ = self.controller.send_message_to_stream(
                            cx,
                            id,
                            vec![StreamEvent::Closed(StreamStatus::Completed)],
                        );
                        return Ok(());
                    }
                }
                Ok(NextFrame::Idle) | Ok(NextFrame::Pending) | Ok(NextFrame::Closed) => {
                    return Ok(())
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn poll_recv_message(
        &mut self,
        cx: &mut Context<'_>,
        frame: Frame,
    ) -> Poll<Result<(), DispatchError>> {
        match self.poll_recv_frame(cx, frame) {
            Poll::Ready(Err(kind)) => self.manage_resp_error(cx, kind),
            Poll::Pending => {
                self.state = ManagerState::Send;
                self.next_state = ManagerState::Receive;
                Poll::Pending
            }
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
        }
    }

    fn poll_recv_frame(
        &mut self,
        cx: &mut Context<'_>,
        frame: Frame,
    ) -> Poll<Result<(), DispatchError>> {
        match frame.payload() {
            Payload::Settings(_) => {
                self.recv_settings_frame(frame)?;
            }
            Payload::Ping(_) => {
                self.recv_ping_frame(frame)?;
            }
            // Push is never enabled on this transport.
            Payload::PushPromise(_) => {
                return Poll::Ready(Err(Http2Error::Connection(ErrorCode::ProtocolError).into()));
            }
            Payload::Goaway(_) => {
                return self.recv_go_away_frame(cx, frame).map_err(Into::into);
            }
            Payload::RstStream(_) => {
                return self.recv_reset_frame(cx, frame).map_err(Into::into);
            }
            Payload::Headers(_) => {
                return self.recv_header_frame(cx, frame).map_err(Into::into);
            }
            Payload::Data(_) => {
                return self.recv_data_frame(cx, frame);
            }
            Payload::WindowUpdate(_) => {
                self.recv_window_frame(frame)?;
            }
            // Priority is kept compatible but not processed.
            Payload::Priority(_) => {}
        }
        Poll::Ready(Ok(()))
    }

    fn recv_settings_frame(&mut self, frame: Frame) -> Result<(), DispatchError> {
        let settings = match frame.payload() {
            Payload::Settings(settings) => settings,
            _ => unreachable!("settings frame dispatched with a foreign payload"),
        };

        if frame.flags().is_ack() {
            // The peer acknowledged the local SETTINGS; they now apply to
            // the receive side.
            let mut connection = self.settings.lock().unwrap();
            if let SettingsState::Acknowledging(ref acknowledged) = connection.settings {
                for setting in acknowledged.get_settings() {
                    if let Setting::InitialWindowSize(size) = setting {
                        self.controller
                            .streams
                            .apply_recv_initial_window_size(*size);
                    }
                }
            }
            connection.settings = SettingsState::Synced;
            Ok(())
        } else {
            for setting in settings.get_settings() {
                if let Setting::MaxConcurrentStreams(num) = setting {
                    self.controller.streams.apply_max_concurrent_streams(*num);
                }
                if let Setting::InitialWindowSize(size) = setting {
                    self.controller
                        .streams
                        .apply_send_initial_window_size(*size)?;
                }
            }

            // The payload travels with the ACK so the write coroutine can
            // apply the peer's parameters to its encoder; the wire frame
            // it actually emits is an empty acknowledgment.
            let ack_settings = Frame::new(
                frame.stream_id(),
                FrameFlags::new(0x1),
                frame.payload().clone(),
            );
            self.input_tx
                .send(ack_settings)
                .map_err(|_e| DispatchError::ChannelClosed)?;
            Ok(())
        }
    }

    fn recv_ping_frame(&mut self, frame: Frame) -> Result<(), DispatchError> {
        let ping = match frame.payload() {
            Payload::Ping(ping) => ping,
            _ => unreachable!("ping frame dispatched with a foreign payload"),
        };
        if frame.flags().is_ack() {
            // The transport does not originate pings; a stray ACK carries
            // no state.
            Ok(())
        } else {
            self.input_tx
                .send(Ping::ack(ping.clone()))
                .map_err(|_e| DispatchError::ChannelClosed)
        }
    }

    fn recv_go_away_frame(
        &mut self,
        cx: &mut Context<'_>,
        frame: Frame,
    ) -> Poll<Result<(), Http2Error>> {
        let go_away = match frame.payload() {
            Payload::Goaway(goaway) => goaway,
            _ => unreachable!("goaway frame dispatched with a foreign payload"),
        };
        debug!(
            "received GOAWAY, last stream id {}, error code {}",
            go_away.get_last_stream_id(),
            go_away.get_error_code()
        );
        // Refuse new streams on this connection.
        self.controller.goaway();
        self.req_rx.close();
        let last_stream_id = go_away.get_last_stream_id();
        let code = go_away.get_error_code();
        let streams = match self.controller.goaway_unsent_streams(last_stream_id) {
            Ok(streams) => streams,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let status = StreamStatus::GoneAway(
            ErrorCode::try_from(code).unwrap_or(ErrorCode::ProtocolError),
        );

        let mut blocked = false;
        for stream_id in streams {
            match self.controller.send_message_to_stream(
                cx,
                stream_id,
                vec![StreamEvent::Closed(status.clone())],
            ) {
                // Delivery failures are ignored while going away.
                Poll::Ready(_) => {}
                Poll::Pending => blocked = true,
            }
        }
        // Exit once the allowed streams are complete.
        self.controller.go_away_error_code = Some(code);
        if blocked {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn recv_reset_frame(
        &mut self,
        cx: &mut Context<'_>,
        frame: Frame,
    ) -> Poll<Result<(), Http2Error>> {
        let code = match frame.payload() {
            Payload::RstStream(reset) => reset.error_code(),
            _ => unreachable!("reset frame dispatched with a foreign payload"),
        };
        match self.controller.streams.recv_remote_reset(frame.stream_id()) {
            StreamEndState::OK => {
                let status =
                    StreamStatus::Reset(ErrorCode::try_from(code).unwrap_or(ErrorCode::ProtocolError));
                self.controller.send_message_to_stream(
                    cx,
                    frame.stream_id(),
                    vec![StreamEvent::Closed(status)],
                )
            }
            StreamEndState::Err(e) => Poll::Ready(Err(e)),
            StreamEndState::Ignore => Poll::Ready(Ok(())),
        }
    }

    fn recv_header_frame(
        &mut self,
        cx: &mut Context<'_>,
        frame: Frame,
    ) -> Poll<Result<(), Http2Error>> {
        let id = frame.stream_id();
        let eos = frame.flags().is_end_stream();

        match self.controller.streams.recv_headers(id, eos) {
            FrameRecvState::OK => {
                let list = match frame.into_payload() {
                    Payload::Headers(headers) => headers.into_list(),
                    _ => unreachable!("headers frame dispatched with a foreign payload"),
                };
                // The first header block is the peer's initial metadata;
                // any later block is trailing metadata.
                let mut events = Vec::with_capacity(2);
                if !self.controller.streams.saw_initial(id) {
                    self.controller.streams.mark_initial_seen(id);
                    events.push(StreamEvent::InitialMetadata(list));
                } else {
                    events.push(StreamEvent::TrailingMetadata(list));
                }
                if matches!(
                    self.controller.streams.stream_state(id),
                    Some(StreamState::Closed(_))
                ) {
                    events.push(StreamEvent::Closed(StreamStatus::Completed));
                }
                self.controller.send_message_to_stream(cx, id, events)
            }
            FrameRecvState::Err(e) => Poll::Ready(Err(e)),
            FrameRecvState::Ignore => Poll::Ready(Ok(())),
        }
    }

    fn recv_data_frame(
        &mut self,
        cx: &mut Context<'_>,
        frame: Frame,
    ) -> Poll<Result<(), DispatchError>> {
        let id = frame.stream_id();
        let eos = frame.flags().is_end_stream();
        let len = match frame.payload() {
            Payload::Data(data) => data.size() as u32,
            _ => unreachable!("data frame dispatched with a foreign payload"),
        };

        // Wire-level accounting happens on receipt; a violated window is a
        // connection error before any state transition.
        self.update_window(id, len)?;

        match self.controller.streams.recv_data(id, eos) {
            FrameRecvState::OK => {
                let bytes = match frame.into_payload() {
                    Payload::Data(data) => data.into_vec(),
                    _ => unreachable!("data frame dispatched with a foreign payload"),
                };
                let mut events = Vec::with_capacity(2);
                events.push(StreamEvent::Data(bytes));
                if matches!(
                    self.controller.streams.stream_state(id),
                    Some(StreamState::Closed(_))
                ) {
                    events.push(StreamEvent::Closed(StreamStatus::Completed));
                }
                self.controller
                    .send_message_to_stream(cx, id, events)
                    .map_err(Into::into)
            }
            FrameRecvState::Ignore => Poll::Ready(Ok(())),
            FrameRecvState::Err(e) => Poll::Ready(Err(e.into())),
        }
    }

    fn recv_window_frame(&mut self, frame: Frame) -> Result<(), DispatchError> {
        let increment = match frame.payload() {
            Payload::WindowUpdate(update) => update.get_increment(),
            _ => unreachable!("window update dispatched with a foreign payload"),
        };
        let id = frame.stream_id();
        if id == 0 {
            self.controller.streams.increase_conn_send_window(increment)?;
            self.controller.streams.reassign_conn_send_window();
        } else {
            self.controller
                .streams
                .reassign_stream_send_window(id, increment)?;
        }
        Ok(())
    }

    fn manage_resp_error(
        &mut self,
        cx: &mut Context<'_>,
        kind: DispatchError,
    ) -> Poll<Result<(), DispatchError>> {
        match kind {
            DispatchError::H2(Http2Error::Stream(id, code)) => {
                self.manage_stream_error(cx, id, code)
            }
            DispatchError::H2(Http2Error::Connection(code)) => self.manage_conn_error(cx, code),
            other => {
                let blocked = self.exit_with_error(cx, other);
                if blocked {
                    self.state = ManagerState::Send;
                    self.next_state = ManagerState::Exit(other);
                    Poll::Pending
                } else {
                    Poll::Ready(Err(other))
                }
            }
        }
    }

    // A stream error resets that stream and leaves the connection serving
    // the others.
    fn manage_stream_error(
        &mut self,
        cx: &mut Context<'_>,
        id: StreamId,
        code: ErrorCode,
    ) -> Poll<Result<(), DispatchError>> {
        warn!("stream {id} failed: {code:?}");
        match self.controller.streams.send_local_reset(id) {
            StreamEndState::OK => {
                let frame = Frame::new(
                    id,
                    FrameFlags::empty(),
                    Payload::RstStream(RstStream::new(code.into_code())),
                );
                self.input_tx
                    .send(frame)
                    .map_err(|_e| DispatchError::ChannelClosed)?;

                match self.controller.send_message_to_stream(
                    cx,
                    id,
                    vec![StreamEvent::Closed(StreamStatus::Reset(code))],
                ) {
                    // A failed delivery means the handle exited early; the
                    // stream error must not take the connection down.
                    Poll::Ready(_) => Poll::Ready(Ok(())),
                    Poll::Pending => {
                        self.state = ManagerState::Send;
                        self.next_state = ManagerState::Receive;
                        Poll::Pending
                    }
                }
            }
            StreamEndState::Ignore => Poll::Ready(Ok(())),
            // A frame for a stream this connection never opened escalates
            // to a connection error, so every live stream still gets its
            // terminal notification.
            StreamEndState::Err(Http2Error::Connection(code)) => self.manage_conn_error(cx, code),
            StreamEndState::Err(e) => Poll::Ready(Err(e.into())),
        }
    }

    // A connection error sends GOAWAY and fails every live stream with the
    // same status.
    fn manage_conn_error(
        &mut self,
        cx: &mut Context<'_>,
        code: ErrorCode,
    ) -> Poll<Result<(), DispatchError>> {
        warn!("connection failed: {code:?}");
        let go_away_payload = Goaway::new(
            code.into_code(),
            self.controller.streams.latest_remote_id,
            vec![],
        );
        let frame = Frame::new(
            0,
            FrameFlags::empty(),
            Payload::Goaway(go_away_payload.clone()),
        );
        // Avoid sending the same GOAWAY frame multiple times.
        if let Some(ref go_away) = self.controller.go_away_sync.going_away {
            if go_away.get_error_code() == go_away_payload.get_error_code()
                && go_away.get_last_stream_id() == go_away_payload.get_last_stream_id()
            {
                return Poll::Ready(Ok(()));
            }
        }
        self.controller.go_away_sync.going_away = Some(go_away_payload);
        self.input_tx
            .send(frame)
            .map_err(|_e| DispatchError::ChannelClosed)?;

        let error = DispatchError::H2(Http2Error::Connection(code));
        let blocked = self.exit_with_error(cx, error);
        if blocked {
            self.state = ManagerState::Send;
            self.next_state = ManagerState::Exit(error);
            Poll::Pending
        } else {
            Poll::Ready(Err(error))
        }
    }

    // After a peer GOAWAY, reply with a GOAWAY of our own and shut down
    // once the streams the peer promised to process have finished.
    fn poll_deal_with_go_away(&mut self, error_code: u32) -> Result<(), DispatchError> {
        if self.controller.streams.is_closed() {
            let last_stream_id = self.controller.streams.latest_remote_id;
            let go_away_payload = Goaway::new(error_code, last_stream_id, vec![]);
            let frame = Frame::new(
                0,
                FrameFlags::empty(),
                Payload::Goaway(go_away_payload.clone()),
            );
            self.send_peer_goaway(frame, go_away_payload, error_code)?;
            self.controller.shutdown();
            return Err(DispatchError::H2(Http2Error::Connection(
                ErrorCode::try_from(error_code).unwrap_or(ErrorCode::ProtocolError),
            )));
        }
        Ok(())
    }

    fn send_peer_goaway(
        &mut self,
        frame: Frame,
        payload: Goaway,
        err_code: u32,
    ) -> Result<(), DispatchError> {
        let same = match self.controller.go_away_sync.going_away {
            None => false,
            Some(ref go_away) => {
                go_away.get_error_code() == err_code
                    && go_away.get_last_stream_id() == self.controller.streams.latest_remote_id
            }
        };
        if !same {
            self.controller.go_away_sync.going_away = Some(payload);
            self.input_tx
                .send(frame)
                .map_err(|_e| DispatchError::ChannelClosed)?;
        }
        Ok(())
    }

    fn poll_channel_closed_exit(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), DispatchError>> {
        if self.exit_with_error(cx, DispatchError::ChannelClosed) {
            self.state = ManagerState::Send;
            self.next_state = ManagerState::Exit(DispatchError::ChannelClosed);
            Poll::Pending
        } else {
            Poll::Ready(Err(DispatchError::ChannelClosed))
        }
    }

    fn poll_blocked_frames(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.controller.poll_blocked_message(cx, &self.input_tx) {
            Poll::Ready(_) => {
                self.state = self.next_state;
                self.next_state = ManagerState::Receive;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    // Fails every live stream with the same terminal status. Returns
    // whether any delivery is still parked.
    fn exit_with_error(&mut self, cx: &mut Context<'_>, error: DispatchError) -> bool {
        self.controller.shutdown();
        self.req_rx.close();
        self.controller.streams.clear_streams_states();

        let ids = self.controller.streams.get_all_unclosed_streams();
        let mut blocked = false;
        for stream_id in ids {
            match self.controller.send_message_to_stream(
                cx,
                stream_id,
                vec![StreamEvent::Closed(StreamStatus::TransportError(error))],
            ) {
                // Delivery failures are ignored on the way out.
                Poll::Ready(_) => {}
                Poll::Pending => blocked = true,
            }
        }
        blocked
    }

    // Releases connection- and stream-level receive windows for a DATA
    // frame, emitting WINDOW_UPDATE frames as thresholds are crossed.
    fn update_window(&mut self, id: StreamId, len: u32) -> Result<(), DispatchError> {
        self.controller
            .streams
            .release_conn_recv_window(len, &self.input_tx)?;
        self.controller
            .streams
            .release_stream_recv_window(id, len, &self.input_tx)?;
        Ok(())
    }
}
