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

//! Connection assembly: one [`Transport`] owns the read, write and manager
//! tasks of a connection and vends stream handles to the call layer.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use kite_rpc::{
    ErrorCode, Frame, FrameDecoder, FrameEncoder, Goaway, Http2Error, MetadataList, Settings,
    SettingsBuilder, SharedInterner, StreamId, CONNECTION_PREFACE,
};
use tracing::{debug, error};

use crate::buffer::FlowControl;
use crate::call::{CallMessage, StreamEvent, StreamEventSender, StreamHandle};
use crate::config::TransportConfig;
use crate::error::{DispatchError, TransportError};
use crate::input::SendData;
use crate::manager::ConnManager;
use crate::output::RecvData;
use crate::runtime::{
    bounded_channel, split, spawn, unbounded_channel, AsyncRead, AsyncWrite, AsyncWriteExt,
    JoinHandle, SendError, UnboundedReceiver, UnboundedSender, WriteHalf,
};
use crate::streams::Streams;

// The protocol's initial window size; anything beyond it is granted via
// WINDOW_UPDATE after the SETTINGS exchange.
const DEFAULT_WINDOW_SIZE: u32 = 65535;
const DEFAULT_MAX_FRAME_SIZE: usize = 16384;

/// Messages from the read coroutine to the manager.
pub(crate) enum OutputMessage {
    Output(Frame),
    OutputExit(DispatchError),
}

// A parked event delivery: re-polled until the stream's bounded event
// channel accepts it.
pub(crate) type ManagerSendFut =
    Pin<Box<dyn Future<Output = Result<(), SendError<StreamEvent>>> + Send>>;

/// Synchronizes locally sent SETTINGS with their acknowledgment: the new
/// values take effect on the codec only once the peer's ACK arrives.
#[derive(Default)]
pub(crate) struct SettingsSync {
    pub(crate) settings: SettingsState,
}

#[derive(Default, Clone)]
pub(crate) enum SettingsState {
    Acknowledging(Settings),
    #[default]
    Synced,
}

/// The last GOAWAY frame sent locally, to suppress duplicates.
#[derive(Default)]
pub(crate) struct GoAwaySync {
    pub(crate) going_away: Option<Goaway>,
}

/// The manager-owned connection state: stream bookkeeping, the per-stream
/// event channels and the token-to-stream-id mapping.
pub(crate) struct StreamController {
    // Refuses new streams once the connection is torn down.
    pub(crate) io_shutdown: Arc<AtomicBool>,
    // Refuses new streams once a GOAWAY was seen, while draining the rest.
    pub(crate) io_goaway: Arc<AtomicBool>,
    pub(crate) senders: HashMap<StreamId, StreamEventSender>,
    pub(crate) tokens: HashMap<u64, StreamId>,
    pub(crate) curr_message: HashMap<StreamId, ManagerSendFut>,
    pub(crate) streams: Streams,
    // Error code of a received GOAWAY.
    pub(crate) go_away_error_code: Option<u32>,
    pub(crate) go_away_sync: GoAwaySync,
}

impl StreamController {
    pub(crate) fn new(streams: Streams, shutdown: Arc<AtomicBool>, goaway: Arc<AtomicBool>) -> Self {
        Self {
            io_shutdown: shutdown,
            io_goaway: goaway,
            senders: HashMap::new(),
            tokens: HashMap::new(),
            curr_message: HashMap::new(),
            streams,
            go_away_error_code: None,
            go_away_sync: GoAwaySync::default(),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.io_shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn goaway(&self) {
        self.io_goaway.store(true, Ordering::Release);
    }

    /// Applies the peer's GOAWAY last-stream-id and collects the streams it
    /// abandoned. A GOAWAY raising the id above a previous one is a
    /// protocol error.
    pub(crate) fn goaway_unsent_streams(
        &mut self,
        last_stream_id: StreamId,
    ) -> Result<Vec<StreamId>, Http2Error> {
        if self.streams.max_send_id < last_stream_id {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        self.streams.max_send_id = last_stream_id;
        Ok(self.streams.get_goaway_streams(last_stream_id))
    }

    pub(crate) fn has_blocked_messages(&self) -> bool {
        !self.curr_message.is_empty()
    }

    /// Delivers events to one stream's handle, in order. If the bounded
    /// channel is full the delivery parks and must be drained through
    /// [`StreamController::poll_blocked_message`] before new frames are
    /// taken.
    pub(crate) fn send_message_to_stream(
        &mut self,
        cx: &mut Context<'_>,
        stream_id: StreamId,
        events: Vec<StreamEvent>,
    ) -> Poll<Result<(), Http2Error>> {
        let Some(sender) = self.senders.get(&stream_id) else {
            return Poll::Ready(Err(Http2Error::Stream(stream_id, ErrorCode::NoError)));
        };
        let sender = sender.clone();
        let mut task: ManagerSendFut = Box::pin(async move {
            for event in events {
                sender.send(event).await?;
            }
            Ok(())
        });
        match task.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            // The handle was dropped before the stream ended.
            Poll::Ready(Err(_)) => {
                self.senders.remove(&stream_id);
                Poll::Ready(Err(Http2Error::Stream(stream_id, ErrorCode::NoError)))
            }
            Poll::Pending => {
                self.curr_message.insert(stream_id, task);
                Poll::Pending
            }
        }
    }

    /// Re-polls parked deliveries. Streams whose handle disappeared are
    /// reset locally so the peer stops sending.
    pub(crate) fn poll_blocked_message(
        &mut self,
        cx: &mut Context<'_>,
        input_tx: &UnboundedSender<Frame>,
    ) -> Poll<()> {
        let keys: Vec<StreamId> = self.curr_message.keys().cloned().collect();
        let mut blocked = false;

        for key in keys {
            if let Some(mut task) = self.curr_message.remove(&key) {
                match task.as_mut().poll(cx) {
                    Poll::Ready(Ok(_)) => {}
                    Poll::Ready(Err(_)) => {
                        self.senders.remove(&key);
                        if let crate::streams::StreamEndState::OK =
                            self.streams.send_local_reset(key)
                        {
                            let frame = kite_rpc::Frame::new(
                                key,
                                kite_rpc::FrameFlags::empty(),
                                kite_rpc::Payload::RstStream(kite_rpc::RstStream::new(
                                    ErrorCode::NoError.into_code(),
                                )),
                            );
                            // Delivery failures while draining are ignored
                            // so the remaining streams still finish.
                            let _ = input_tx.send(frame);
                        }
                    }
                    Poll::Pending => {
                        self.curr_message.insert(key, task);
                        blocked = true;
                    }
                }
            }
        }
        if blocked {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

/// One RPC transport connection.
///
/// `Transport::connect` takes ownership of an established (and, when the
/// security collaborator is involved, already encrypted) byte stream,
/// sends the connection preface and initial SETTINGS, and spawns the three
/// connection tasks. Dropping the transport aborts them.
pub struct Transport<S> {
    sender: UnboundedSender<CallMessage>,
    io_shutdown: Arc<AtomicBool>,
    io_goaway: Arc<AtomicBool>,
    next_token: AtomicU64,
    allowed_cache: usize,
    credentials: Option<Arc<dyn crate::call::CallCredentials>>,
    interner: SharedInterner,
    handles: Vec<JoinHandle<()>>,
    _mark: PhantomData<S>,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Sync + Send + Unpin + 'static,
{
    /// Establishes the transport over `io` and spawns its connection
    /// tasks.
    pub fn connect(io: S, config: TransportConfig) -> Self {
        let interner = SharedInterner::new();
        let mut flow = FlowControl::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE);
        flow.setup_recv_window(config.conn_window_size());

        let streams = Streams::new(config.stream_window_size(), DEFAULT_WINDOW_SIZE, flow);
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let goaway_flag = Arc::new(AtomicBool::new(false));
        let mut controller =
            StreamController::new(streams, shutdown_flag.clone(), goaway_flag.clone());

        let (input_tx, input_rx) = unbounded_channel();
        let (req_tx, req_rx) = unbounded_channel();

        let settings = create_initial_settings(&config);

        let mut handles = Vec::with_capacity(3);
        // Send the initial SETTINGS and release the configured connection
        // window before any stream may produce frames.
        if input_tx.send(settings).is_ok()
            && controller
                .streams
                .release_conn_recv_window(0, &input_tx)
                .is_ok()
        {
            Self::launch(
                &config,
                interner.clone(),
                controller,
                (input_tx, input_rx),
                req_rx,
                &mut handles,
                io,
            );
        }
        Self {
            sender: req_tx,
            io_shutdown: shutdown_flag,
            io_goaway: goaway_flag,
            next_token: AtomicU64::new(1),
            allowed_cache: config.allowed_cache_frame_num(),
            credentials: config.call_credentials(),
            interner,
            handles,
            _mark: PhantomData,
        }
    }

    fn launch(
        config: &TransportConfig,
        interner: SharedInterner,
        controller: StreamController,
        input_channel: (UnboundedSender<Frame>, UnboundedReceiver<Frame>),
        req_rx: UnboundedReceiver<CallMessage>,
        handles: &mut Vec<JoinHandle<()>>,
        io: S,
    ) {
        let (resp_tx, resp_rx) = bounded_channel(config.allowed_cache_frame_num());
        let (read, write) = split(io);
        let settings_sync = Arc::new(Mutex::new(SettingsSync::default()));

        let send_settings_sync = settings_sync.clone();
        let use_huffman = config.use_huffman_coding();
        let send = spawn(async move {
            let mut writer = write;
            if async_send_preface(&mut writer).await.is_ok() {
                let encoder = FrameEncoder::new(DEFAULT_MAX_FRAME_SIZE, use_huffman);
                let mut send = SendData::new(encoder, send_settings_sync, writer, input_channel.1);
                let _ = Pin::new(&mut send).await;
            }
        });
        handles.push(send);

        let recv_settings_sync = settings_sync.clone();
        let recv = spawn(async move {
            let decoder = FrameDecoder::new(interner);
            let mut recv = RecvData::new(decoder, recv_settings_sync, read, resp_tx);
            let _ = Pin::new(&mut recv).await;
        });
        handles.push(recv);

        let manager = spawn(async move {
            let mut conn_manager =
                ConnManager::new(settings_sync, input_channel.0, resp_rx, req_rx, controller);
            if let Err(e) = Pin::new(&mut conn_manager).await {
                debug!("connection manager exited: {e}");
            }
        });
        handles.push(manager);
    }

    /// Opens a new stream carrying the given initial metadata.
    ///
    /// The configured call credentials run first and may amend the
    /// metadata or reject the call before any bytes are sent. With
    /// `end_stream` the local side is half-closed immediately (a call
    /// without request payload).
    pub fn open_stream(
        &self,
        mut metadata: MetadataList,
        end_stream: bool,
    ) -> Result<StreamHandle, TransportError> {
        if self.is_shutdown() || self.is_goaway() {
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(credentials) = &self.credentials {
            credentials.apply(&self.interner, &mut metadata)?;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = bounded_channel(self.allowed_cache);
        self.sender
            .send(CallMessage::Open {
                token,
                metadata,
                end_stream,
                events: events_tx,
            })
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(StreamHandle::new(
            token,
            self.sender.clone(),
            events_rx,
            end_stream,
        ))
    }

    /// The connection's metadata interner, for building outgoing metadata
    /// without a second copy of each byte string.
    pub fn interner(&self) -> &SharedInterner {
        &self.interner
    }

    /// Whether the connection is torn down.
    pub fn is_shutdown(&self) -> bool {
        self.io_shutdown.load(Ordering::Relaxed)
    }

    /// Whether a GOAWAY forbids opening new streams.
    pub fn is_goaway(&self) -> bool {
        self.io_goaway.load(Ordering::Relaxed)
    }
}

impl<S> Drop for Transport<S> {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn async_send_preface<S>(writer: &mut WriteHalf<S>) -> Result<(), DispatchError>
where
    S: AsyncWrite + Unpin,
{
    writer
        .write_all(CONNECTION_PREFACE)
        .await
        .map_err(|e| {
            error!("failed to send connection preface: {e}");
            DispatchError::Io(e.kind())
        })
}

pub(crate) fn create_initial_settings(config: &TransportConfig) -> Frame {
    let settings = SettingsBuilder::new()
        .max_header_list_size(config.max_header_list_size())
        .max_frame_size(config.max_frame_size())
        .header_table_size(config.header_table_size())
        .enable_push(false)
        .initial_window_size(config.stream_window_size())
        .build();

    Frame::new(
        0,
        kite_rpc::FrameFlags::empty(),
        kite_rpc::Payload::Settings(settings),
    )
}
