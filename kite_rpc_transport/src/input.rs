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

//! The frame write coroutine.
//!
//! `SendData` owns the socket's write half and is the connection's single
//! writer: frames from every stream are interleaved by the manager and
//! arrive here already serialized into one queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use kite_rpc::{Frame, FrameEncoder, Payload, Setting, Settings};

use crate::dispatcher::{SettingsState, SettingsSync};
use crate::error::DispatchError;
use crate::runtime::{AsyncWrite, UnboundedReceiver, WriteHalf};

pub(crate) struct SendData<S> {
    encoder: FrameEncoder,
    settings: Arc<Mutex<SettingsSync>>,
    writer: WriteHalf<S>,
    frame_rx: UnboundedReceiver<Frame>,
    state: InputState,
    buf: WriteBuf,
}

enum InputState {
    RecvFrame,
    WriteFrame,
}

enum SettingState {
    Not,
    Local(Settings),
    Ack,
}

// Staging buffer between the encoder and the socket, so a partial write
// never loses encoded bytes.
struct WriteBuf {
    buf: [u8; 1024],
    end: usize,
    start: usize,
    empty: bool,
}

impl WriteBuf {
    fn new() -> Self {
        Self {
            buf: [0; 1024],
            end: 0,
            start: 0,
            empty: true,
        }
    }

    fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.empty = true;
    }
}

impl<S: AsyncWrite + Unpin + Sync + Send + 'static> Future for SendData<S> {
    type Output = Result<(), DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sender = self.get_mut();
        loop {
            match sender.state {
                InputState::RecvFrame => {
                    let frame = match sender.poll_recv_frame(cx) {
                        Poll::Ready(Ok(frame)) => frame,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    };

                    let state = sender.update_settings(&frame);

                    if let SettingState::Local(settings) = &state {
                        let mut sync = sender.settings.lock().unwrap();
                        sync.settings = SettingsState::Acknowledging(settings.clone());
                    }

                    // The manager attaches the peer's parameters to the ACK
                    // for the encoder; the wire sees an empty ACK.
                    let frame = if let SettingState::Ack = state {
                        Settings::ack()
                    } else {
                        frame
                    };
                    sender
                        .encoder
                        .set_frame(frame)
                        .map_err(|_| DispatchError::H2(kite_rpc::Http2Error::Connection(
                            kite_rpc::ErrorCode::InternalError,
                        )))?;
                    sender.state = InputState::WriteFrame;
                }
                InputState::WriteFrame => {
                    match sender.poll_write_frame(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    };
                    sender.state = InputState::RecvFrame;
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin + Sync + Send + 'static> SendData<S> {
    pub(crate) fn new(
        encoder: FrameEncoder,
        settings: Arc<Mutex<SettingsSync>>,
        writer: WriteHalf<S>,
        frame_rx: UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            encoder,
            settings,
            writer,
            frame_rx,
            state: InputState::RecvFrame,
            buf: WriteBuf::new(),
        }
    }

    fn poll_write_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), DispatchError>> {
        // Finish the bytes a previous poll could not write.
        if !self.buf.empty {
            loop {
                match Pin::new(&mut self.writer)
                    .poll_write(cx, &self.buf.buf[self.buf.start..self.buf.end])
                    .map_err(|e| DispatchError::Io(e.kind()))?
                {
                    Poll::Ready(written) => {
                        self.buf.start += written;
                        if self.buf.start == self.buf.end {
                            self.buf.clear();
                            break;
                        }
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        }

        loop {
            let size = self.encoder.encode(&mut self.buf.buf).map_err(|_| {
                DispatchError::H2(kite_rpc::Http2Error::Connection(
                    kite_rpc::ErrorCode::InternalError,
                ))
            })?;
            if size == 0 {
                break;
            }
            let mut index = 0;
            loop {
                match Pin::new(&mut self.writer)
                    .poll_write(cx, &self.buf.buf[index..size])
                    .map_err(|e| DispatchError::Io(e.kind()))?
                {
                    Poll::Ready(written) => {
                        index += written;
                        if index == size {
                            break;
                        }
                    }
                    Poll::Pending => {
                        self.buf.start = index;
                        self.buf.end = size;
                        self.buf.empty = false;
                        return Poll::Pending;
                    }
                }
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_recv_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<Frame, DispatchError>> {
        match self.frame_rx.poll_recv(cx) {
            Poll::Ready(None) => Poll::Ready(Err(DispatchError::ChannelClosed)),
            Poll::Ready(Some(frame)) => Poll::Ready(Ok(frame)),
            Poll::Pending => Poll::Pending,
        }
    }

    // A SETTINGS frame passing through the writer is either the local
    // SETTINGS (to be tracked until the peer acknowledges it) or the ACK
    // of the peer's SETTINGS, whose parameters now govern the encoder.
    fn update_settings(&mut self, frame: &Frame) -> SettingState {
        let settings = match frame.payload() {
            Payload::Settings(settings) => settings,
            _ => return SettingState::Not,
        };
        if frame.flags().is_ack() {
            for setting in settings.get_settings() {
                if let Setting::HeaderTableSize(size) = setting {
                    self.encoder.update_header_table_size(*size as usize);
                }
                if let Setting::MaxFrameSize(size) = setting {
                    self.encoder.update_max_frame_size(*size as usize);
                }
            }
            SettingState::Ack
        } else {
            SettingState::Local(settings.clone())
        }
    }
}
