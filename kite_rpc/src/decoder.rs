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

use crate::error::ErrorCode;
use crate::frame::{
    Data, Frame, FrameFlags, Goaway, Headers, Ping, Priority, PushPromise, RstStream, Setting,
    Settings, StreamId, WindowUpdate, ACK_MASK, END_HEADERS_MASK, HEADERS_PRIORITY_MASK,
    PADDED_MASK,
};
use crate::hpack::HpackDecoder;
use crate::metadata::SharedInterner;
use crate::{Http2Error, Payload};

const FRAME_HEADER_LENGTH: usize = 9;
const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;
const MAX_ALLOWED_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
const DEFAULT_HEADER_TABLE_SIZE: usize = 4096;
const DEFAULT_MAX_HEADER_LIST_SIZE: usize = 16 << 20;
const MAX_INITIAL_WINDOW_SIZE: usize = (1 << 31) - 1;

/// A set of consecutive frames decoded from one input slice.
///
/// HEADERS and PUSH_PROMISE frames whose header block is still awaiting
/// CONTINUATION fragments appear as [`FrameKind::Partial`].
#[derive(Debug, PartialEq)]
pub struct Frames {
    list: Vec<FrameKind>,
}

/// An iterator over `Frames`.
pub struct FramesIter<'a> {
    iter: core::slice::Iter<'a, FrameKind>,
}

/// A consuming iterator over `Frames`.
pub struct FramesIntoIter {
    into_iter: std::vec::IntoIter<FrameKind>,
}

impl Frames {
    fn new() -> Self {
        Frames { list: vec![] }
    }

    fn push(&mut self, frame: FrameKind) {
        self.list.push(frame)
    }

    /// Returns an iterator over the decoded frames.
    pub fn iter(&self) -> FramesIter<'_> {
        FramesIter {
            iter: self.list.iter(),
        }
    }

    /// Returns the number of decoded frames.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Checks if no frame was completed by this slice.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> Iterator for FramesIter<'a> {
    type Item = &'a FrameKind;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

impl Iterator for FramesIntoIter {
    type Item = FrameKind;

    fn next(&mut self) -> Option<Self::Item> {
        self.into_iter.next()
    }
}

impl IntoIterator for Frames {
    type Item = FrameKind;
    type IntoIter = FramesIntoIter;

    fn into_iter(self) -> Self::IntoIter {
        FramesIntoIter {
            into_iter: self.list.into_iter(),
        }
    }
}

/// One decode result: a complete frame, or a header-block fragment whose
/// frame will be completed by a later CONTINUATION.
#[derive(Debug, PartialEq)]
pub enum FrameKind {
    /// A fully decoded frame.
    Complete(Frame),
    /// A partially decoded HEADERS or PUSH_PROMISE frame.
    Partial,
}

/// Incremental frame decoder.
///
/// Input arrives in arbitrary slices; partial frame headers and payloads
/// are buffered internally, so no state is lost between calls. A frame
/// whose declared length exceeds the negotiated maximum frame size, or
/// whose type-specific layout is violated, is a connection-level error.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    // Number of bytes of the current frame already buffered.
    offset: usize,
    max_frame_size: u32,
    stage: Stage,
    // The 9-byte header of the frame currently being decoded.
    header: FrameHeader,
    hpack: HpackDecoderLayer,
    // HEADERS/PUSH_PROMISE flag state carried across CONTINUATION frames.
    continuations: Continuations,
}

enum Stage {
    Header,
    Payload,
}

struct HpackDecoderLayer {
    hpack: HpackDecoder,
}

#[derive(Default)]
struct FrameHeader {
    stream_id: StreamId,
    flags: u8,
    frame_type: u8,
    payload_length: usize,
}

struct Continuations {
    flags: u8,
    stream_id: StreamId,
    is_end_headers: bool,
    promised_stream_id: StreamId,
}

impl HpackDecoderLayer {
    fn new(interner: SharedInterner) -> Self {
        Self {
            hpack: HpackDecoder::with_max_size(
                DEFAULT_HEADER_TABLE_SIZE,
                DEFAULT_MAX_HEADER_LIST_SIZE,
                interner,
            ),
        }
    }

    fn hpack_decode(&mut self, buf: &[u8]) -> Result<(), Http2Error> {
        self.hpack.decode(buf)
    }

    fn hpack_finish(&mut self) -> Result<crate::MetadataList, Http2Error> {
        self.hpack.finish()
    }
}

impl FrameHeader {
    fn reset(&mut self) {
        self.stream_id = 0;
        self.flags = 0;
        self.frame_type = 0;
        self.payload_length = 0;
    }

    fn is_padded(&self) -> bool {
        PADDED_MASK & self.flags == PADDED_MASK
    }

    fn is_end_headers(&self) -> bool {
        END_HEADERS_MASK & self.flags == END_HEADERS_MASK
    }

    fn is_headers_priority(&self) -> bool {
        HEADERS_PRIORITY_MASK & self.flags == HEADERS_PRIORITY_MASK
    }

    fn is_ack(&self) -> bool {
        ACK_MASK & self.flags == ACK_MASK
    }
}

impl Continuations {
    fn new() -> Self {
        Continuations {
            flags: 0,
            stream_id: 0,
            // No header block is open initially.
            is_end_headers: true,
            promised_stream_id: 0,
        }
    }

    fn reset(&mut self) {
        self.flags = 0;
        self.is_end_headers = true;
        self.stream_id = 0;
        self.promised_stream_id = 0;
    }
}

impl FrameDecoder {
    /// Creates a `FrameDecoder` whose HPACK layer interns through the given
    /// connection interner.
    pub fn new(interner: SharedInterner) -> Self {
        FrameDecoder {
            buffer: vec![],
            offset: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stage: Stage::Header,
            header: FrameHeader::default(),
            hpack: HpackDecoderLayer::new(interner),
            continuations: Continuations::new(),
        }
    }

    /// Updates the SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) -> Result<(), Http2Error> {
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_MAX_FRAME_SIZE).contains(&size) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        self.max_frame_size = size;
        Ok(())
    }

    /// Updates the SETTINGS_MAX_HEADER_LIST_SIZE.
    pub fn set_max_header_list_size(&mut self, size: usize) {
        self.hpack.hpack.update_header_list_size(size)
    }

    /// Updates the SETTINGS_HEADER_TABLE_SIZE this endpoint advertised.
    pub fn set_header_table_size(&mut self, size: usize) {
        self.hpack.hpack.update_header_table_size(size)
    }

    /// Decodes the next slice of the byte stream, returning every frame it
    /// completed. Bytes of an unfinished frame are retained, so the caller
    /// simply resumes with the next slice; an incomplete tail shows up as
    /// an empty `Frames`.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Frames, Http2Error> {
        let mut frames = Frames::new();
        let mut buffer = buf;
        loop {
            match self.stage {
                Stage::Header => match self.decode_frame_header(buffer)? {
                    Some(remain) => {
                        buffer = remain;
                        self.stage = Stage::Payload;
                    }
                    None => break,
                },
                Stage::Payload => match self.decode_frame_payload(buffer)? {
                    Some((remain, frame)) => {
                        frames.push(frame);
                        buffer = remain;
                        self.stage = Stage::Header;
                    }
                    None => break,
                },
            }
        }
        Ok(frames)
    }

    fn decode_frame_header<'a>(&mut self, buf: &'a [u8]) -> Result<Option<&'a [u8]>, Http2Error> {
        let payload_pos = FRAME_HEADER_LENGTH - self.offset;
        if buf.len() < payload_pos {
            self.offset += buf.len();
            self.buffer.extend_from_slice(buf);
            return Ok(None);
        }
        let header_buffer = if self.offset == 0 {
            buf
        } else {
            self.buffer.extend_from_slice(&buf[..payload_pos]);
            self.buffer.as_slice()
        };
        let payload_length = ((header_buffer[0] as usize) << 16)
            + ((header_buffer[1] as usize) << 8)
            + (header_buffer[2] as usize);
        if payload_length > self.max_frame_size as usize {
            return Err(Http2Error::Connection(ErrorCode::FrameSizeError));
        }
        let frame_type = header_buffer[3];
        let flags = header_buffer[4];
        let stream_id = get_stream_id(&header_buffer[5..9]);
        if self.offset != 0 {
            self.offset = 0;
            self.buffer.clear();
        }
        self.header = FrameHeader {
            stream_id,
            flags,
            frame_type,
            payload_length,
        };
        Ok(Some(&buf[payload_pos..]))
    }

    fn decode_frame_payload<'a>(
        &mut self,
        buf: &'a [u8],
    ) -> Result<Option<(&'a [u8], FrameKind)>, Http2Error> {
        // Between a HEADERS (or PUSH_PROMISE) frame and the end of its
        // header block, only CONTINUATION frames of the same stream are
        // allowed.
        if !self.continuations.is_end_headers
            && (self.header.stream_id != self.continuations.stream_id
                || self.header.frame_type != 9)
        {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }

        let frame_end_index = self.header.payload_length - self.offset;
        if buf.len() < frame_end_index {
            self.offset += buf.len();
            self.buffer.extend_from_slice(buf);
            return Ok(None);
        }
        let frame = match self.header.frame_type {
            0 => self.decode_data_payload(&buf[..frame_end_index])?,
            1 => self.decode_headers_payload(&buf[..frame_end_index])?,
            2 => self.decode_priority_payload(&buf[..frame_end_index])?,
            3 => self.decode_reset_payload(&buf[..frame_end_index])?,
            4 => self.decode_settings_payload(&buf[..frame_end_index])?,
            5 => self.decode_push_promise_payload(&buf[..frame_end_index])?,
            6 => self.decode_ping_payload(&buf[..frame_end_index])?,
            7 => self.decode_goaway_payload(&buf[..frame_end_index])?,
            8 => self.decode_window_update_payload(&buf[..frame_end_index])?,
            9 => self.decode_continuation_payload(&buf[..frame_end_index])?,
            _ => return Err(Http2Error::Connection(ErrorCode::ProtocolError)),
        };
        self.header.reset();
        if self.offset != 0 {
            self.offset = 0;
            self.buffer.clear();
        }
        Ok(Some((&buf[frame_end_index..], frame)))
    }

    fn decode_data_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        if is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        if self.header.payload_length == 0 {
            let frame = Frame::new(
                self.header.stream_id,
                FrameFlags::new(self.header.flags),
                Payload::Data(Data::new(vec![])),
            );
            return Ok(FrameKind::Complete(frame));
        }
        let data = if self.header.is_padded() {
            let padding_length = buf[0] as usize;
            if self.header.payload_length <= padding_length {
                return Err(Http2Error::Connection(ErrorCode::ProtocolError));
            }
            buf[1..self.header.payload_length - padding_length].to_vec()
        } else {
            buf[..self.header.payload_length].to_vec()
        };
        let frame = Frame::new(
            self.header.stream_id,
            FrameFlags::new(self.header.flags),
            Payload::Data(Data::new(data)),
        );
        Ok(FrameKind::Complete(frame))
    }

    fn decode_headers_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        if is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        let mut fragment_start_index = 0;
        let mut fragment_end_index = self.header.payload_length;
        if self.header.is_padded() {
            let padding_length = buf[0] as usize;
            if self.header.payload_length <= padding_length {
                return Err(Http2Error::Connection(ErrorCode::ProtocolError));
            }
            fragment_start_index += 1;
            fragment_end_index -= padding_length;
        }
        if self.header.is_headers_priority() {
            // Priority information on HEADERS is parsed past, not used.
            fragment_start_index += 5;
        }
        if fragment_start_index > fragment_end_index {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }

        if self.header.is_end_headers() {
            self.hpack
                .hpack_decode(&buf[fragment_start_index..fragment_end_index])?;
            let list = self.hpack.hpack_finish()?;
            let frame = Frame::new(
                self.header.stream_id,
                FrameFlags::new(self.header.flags),
                Payload::Headers(Headers::new(list)),
            );
            Ok(FrameKind::Complete(frame))
        } else {
            self.continuations.flags = self.header.flags;
            self.continuations.is_end_headers = false;
            self.continuations.stream_id = self.header.stream_id;
            self.hpack
                .hpack_decode(&buf[fragment_start_index..fragment_end_index])?;
            Ok(FrameKind::Partial)
        }
    }

    fn decode_continuation_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        if is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        if self.continuations.is_end_headers {
            // CONTINUATION without an open header block.
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        self.hpack.hpack_decode(buf)?;
        if !self.header.is_end_headers() {
            return Ok(FrameKind::Partial);
        }
        let list = self.hpack.hpack_finish()?;
        let frame = if self.continuations.promised_stream_id != 0 {
            Frame::new(
                self.continuations.stream_id,
                FrameFlags::new(self.continuations.flags),
                Payload::PushPromise(PushPromise::new(
                    self.continuations.promised_stream_id,
                    list,
                )),
            )
        } else {
            Frame::new(
                self.continuations.stream_id,
                FrameFlags::new(self.continuations.flags),
                Payload::Headers(Headers::new(list)),
            )
        };
        self.continuations.reset();
        Ok(FrameKind::Complete(frame))
    }

    fn decode_push_promise_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        if is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        let mut fragment_start_index = 4;
        let mut fragment_end_index = self.header.payload_length;
        if self.header.is_padded() {
            let padding_length = buf[0] as usize;
            if self.header.payload_length <= padding_length {
                return Err(Http2Error::Connection(ErrorCode::ProtocolError));
            }
            fragment_start_index += 1;
            fragment_end_index -= padding_length;
        }
        if fragment_start_index > fragment_end_index {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let promised_stream_id = if self.header.is_padded() {
            get_stream_id(&buf[1..5])
        } else {
            get_stream_id(&buf[..4])
        };
        if is_connection_frame(promised_stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        self.hpack
            .hpack_decode(&buf[fragment_start_index..fragment_end_index])?;
        if self.header.is_end_headers() {
            let list = self.hpack.hpack_finish()?;
            let frame = Frame::new(
                self.header.stream_id,
                FrameFlags::new(self.header.flags),
                Payload::PushPromise(PushPromise::new(promised_stream_id, list)),
            );
            Ok(FrameKind::Complete(frame))
        } else {
            self.continuations.flags = self.header.flags;
            self.continuations.is_end_headers = false;
            self.continuations.stream_id = self.header.stream_id;
            self.continuations.promised_stream_id = promised_stream_id;
            Ok(FrameKind::Partial)
        }
    }

    fn decode_priority_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        const EXCLUSIVE_MASK: u8 = 0x80;

        if is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        if self.header.payload_length != 5 {
            // RFC9113-6.3: a PRIORITY length error is a stream error.
            return Err(Http2Error::Stream(
                self.header.stream_id,
                ErrorCode::FrameSizeError,
            ));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        let exclusive = buf[0] & EXCLUSIVE_MASK == EXCLUSIVE_MASK;
        let stream_dependency = get_stream_id(&buf[..4]);
        let weight = buf[4];
        let priority = Frame::new(
            self.header.stream_id,
            FrameFlags::new(self.header.flags),
            Payload::Priority(Priority::new(exclusive, stream_dependency, weight)),
        );
        Ok(FrameKind::Complete(priority))
    }

    fn decode_reset_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        if is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        if self.header.payload_length != 4 || buf.len() != 4 {
            return Err(Http2Error::Connection(ErrorCode::FrameSizeError));
        }
        let code = get_code_value(&buf[..4]);
        let reset = Frame::new(
            self.header.stream_id,
            FrameFlags::new(self.header.flags),
            Payload::RstStream(RstStream::new(code)),
        );
        Ok(FrameKind::Complete(reset))
    }

    fn decode_settings_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        if !is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        if self.header.payload_length % 6 != 0 {
            return Err(Http2Error::Connection(ErrorCode::FrameSizeError));
        }
        if self.header.is_ack() {
            if self.header.payload_length != 0 || !buf.is_empty() {
                return Err(Http2Error::Connection(ErrorCode::FrameSizeError));
            }
            let settings = Frame::new(
                self.header.stream_id,
                FrameFlags::new(self.header.flags),
                Payload::Settings(Settings::new(vec![])),
            );
            return Ok(FrameKind::Complete(settings));
        }
        let mut settings = vec![];
        for chunk in buf.chunks(6) {
            if let Some(setting) = split_token_to_setting(chunk)? {
                settings.push(setting);
            }
        }
        let frame = Frame::new(
            self.header.stream_id,
            FrameFlags::new(self.header.flags),
            Payload::Settings(Settings::new(settings)),
        );
        Ok(FrameKind::Complete(frame))
    }

    fn decode_ping_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        if !is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        if self.header.payload_length != 8 || buf.len() != 8 {
            return Err(Http2Error::Connection(ErrorCode::FrameSizeError));
        }
        let mut opaque_data = [0; 8];
        opaque_data.copy_from_slice(buf);
        let ping = Frame::new(
            self.header.stream_id,
            FrameFlags::new(self.header.flags),
            Payload::Ping(Ping::new(opaque_data)),
        );
        Ok(FrameKind::Complete(ping))
    }

    fn decode_goaway_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        if !is_connection_frame(self.header.stream_id) {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        if self.header.payload_length < 8 || buf.len() < 8 {
            return Err(Http2Error::Connection(ErrorCode::FrameSizeError));
        }
        let last_stream_id = get_stream_id(&buf[..4]);
        let error_code = get_code_value(&buf[4..8]);
        let debug_data = buf[8..].to_vec();
        let goaway = Frame::new(
            self.header.stream_id,
            FrameFlags::new(self.header.flags),
            Payload::Goaway(Goaway::new(error_code, last_stream_id, debug_data)),
        );
        Ok(FrameKind::Complete(goaway))
    }

    // WINDOW_UPDATE targets a stream or, on stream 0, the connection.
    fn decode_window_update_payload(&mut self, buf: &[u8]) -> Result<FrameKind, Http2Error> {
        let buf = staged(&mut self.buffer, &mut self.offset, buf);
        if self.header.payload_length != 4 || buf.len() != 4 {
            return Err(Http2Error::Connection(ErrorCode::FrameSizeError));
        }
        let increment = get_stream_id(&buf[..4]);
        if increment == 0 {
            // A zero increment matches the level of its target.
            return if is_connection_frame(self.header.stream_id) {
                Err(Http2Error::Connection(ErrorCode::ProtocolError))
            } else {
                Err(Http2Error::Stream(
                    self.header.stream_id,
                    ErrorCode::ProtocolError,
                ))
            };
        }
        let window_update = Frame::new(
            self.header.stream_id,
            FrameFlags::new(self.header.flags),
            Payload::WindowUpdate(WindowUpdate::new(increment)),
        );
        Ok(FrameKind::Complete(window_update))
    }

}

// Joins the bytes buffered from earlier slices, if any, with the final
// slice of the current frame's payload.
fn staged<'a>(buffer: &'a mut Vec<u8>, offset: &mut usize, buf: &'a [u8]) -> &'a [u8] {
    if *offset != 0 {
        buffer.extend_from_slice(buf);
        *offset += buf.len();
        buffer.as_slice()
    } else {
        buf
    }
}

fn is_connection_frame(id: StreamId) -> bool {
    id == 0
}

fn get_stream_id(token: &[u8]) -> StreamId {
    (((token[0] & 0x7f) as u32) << 24)
        | ((token[1] as u32) << 16)
        | ((token[2] as u32) << 8)
        | (token[3] as u32)
}

fn get_code_value(token: &[u8]) -> u32 {
    ((token[0] as u32) << 24)
        | ((token[1] as u32) << 16)
        | ((token[2] as u32) << 8)
        | (token[3] as u32)
}

fn split_token_to_setting(token: &[u8]) -> Result<Option<Setting>, Http2Error> {
    let id = u16::from(token[0]) << 8 | u16::from(token[1]);
    let value = get_code_value(&token[2..6]);
    get_setting(id, value)
}

fn get_setting(id: u16, value: u32) -> Result<Option<Setting>, Http2Error> {
    match id {
        1 => Ok(Some(Setting::HeaderTableSize(value))),
        2 => {
            let enable_push = match value {
                0 => false,
                1 => true,
                _ => return Err(Http2Error::Connection(ErrorCode::ProtocolError)),
            };
            Ok(Some(Setting::EnablePush(enable_push)))
        }
        3 => Ok(Some(Setting::MaxConcurrentStreams(value))),
        4 => {
            if value as usize > MAX_INITIAL_WINDOW_SIZE {
                return Err(Http2Error::Connection(ErrorCode::FlowControlError));
            }
            Ok(Some(Setting::InitialWindowSize(value)))
        }
        5 => {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_MAX_FRAME_SIZE).contains(&value) {
                return Err(Http2Error::Connection(ErrorCode::ProtocolError));
            }
            Ok(Some(Setting::MaxFrameSize(value)))
        }
        6 => Ok(Some(Setting::MaxHeaderListSize(value))),
        // Unknown parameters are ignored.
        _ => Ok(None),
    }
}

#[cfg(test)]
mod ut_frame_decoder {
    use super::*;
    use crate::test_util::decode;

    fn new_decoder() -> FrameDecoder {
        FrameDecoder::new(SharedInterner::new())
    }

    fn expect_complete(kind: &FrameKind) -> &Frame {
        match kind {
            FrameKind::Complete(frame) => frame,
            FrameKind::Partial => panic!("expected a complete frame!"),
        }
    }

    fn expect_data(frame: &Frame, id: StreamId, flags: u8, payload: &str) {
        assert_eq!(frame.stream_id(), id);
        assert_eq!(frame.flags().bits(), flags);
        match frame.payload() {
            Payload::Data(data) => assert_eq!(data.data(), payload.as_bytes()),
            _ => panic!("unexpected payload type!"),
        }
    }

    fn expect_headers(frame: &Frame, id: StreamId, pairs: &[(&str, &str)]) {
        assert_eq!(frame.stream_id(), id);
        match frame.payload() {
            Payload::Headers(headers) => {
                let list = headers.list();
                assert_eq!(list.len(), pairs.len());
                for (elem, (k, v)) in list.iter().zip(pairs.iter()) {
                    assert_eq!(elem.key(), k.as_bytes());
                    assert_eq!(elem.value(), v.as_bytes());
                }
            }
            _ => panic!("unexpected payload type!"),
        }
    }

    /// UT test cases for `FrameDecoder::decode` with a complete DATA frame.
    ///
    /// # Brief
    /// 1. Creates a `FrameDecoder`.
    /// 2. Decodes a DATA frame in one slice.
    /// 3. Checks the results.
    #[test]
    fn ut_frame_decoder_with_complete_data_frame() {
        let mut decoder = new_decoder();
        let bytes = decode("00000b00010000000168656c6c6f20776f726c64").unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        expect_data(expect_complete(frames.iter().next().unwrap()), 1, 1, "hello world");
    }

    /// UT test cases for `FrameDecoder::decode` with a padded DATA frame.
    ///
    /// # Brief
    /// 1. Decodes a DATA frame carrying the PADDED flag.
    /// 2. Checks that the padding is stripped.
    #[test]
    fn ut_frame_decoder_with_complete_padded_data_frame() {
        let mut decoder = new_decoder();
        let bytes =
            decode("0000140008000000020648656C6C6F2C20776F726C6421486F77647921").unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        expect_data(expect_complete(frames.iter().next().unwrap()), 2, 8, "Hello, world!");
    }

    /// UT test cases for `FrameDecoder::decode` over segmented input.
    ///
    /// # Brief
    /// 1. Splits two DATA frames at arbitrary boundaries.
    /// 2. Decodes the pieces and checks no state is lost.
    #[test]
    fn ut_frame_decoder_with_segmented_data_frame() {
        let mut decoder = new_decoder();
        let bytes = decode(
            "00000b00010000000168656c6c6f20776f726c64\
            0000140008000000020648656C6C6F2C20776F726C6421486F77647921",
        )
        .unwrap();
        assert_eq!(decoder.decode(&bytes[..8]).unwrap().len(), 0);
        assert_eq!(decoder.decode(&bytes[8..12]).unwrap().len(), 0);
        let frames = decoder.decode(&bytes[12..24]).unwrap();
        assert_eq!(frames.len(), 1);
        expect_data(expect_complete(frames.iter().next().unwrap()), 1, 1, "hello world");
        let frames = decoder.decode(&bytes[24..]).unwrap();
        assert_eq!(frames.len(), 1);
        expect_data(
            expect_complete(frames.iter().next().unwrap()),
            2,
            8,
            "Hello, world!",
        );
    }

    /// UT test cases for a HEADERS frame with padding and priority.
    ///
    /// # Brief
    /// 1. Decodes a padded HEADERS frame carrying priority information.
    /// 2. Checks the decoded metadata in wire order and the flag accessors.
    #[test]
    fn ut_frame_decoder_with_complete_padded_priority_headers_frame() {
        let mut decoder = new_decoder();
        let bytes = decode(
            "000040012D000000011080000014098286418a089d5c0b8170dc640007048762c2a0f6d842ff\
            6687089d5c0b8170ff5388352398ac74acb37f546869732069732070616464696E672E",
        )
        .unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = expect_complete(frames.iter().next().unwrap());
        expect_headers(
            frame,
            1,
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":authority", "127.0.0.1:3000"),
                (":path", "/resource"),
                ("host", "127.0.0.1"),
                ("accept", "image/jpeg"),
            ],
        );
        assert!(frame.flags().is_padded());
        assert!(frame.flags().is_end_stream());
        assert_eq!(frame.flags().bits(), 0x2D);
    }

    /// UT test cases for HEADERS followed by CONTINUATION and DATA.
    ///
    /// # Brief
    /// 1. Decodes a header block split across HEADERS and CONTINUATION,
    ///    followed by a DATA frame.
    /// 2. Checks the partial result, the completed frame, and the data.
    #[test]
    fn ut_frame_decoder_with_series_request_frames() {
        let mut decoder = new_decoder();
        let bytes = decode(
            "00002e0100000000018286418a089d5c0b8170dc640007048762c2a0f6d842ff6687089d5c0b\
            8170ff5388352398ac74acb37f0f0d817f0000040904000000010f0d817f000009000100000001\
            7468697320626f6479",
        )
        .unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        assert_eq!(frames.len(), 3);
        let mut iter = frames.iter();

        // The HEADERS frame lacks END_HEADERS, so it decodes as Partial.
        assert!(matches!(iter.next().unwrap(), FrameKind::Partial));

        let headers = expect_complete(iter.next().unwrap());
        expect_headers(
            headers,
            1,
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":authority", "127.0.0.1:3000"),
                (":path", "/resource"),
                ("host", "127.0.0.1"),
                ("accept", "image/jpeg"),
                ("content-length", "9"),
                ("content-length", "9"),
            ],
        );
        expect_data(expect_complete(iter.next().unwrap()), 1, 1, "this body");
    }

    /// UT test cases for a foreign frame between header fragments.
    ///
    /// # Brief
    /// 1. Starts a header block and then decodes a CONTINUATION belonging to
    ///    another stream.
    /// 2. Checks the connection error.
    #[test]
    fn ut_frame_decoder_with_continuation_frame_in_another_stream() {
        let mut decoder = new_decoder();
        let bytes = decode(
            "00002e0100000000018286418a089d5c0b8170dc640007048762c2a0f6d842ff6687089d5c0b\
            8170ff5388352398ac74acb37f0f0d817f0000040904000000020f0d817f000009000100000001\
            7468697320626f6479",
        )
        .unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test cases for `FrameDecoder::decode` with oversized frames.
    ///
    /// # Brief
    /// 1. Configures a decoder with the minimum max-frame-size.
    /// 2. Decodes a frame header whose declared length exceeds it.
    /// 3. Checks the connection error.
    #[test]
    fn ut_frame_decoder_with_oversized_frame() {
        let mut decoder = new_decoder();
        // 16385-byte DATA frame header.
        let bytes = decode("00400100000000000100").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::FrameSizeError))
        );

        assert!(new_decoder().set_max_frame_size(16383).is_err());
        assert!(new_decoder().set_max_frame_size(1 << 24).is_err());
        assert!(new_decoder().set_max_frame_size(65536).is_ok());
    }

    /// UT test cases for PING payload constraints.
    ///
    /// # Brief
    /// 1. Decodes a valid 8-byte PING.
    /// 2. Decodes a PING with the wrong length and one on a stream.
    /// 3. Checks the results.
    #[test]
    fn ut_decode_ping_payload() {
        let mut decoder = new_decoder();
        let bytes = decode("00000806000000000070696e6774657374").unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        let frame = expect_complete(frames.iter().next().unwrap());
        match frame.payload() {
            Payload::Ping(ping) => assert_eq!(&ping.data(), b"pingtest"),
            _ => panic!("unexpected payload type!"),
        }

        let mut decoder = new_decoder();
        let bytes = decode("000007060000000000706f6e6774657374").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::FrameSizeError))
        );

        let mut decoder = new_decoder();
        let bytes = decode("00000806000000000170696e6774657374").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test cases for GOAWAY payloads.
    ///
    /// # Brief
    /// 1. Decodes a GOAWAY with debug data.
    /// 2. Decodes a GOAWAY on a non-zero stream.
    /// 3. Checks the results.
    #[test]
    fn ut_decode_goaway_payload() {
        let mut decoder = new_decoder();
        let bytes = decode("00000d07000000000000000001000000026465627567").unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        let frame = expect_complete(frames.iter().next().unwrap());
        match frame.payload() {
            Payload::Goaway(goaway) => {
                assert_eq!(goaway.get_last_stream_id(), 1);
                assert_eq!(goaway.get_error_code(), 2);
                assert_eq!(goaway.get_debug_data(), b"debug");
            }
            _ => panic!("unexpected payload type!"),
        }

        let mut decoder = new_decoder();
        let bytes = decode("00000d07000000000100000001000000026465627567").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test cases for WINDOW_UPDATE payloads.
    ///
    /// # Brief
    /// 1. Decodes a stream-level and a connection-level WINDOW_UPDATE.
    /// 2. Decodes zero increments at both levels.
    /// 3. Checks the error levels match the target.
    #[test]
    fn ut_decode_window_update_payload() {
        let mut decoder = new_decoder();
        let bytes = decode("000004080000000001000003e8").unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        let frame = expect_complete(frames.iter().next().unwrap());
        match frame.payload() {
            Payload::WindowUpdate(update) => assert_eq!(update.get_increment(), 1000),
            _ => panic!("unexpected payload type!"),
        }

        let mut decoder = new_decoder();
        let bytes = decode("00000408000000000100000000").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Stream(1, ErrorCode::ProtocolError))
        );

        let mut decoder = new_decoder();
        let bytes = decode("00000408000000000000000000").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test cases for SETTINGS payloads.
    ///
    /// # Brief
    /// 1. Decodes a SETTINGS frame with several parameters.
    /// 2. Decodes a SETTINGS frame with an invalid length.
    /// 3. Decodes a SETTINGS ACK with a payload.
    /// 4. Checks the results.
    #[test]
    fn ut_decode_settings_payload() {
        let mut decoder = new_decoder();
        let bytes = decode("00001204000000000000010000100000030000006400040000ffff").unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        let frame = expect_complete(frames.iter().next().unwrap());
        match frame.payload() {
            Payload::Settings(settings) => {
                assert_eq!(
                    settings.get_settings(),
                    &[
                        Setting::HeaderTableSize(4096),
                        Setting::MaxConcurrentStreams(100),
                        Setting::InitialWindowSize(65535),
                    ]
                );
            }
            _ => panic!("unexpected payload type!"),
        }

        let mut decoder = new_decoder();
        let bytes = decode("000005040000000000000001000010").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::FrameSizeError))
        );

        let mut decoder = new_decoder();
        let bytes = decode("000006040100000000000100001000").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::FrameSizeError))
        );
    }

    /// UT test cases for RST_STREAM payloads.
    ///
    /// # Brief
    /// 1. Decodes a RST_STREAM with the CANCEL code.
    /// 2. Decodes a RST_STREAM on stream zero.
    /// 3. Checks the results.
    #[test]
    fn ut_decode_rst_stream_payload() {
        let mut decoder = new_decoder();
        let bytes = decode("00000403000000000300000008").unwrap();
        let frames = decoder.decode(&bytes).unwrap();
        let frame = expect_complete(frames.iter().next().unwrap());
        match frame.payload() {
            Payload::RstStream(reset) => assert_eq!(reset.error_code(), 8),
            _ => panic!("unexpected payload type!"),
        }

        let mut decoder = new_decoder();
        let bytes = decode("00000403000000000000000008").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test cases for unknown frame types.
    ///
    /// # Brief
    /// 1. Decodes a frame with an undefined type octet.
    /// 2. Checks the connection error.
    #[test]
    fn ut_decode_unknown_frame_type() {
        let mut decoder = new_decoder();
        let bytes = decode("0000000a000000000100").unwrap();
        assert_eq!(
            decoder.decode(&bytes),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }
}
