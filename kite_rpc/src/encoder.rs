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

use crate::frame::{Frame, FrameType, Payload, StreamId, END_HEADERS_MASK, END_STREAM_MASK};
use crate::hpack::HpackEncoder;

const FRAME_HEADER_LENGTH: usize = 9;
const DEFAULT_MAX_FRAME_SIZE: usize = 16384;
const DEFAULT_HEADER_TABLE_SIZE: usize = 4096;

/// Errors of the frame serialization layer. These are local usage errors,
/// not wire errors.
#[derive(Debug)]
pub enum FrameEncoderErr {
    /// The frame's payload does not match the state the encoder is in.
    UnexpectedPayloadType,
    /// `encode` was called without a frame being set.
    NoCurrentFrame,
    /// A HEADERS frame without END_HEADERS was submitted; the encoder
    /// produces CONTINUATION frames itself.
    HeadersNotEnd,
    /// The transport never emits this frame type.
    UnsupportedPayloadType,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum FollowUp {
    // The staged bytes are the whole frame.
    None,
    // DATA payload bytes follow the staged frame header.
    Data,
    // A header-block fragment follows the staged frame header.
    Block,
}

/// Stateful frame serializer.
///
/// One frame is set at a time with [`FrameEncoder::set_frame`] and drained
/// through repeated [`FrameEncoder::encode`] calls into output slices of
/// any size. DATA payloads larger than the negotiated maximum frame size
/// are split into multiple DATA frames; header blocks larger than the
/// maximum continue in CONTINUATION frames, with END_HEADERS set on the
/// last fragment only.
pub struct FrameEncoder {
    current: Option<Frame>,
    hpack: HpackEncoder,
    max_frame_size: usize,
    // The staged frame header (plus whole payload for control frames) and
    // the read cursor into it.
    staging: Vec<u8>,
    staged_pos: usize,
    follow_up: FollowUp,
    // Progress through a DATA payload.
    data_pos: usize,
    chunk_remaining: usize,
    // The current header-block fragment.
    block: Vec<u8>,
    block_len: usize,
    block_pos: usize,
}

impl FrameEncoder {
    /// Creates a `FrameEncoder` with the given maximum frame size and
    /// Huffman preference for header blocks.
    pub fn new(max_frame_size: usize, use_huffman: bool) -> Self {
        Self {
            current: None,
            hpack: HpackEncoder::new(DEFAULT_HEADER_TABLE_SIZE, use_huffman),
            max_frame_size,
            staging: Vec::with_capacity(FRAME_HEADER_LENGTH),
            staged_pos: 0,
            follow_up: FollowUp::None,
            data_pos: 0,
            chunk_remaining: 0,
            block: Vec::new(),
            block_len: 0,
            block_pos: 0,
        }
    }

    /// Updates the SETTINGS_MAX_FRAME_SIZE acknowledged by the peer.
    pub fn update_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size;
    }

    /// Updates the peer's SETTINGS_HEADER_TABLE_SIZE.
    pub fn update_header_table_size(&mut self, size: usize) {
        self.hpack.update_max_dynamic_table_size(size);
    }

    /// Sets the frame to be serialized next. The previous frame must have
    /// been drained completely.
    pub fn set_frame(&mut self, frame: Frame) -> Result<(), FrameEncoderErr> {
        self.staging.clear();
        self.staged_pos = 0;
        self.data_pos = 0;
        self.chunk_remaining = 0;
        self.block_pos = 0;
        self.block_len = 0;

        match frame.payload() {
            Payload::Headers(headers) => {
                if !frame.flags().is_end_headers() {
                    return Err(FrameEncoderErr::HeadersNotEnd);
                }
                self.hpack.set_metadata(headers.list().clone());
                if self.block.len() != self.max_frame_size {
                    self.block = vec![0; self.max_frame_size];
                }
                self.block_len = self.hpack.encode(&mut self.block);
                let flags = if self.hpack.is_finished() {
                    frame.flags().bits()
                } else {
                    frame.flags().bits() & !END_HEADERS_MASK
                };
                self.stage_header(
                    self.block_len,
                    FrameType::Headers as u8,
                    flags,
                    frame.stream_id(),
                );
                self.follow_up = FollowUp::Block;
            }
            Payload::Data(data) => {
                self.stage_data_chunk(frame.stream_id(), frame.flags().bits(), data.size(), 0);
                self.follow_up = FollowUp::Data;
            }
            Payload::Settings(settings) => {
                self.stage_header(
                    settings.encoded_len(),
                    FrameType::Settings as u8,
                    frame.flags().bits(),
                    frame.stream_id(),
                );
                for setting in settings.get_settings() {
                    let id = setting.setting_identifier();
                    self.staging.extend_from_slice(&id.to_be_bytes());
                    self.staging.extend_from_slice(&setting.value().to_be_bytes());
                }
                self.follow_up = FollowUp::None;
            }
            Payload::Goaway(goaway) => {
                self.stage_header(
                    goaway.encoded_len(),
                    FrameType::Goaway as u8,
                    frame.flags().bits(),
                    frame.stream_id(),
                );
                self.staging
                    .extend_from_slice(&(goaway.get_last_stream_id() & 0x7fff_ffff).to_be_bytes());
                self.staging
                    .extend_from_slice(&goaway.get_error_code().to_be_bytes());
                self.staging.extend_from_slice(goaway.get_debug_data());
                self.follow_up = FollowUp::None;
            }
            Payload::WindowUpdate(update) => {
                self.stage_header(
                    4,
                    FrameType::WindowUpdate as u8,
                    frame.flags().bits(),
                    frame.stream_id(),
                );
                self.staging
                    .extend_from_slice(&(update.get_increment() & 0x7fff_ffff).to_be_bytes());
                self.follow_up = FollowUp::None;
            }
            Payload::RstStream(reset) => {
                self.stage_header(
                    4,
                    FrameType::RstStream as u8,
                    frame.flags().bits(),
                    frame.stream_id(),
                );
                self.staging
                    .extend_from_slice(&reset.error_code().to_be_bytes());
                self.follow_up = FollowUp::None;
            }
            Payload::Ping(ping) => {
                self.stage_header(
                    8,
                    FrameType::Ping as u8,
                    frame.flags().bits(),
                    frame.stream_id(),
                );
                self.staging.extend_from_slice(&ping.data());
                self.follow_up = FollowUp::None;
            }
            Payload::Priority(_) | Payload::PushPromise(_) => {
                return Err(FrameEncoderErr::UnsupportedPayloadType);
            }
        }
        self.current = Some(frame);
        Ok(())
    }

    /// Serializes as much of the current frame as fits into `buf`,
    /// returning the number of bytes written. A return of zero means the
    /// frame is fully drained (or none is set).
    pub fn encode(&mut self, buf: &mut [u8]) -> Result<usize, FrameEncoderErr> {
        let mut written = 0;

        while written < buf.len() {
            // Drain staged header/control bytes first.
            if self.staged_pos < self.staging.len() {
                let n = (self.staging.len() - self.staged_pos).min(buf.len() - written);
                buf[written..written + n]
                    .copy_from_slice(&self.staging[self.staged_pos..self.staged_pos + n]);
                self.staged_pos += n;
                written += n;
                continue;
            }

            match self.follow_up {
                FollowUp::None => {
                    if self.current.take().is_some() {
                        self.staging.clear();
                        self.staged_pos = 0;
                    }
                    break;
                }
                FollowUp::Data => {
                    if self.encode_data_bytes(buf, &mut written)? {
                        break;
                    }
                }
                FollowUp::Block => {
                    if self.encode_block_bytes(buf, &mut written)? {
                        break;
                    }
                }
            }
        }
        Ok(written)
    }

    // Returns `true` once the whole DATA payload has been emitted.
    fn encode_data_bytes(
        &mut self,
        buf: &mut [u8],
        written: &mut usize,
    ) -> Result<bool, FrameEncoderErr> {
        let frame = self.current.as_ref().ok_or(FrameEncoderErr::NoCurrentFrame)?;
        let data = match frame.payload() {
            Payload::Data(data) => data,
            _ => return Err(FrameEncoderErr::UnexpectedPayloadType),
        };

        if self.chunk_remaining > 0 {
            let n = self.chunk_remaining.min(buf.len() - *written);
            buf[*written..*written + n]
                .copy_from_slice(&data.data()[self.data_pos..self.data_pos + n]);
            self.data_pos += n;
            self.chunk_remaining -= n;
            *written += n;
        }
        if self.chunk_remaining > 0 {
            // The output slice is full.
            return Ok(false);
        }
        if self.data_pos >= data.size() {
            self.current = None;
            self.staging.clear();
            self.staged_pos = 0;
            self.follow_up = FollowUp::None;
            return Ok(true);
        }
        // Stage the header of the next DATA chunk.
        let id = frame.stream_id();
        let flags = frame.flags().bits();
        let total = data.size();
        let pos = self.data_pos;
        self.stage_data_chunk(id, flags, total, pos);
        Ok(false)
    }

    // Returns `true` once the whole header block has been emitted.
    fn encode_block_bytes(
        &mut self,
        buf: &mut [u8],
        written: &mut usize,
    ) -> Result<bool, FrameEncoderErr> {
        let frame = self.current.as_ref().ok_or(FrameEncoderErr::NoCurrentFrame)?;
        let id = frame.stream_id();
        if !matches!(frame.payload(), Payload::Headers(_)) {
            return Err(FrameEncoderErr::UnexpectedPayloadType);
        }

        if self.block_pos < self.block_len {
            let n = (self.block_len - self.block_pos).min(buf.len() - *written);
            buf[*written..*written + n]
                .copy_from_slice(&self.block[self.block_pos..self.block_pos + n]);
            self.block_pos += n;
            *written += n;
        }
        if self.block_pos < self.block_len {
            return Ok(false);
        }
        if self.hpack.is_finished() {
            self.current = None;
            self.staging.clear();
            self.staged_pos = 0;
            self.follow_up = FollowUp::None;
            return Ok(true);
        }
        // The block overflowed the maximum frame size; continue it in a
        // CONTINUATION frame.
        self.block_len = self.hpack.encode(&mut self.block);
        self.block_pos = 0;
        let flags = if self.hpack.is_finished() {
            END_HEADERS_MASK
        } else {
            0
        };
        self.stage_header(self.block_len, FrameType::Continuation as u8, flags, id);
        Ok(false)
    }

    fn stage_data_chunk(&mut self, id: StreamId, flags: u8, total: usize, pos: usize) {
        let chunk = (total - pos).min(self.max_frame_size);
        let last = pos + chunk == total;
        let flags = if last { flags } else { flags & !END_STREAM_MASK };
        self.stage_header(chunk, FrameType::Data as u8, flags, id);
        self.chunk_remaining = chunk;
    }

    fn stage_header(&mut self, length: usize, frame_type: u8, flags: u8, id: StreamId) {
        self.staging.clear();
        self.staged_pos = 0;
        self.staging.push(((length >> 16) & 0xff) as u8);
        self.staging.push(((length >> 8) & 0xff) as u8);
        self.staging.push((length & 0xff) as u8);
        self.staging.push(frame_type);
        self.staging.push(flags);
        self.staging
            .extend_from_slice(&(id & 0x7fff_ffff).to_be_bytes());
    }
}

#[cfg(test)]
mod ut_frame_encoder {
    use super::*;
    use crate::frame::{
        Data, FrameFlags, Goaway, Headers, Ping, RstStream, SettingsBuilder, WindowUpdate,
    };
    use crate::metadata::SharedInterner;
    use crate::test_util::decode;
    use crate::{FrameDecoder, FrameKind};

    fn drain(encoder: &mut FrameEncoder) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 37];
        loop {
            let size = encoder.encode(&mut buf).unwrap();
            if size == 0 {
                break;
            }
            out.extend_from_slice(&buf[..size]);
        }
        out
    }

    /// UT test cases for DATA frame serialization.
    ///
    /// # Brief
    /// 1. Sets a DATA frame with END_STREAM.
    /// 2. Drains the encoder through a small buffer.
    /// 3. Checks the exact wire bytes.
    #[test]
    fn ut_frame_encoder_data() {
        let mut encoder = FrameEncoder::new(DEFAULT_MAX_FRAME_SIZE, false);
        let frame = Frame::new(
            1,
            FrameFlags::new(0x1),
            Payload::Data(Data::new(b"hello world".to_vec())),
        );
        encoder.set_frame(frame).unwrap();
        assert_eq!(
            drain(&mut encoder),
            decode("00000b00010000000168656c6c6f20776f726c64").unwrap()
        );
    }

    /// UT test cases for DATA splitting at the maximum frame size.
    ///
    /// # Brief
    /// 1. Configures a small maximum frame size.
    /// 2. Sets a DATA frame larger than it.
    /// 3. Checks that two DATA frames are produced and only the last one
    ///    carries END_STREAM.
    #[test]
    fn ut_frame_encoder_data_split() {
        let mut encoder = FrameEncoder::new(4, false);
        let frame = Frame::new(
            3,
            FrameFlags::new(0x1),
            Payload::Data(Data::new(b"abcdef".to_vec())),
        );
        encoder.set_frame(frame).unwrap();
        let out = drain(&mut encoder);
        let expected = decode("000004000000000003616263640000020001000000036566").unwrap();
        assert_eq!(out, expected);
    }

    /// UT test cases for an empty DATA frame.
    ///
    /// # Brief
    /// 1. Sets a zero-length DATA frame with END_STREAM.
    /// 2. Checks the single 9-byte frame.
    #[test]
    fn ut_frame_encoder_empty_data() {
        let mut encoder = FrameEncoder::new(DEFAULT_MAX_FRAME_SIZE, false);
        let frame = Frame::new(5, FrameFlags::new(0x1), Payload::Data(Data::new(vec![])));
        encoder.set_frame(frame).unwrap();
        assert_eq!(drain(&mut encoder), decode("000000000100000005").unwrap());
    }

    /// UT test cases for HEADERS serialization.
    ///
    /// # Brief
    /// 1. Encodes a HEADERS frame holding a known metadata list.
    /// 2. Checks the exact wire bytes against the RFC7541 example block.
    #[test]
    fn ut_frame_encoder_headers() {
        let interner = SharedInterner::new();
        let mut encoder = FrameEncoder::new(DEFAULT_MAX_FRAME_SIZE, false);
        let list = interner.list_from_pairs([
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            (":authority", "www.example.com"),
        ]);
        let mut flags = FrameFlags::empty();
        flags.set_end_headers(true);
        let frame = Frame::new(1, flags, Payload::Headers(Headers::new(list)));
        encoder.set_frame(frame).unwrap();
        assert_eq!(
            drain(&mut encoder),
            decode("000014010400000001828684410f7777772e6578616d706c652e636f6d").unwrap()
        );
    }

    /// UT test cases for CONTINUATION production.
    ///
    /// # Brief
    /// 1. Configures a tiny maximum frame size and a header block larger
    ///    than it.
    /// 2. Drains the encoder and re-decodes the result.
    /// 3. Checks that the block round-trips and only the last fragment
    ///    carried END_HEADERS.
    #[test]
    fn ut_frame_encoder_continuation() {
        let interner = SharedInterner::new();
        let mut encoder = FrameEncoder::new(8, false);
        let list = interner.list_from_pairs([
            (":method", "POST"),
            (":path", "/svc/Method"),
            ("content-type", "application/grpc"),
        ]);
        let mut flags = FrameFlags::empty();
        flags.set_end_headers(true);
        let frame = Frame::new(7, flags, Payload::Headers(Headers::new(list.clone())));
        encoder.set_frame(frame).unwrap();
        let out = drain(&mut encoder);

        // The first frame must be HEADERS without END_HEADERS.
        assert_eq!(out[3], 0x1);
        assert_eq!(out[4] & 0x4, 0);

        let mut decoder = FrameDecoder::new(SharedInterner::new());
        let frames = decoder.decode(&out).unwrap();
        let mut decoded = None;
        for kind in frames.iter() {
            match kind {
                FrameKind::Complete(frame) => decoded = Some(frame.clone()),
                FrameKind::Partial => {}
            }
        }
        let decoded = decoded.expect("no complete frame decoded!");
        assert_eq!(decoded.stream_id(), 7);
        match decoded.payload() {
            Payload::Headers(headers) => {
                assert_eq!(headers.list().len(), list.len());
                for (a, b) in headers.list().iter().zip(list.iter()) {
                    assert_eq!(a.key(), b.key());
                    assert_eq!(a.value(), b.value());
                }
            }
            _ => panic!("unexpected payload type!"),
        }
    }

    /// UT test cases for control frame serialization.
    ///
    /// # Brief
    /// 1. Encodes SETTINGS, PING, GOAWAY, RST_STREAM and WINDOW_UPDATE
    ///    frames.
    /// 2. Checks the exact wire bytes of each.
    #[test]
    fn ut_frame_encoder_control_frames() {
        let mut encoder = FrameEncoder::new(DEFAULT_MAX_FRAME_SIZE, false);

        let settings = SettingsBuilder::new()
            .header_table_size(4096)
            .initial_window_size(65535)
            .build();
        let frame = Frame::new(0, FrameFlags::empty(), Payload::Settings(settings));
        encoder.set_frame(frame).unwrap();
        assert_eq!(
            drain(&mut encoder),
            decode("00000c04000000000000010000100000040000ffff").unwrap()
        );

        let frame = Ping::ack(Ping::new(*b"pingtest"));
        encoder.set_frame(frame).unwrap();
        assert_eq!(
            drain(&mut encoder),
            decode("00000806010000000070696e6774657374").unwrap()
        );

        let frame = Frame::new(
            0,
            FrameFlags::empty(),
            Payload::Goaway(Goaway::new(2, 1, b"debug".to_vec())),
        );
        encoder.set_frame(frame).unwrap();
        assert_eq!(
            drain(&mut encoder),
            decode("00000d07000000000000000001000000026465627567").unwrap()
        );

        let frame = Frame::new(3, FrameFlags::empty(), Payload::RstStream(RstStream::new(8)));
        encoder.set_frame(frame).unwrap();
        assert_eq!(
            drain(&mut encoder),
            decode("00000403000000000300000008").unwrap()
        );

        let frame = Frame::new(
            0,
            FrameFlags::empty(),
            Payload::WindowUpdate(WindowUpdate::new(1000)),
        );
        encoder.set_frame(frame).unwrap();
        assert_eq!(
            drain(&mut encoder),
            decode("000004080000000000000003e8").unwrap()
        );
    }

    /// UT test cases for local usage errors.
    ///
    /// # Brief
    /// 1. Submits a HEADERS frame without END_HEADERS.
    /// 2. Submits an unsupported payload type.
    /// 3. Checks the reported errors.
    #[test]
    fn ut_frame_encoder_usage_errors() {
        let mut encoder = FrameEncoder::new(DEFAULT_MAX_FRAME_SIZE, false);
        let frame = Frame::new(
            1,
            FrameFlags::empty(),
            Payload::Headers(Headers::new(Default::default())),
        );
        assert!(matches!(
            encoder.set_frame(frame),
            Err(FrameEncoderErr::HeadersNotEnd)
        ));

        let frame = Frame::new(
            1,
            FrameFlags::empty(),
            Payload::Priority(crate::frame::Priority::new(false, 0, 16)),
        );
        assert!(matches!(
            encoder.set_frame(frame),
            Err(FrameEncoderErr::UnsupportedPayloadType)
        ));
    }
}
