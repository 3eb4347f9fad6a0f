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

use crate::error::{ErrorCode, Http2Error};
use crate::metadata::MetadataList;

/// Type StreamId.
/// Streams are identified by an unsigned 31-bit integer; client-initiated
/// streams use odd identifiers, monotonically increasing within a
/// connection.
pub type StreamId = u32;

/// The connection preface. It must be sent (client side) and verified
/// (accept side) before any frame crosses the wire.
pub const CONNECTION_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Verifies that `buf` starts with the connection preface. Returns the
/// number of preface bytes consumed on success; a mismatch is a
/// connection-level protocol error.
pub fn validate_preface(buf: &[u8]) -> Result<usize, Http2Error> {
    if buf.len() < CONNECTION_PREFACE.len() {
        return Err(Http2Error::Connection(ErrorCode::ProtocolError));
    }
    if &buf[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE.as_slice() {
        return Err(Http2Error::Connection(ErrorCode::ProtocolError));
    }
    Ok(CONNECTION_PREFACE.len())
}

/// Mask for the END_STREAM flag.
/// When set, the sender will not send further frames for this stream.
pub(crate) const END_STREAM_MASK: u8 = 0x01;

/// Mask for the END_HEADERS flag.
/// When set, the frame carries an entire header block and not a fragment.
pub(crate) const END_HEADERS_MASK: u8 = 0x04;

/// Mask for the PADDED flag.
/// When set, the frame payload is followed by a padding field.
pub(crate) const PADDED_MASK: u8 = 0x08;

/// Mask for the PRIORITY flag on HEADERS frames.
pub(crate) const HEADERS_PRIORITY_MASK: u8 = 0x20;

/// Mask for the ACK flag, significant for SETTINGS and PING.
pub(crate) const ACK_MASK: u8 = 0x1;

/// One frame of the wire protocol: a stream identifier, the flag octet and
/// the typed payload. The 9-byte header is materialized by the codec.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    id: StreamId,
    flags: FrameFlags,
    payload: Payload,
}

/// The type octet of a frame.
#[derive(PartialEq, Eq, Debug)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// The type-specific payload of a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// HEADERS frame payload.
    Headers(Headers),
    /// DATA frame payload.
    Data(Data),
    /// PRIORITY frame payload.
    Priority(Priority),
    /// RST_STREAM frame payload.
    RstStream(RstStream),
    /// PING frame payload.
    Ping(Ping),
    /// SETTINGS frame payload.
    Settings(Settings),
    /// GOAWAY frame payload.
    Goaway(Goaway),
    /// WINDOW_UPDATE frame payload.
    WindowUpdate(WindowUpdate),
    /// PUSH_PROMISE frame payload.
    PushPromise(PushPromise),
}

/// The parameters a SETTINGS frame may carry.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Setting {
    /// SETTINGS_HEADER_TABLE_SIZE
    HeaderTableSize(u32),
    /// SETTINGS_ENABLE_PUSH
    EnablePush(bool),
    /// SETTINGS_MAX_CONCURRENT_STREAMS
    MaxConcurrentStreams(u32),
    /// SETTINGS_INITIAL_WINDOW_SIZE
    InitialWindowSize(u32),
    /// SETTINGS_MAX_FRAME_SIZE
    MaxFrameSize(u32),
    /// SETTINGS_MAX_HEADER_LIST_SIZE
    MaxHeaderListSize(u32),
}

/// The flag octet of a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameFlags(u8);

/// HEADERS frame payload: one complete header block, decoded to (or encoded
/// from) an ordered metadata list.
#[derive(Clone, Debug, PartialEq)]
pub struct Headers {
    list: MetadataList,
}

/// DATA frame payload with any padding already removed. The bytes are
/// opaque to the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct Data {
    data: Vec<u8>,
}

/// PRIORITY frame payload. Accepted on receipt for compatibility; the
/// transport never emits priority information.
#[derive(Clone, Debug, PartialEq)]
pub struct Priority {
    exclusive: bool,
    stream_dependency: u32,
    weight: u8,
}

/// RST_STREAM frame payload, requesting immediate termination of a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct RstStream {
    error_code: u32,
}

/// PING frame payload: eight opaque octets echoed back by the peer.
#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
    /// The opaque data of PING.
    pub data: [u8; 8],
}

/// SETTINGS frame payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    settings: Vec<Setting>,
}

/// GOAWAY frame payload, initiating orderly shutdown of a connection.
#[derive(Clone, Debug, PartialEq)]
pub struct Goaway {
    error_code: u32,
    last_stream_id: StreamId,
    debug_data: Vec<u8>,
}

/// WINDOW_UPDATE frame payload.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowUpdate {
    window_size_increment: u32,
}

/// PUSH_PROMISE frame payload. Decoded for wire completeness; the transport
/// advertises push as disabled and treats an incoming promise as a protocol
/// error at the dispatch layer.
#[derive(Clone, Debug, PartialEq)]
pub struct PushPromise {
    promised_stream_id: StreamId,
    list: MetadataList,
}

/// A builder of SETTINGS payloads.
pub struct SettingsBuilder {
    settings: Vec<Setting>,
}

impl Frame {
    /// Constructs a new `Frame` from its stream id, flags and payload.
    pub fn new(id: StreamId, flags: FrameFlags, payload: Payload) -> Self {
        Frame { id, flags, payload }
    }

    /// Returns the stream identifier of the frame.
    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    /// Returns a reference to the frame's flags.
    pub fn flags(&self) -> &FrameFlags {
        &self.flags
    }

    /// Returns a reference to the frame's payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consumes the frame, returning its payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

impl FrameFlags {
    /// Creates a `FrameFlags` from the given flag octet.
    pub fn new(flags: u8) -> Self {
        FrameFlags(flags)
    }

    /// Creates a `FrameFlags` with no flags set.
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Whether the END_STREAM flag is set.
    pub fn is_end_stream(&self) -> bool {
        self.0 & END_STREAM_MASK == END_STREAM_MASK
    }

    /// Whether the END_HEADERS flag is set.
    pub fn is_end_headers(&self) -> bool {
        self.0 & END_HEADERS_MASK == END_HEADERS_MASK
    }

    /// Whether the PADDED flag is set.
    pub fn is_padded(&self) -> bool {
        self.0 & PADDED_MASK == PADDED_MASK
    }

    /// Whether the ACK flag is set.
    pub fn is_ack(&self) -> bool {
        self.0 & ACK_MASK == ACK_MASK
    }

    /// Gets the flag octet.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Sets the END_STREAM flag.
    pub fn set_end_stream(&mut self, end_stream: bool) {
        if end_stream {
            self.0 |= END_STREAM_MASK;
        } else {
            self.0 &= !END_STREAM_MASK;
        }
    }

    /// Sets the END_HEADERS flag.
    pub fn set_end_headers(&mut self, end_headers: bool) {
        if end_headers {
            self.0 |= END_HEADERS_MASK;
        } else {
            self.0 &= !END_HEADERS_MASK;
        }
    }
}

impl Payload {
    /// Returns the `FrameType` this payload serializes as.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Payload::Headers(_) => FrameType::Headers,
            Payload::Data(_) => FrameType::Data,
            Payload::Priority(_) => FrameType::Priority,
            Payload::Ping(_) => FrameType::Ping,
            Payload::RstStream(_) => FrameType::RstStream,
            Payload::Settings(_) => FrameType::Settings,
            Payload::Goaway(_) => FrameType::Goaway,
            Payload::WindowUpdate(_) => FrameType::WindowUpdate,
            Payload::PushPromise(_) => FrameType::PushPromise,
        }
    }
}

impl Headers {
    /// Creates a HEADERS payload from an ordered metadata list.
    pub fn new(list: MetadataList) -> Self {
        Headers { list }
    }

    /// Returns the decoded metadata list.
    pub fn list(&self) -> &MetadataList {
        &self.list
    }

    /// Consumes the payload, returning the metadata list.
    pub fn into_list(self) -> MetadataList {
        self.list
    }
}

impl Data {
    /// Creates a DATA payload from the given bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Data { data }
    }

    /// Returns the payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the number of payload bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Consumes the payload, returning its bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl Settings {
    /// Creates a SETTINGS payload from the given parameters.
    pub fn new(settings: Vec<Setting>) -> Self {
        Settings { settings }
    }

    /// Returns the contained parameters.
    pub fn get_settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Returns the encoded length of the payload: each parameter occupies a
    /// 2-byte identifier and a 4-byte value.
    pub fn encoded_len(&self) -> usize {
        self.settings.len() * 6
    }

    /// Returns a SETTINGS acknowledgment frame.
    pub fn ack() -> Frame {
        Frame::new(
            0,
            FrameFlags::new(ACK_MASK),
            Payload::Settings(Settings::new(vec![])),
        )
    }
}

impl Setting {
    /// Returns the wire identifier of the parameter.
    pub fn setting_identifier(&self) -> u16 {
        match self {
            Setting::HeaderTableSize(_) => 0x01,
            Setting::EnablePush(_) => 0x02,
            Setting::MaxConcurrentStreams(_) => 0x03,
            Setting::InitialWindowSize(_) => 0x04,
            Setting::MaxFrameSize(_) => 0x05,
            Setting::MaxHeaderListSize(_) => 0x06,
        }
    }

    /// Returns the wire value of the parameter.
    pub fn value(&self) -> u32 {
        match *self {
            Setting::HeaderTableSize(v) => v,
            Setting::EnablePush(v) => v as u32,
            Setting::MaxConcurrentStreams(v) => v,
            Setting::InitialWindowSize(v) => v,
            Setting::MaxFrameSize(v) => v,
            Setting::MaxHeaderListSize(v) => v,
        }
    }
}

impl SettingsBuilder {
    /// `SettingsBuilder` constructor.
    pub fn new() -> Self {
        SettingsBuilder { settings: vec![] }
    }

    /// SETTINGS_HEADER_TABLE_SIZE (0x01) setting.
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.push(Setting::HeaderTableSize(size));
        self
    }

    /// SETTINGS_ENABLE_PUSH (0x02) setting.
    pub fn enable_push(mut self, is_enable: bool) -> Self {
        self.settings.push(Setting::EnablePush(is_enable));
        self
    }

    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x03) setting.
    pub fn max_concurrent_streams(mut self, num: u32) -> Self {
        self.settings.push(Setting::MaxConcurrentStreams(num));
        self
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE (0x04) setting.
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.push(Setting::InitialWindowSize(size));
        self
    }

    /// SETTINGS_MAX_FRAME_SIZE (0x05) setting.
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.push(Setting::MaxFrameSize(size));
        self
    }

    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x06) setting.
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.push(Setting::MaxHeaderListSize(size));
        self
    }

    /// Consumes the builder and constructs a SETTINGS payload.
    pub fn build(self) -> Settings {
        Settings::new(self.settings)
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Goaway {
    /// Creates a GOAWAY payload from the error code, the last stream id the
    /// sender will process, and opaque debug data.
    pub fn new(error_code: u32, last_stream_id: StreamId, debug_data: Vec<u8>) -> Self {
        Goaway {
            error_code,
            last_stream_id,
            debug_data,
        }
    }

    /// Returns the debug data.
    pub fn get_debug_data(&self) -> &[u8] {
        &self.debug_data
    }

    /// Returns the identifier of the last stream the sender will process.
    pub fn get_last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    /// Returns the error code.
    pub fn get_error_code(&self) -> u32 {
        self.error_code
    }

    /// Returns the encoded length: 4-byte last-stream-id, 4-byte error code
    /// and the debug data.
    pub fn encoded_len(&self) -> usize {
        8 + self.debug_data.len()
    }
}

impl WindowUpdate {
    /// Creates a WINDOW_UPDATE payload with the given increment.
    pub fn new(window_size_increment: u32) -> Self {
        WindowUpdate {
            window_size_increment,
        }
    }

    /// Returns the window size increment.
    pub fn get_increment(&self) -> u32 {
        self.window_size_increment
    }
}

impl Priority {
    /// Creates a PRIORITY payload.
    pub fn new(exclusive: bool, stream_dependency: u32, weight: u8) -> Self {
        Priority {
            exclusive,
            stream_dependency,
            weight,
        }
    }

    /// Returns whether the dependency is exclusive.
    pub fn get_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Returns the stream dependency.
    pub fn get_stream_dependency(&self) -> u32 {
        self.stream_dependency
    }

    /// Returns the weight.
    pub fn get_weight(&self) -> u8 {
        self.weight
    }
}

impl RstStream {
    /// Creates a RST_STREAM payload with the given error code.
    pub fn new(error_code: u32) -> Self {
        Self { error_code }
    }

    /// Returns the raw error code.
    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    /// Converts the payload into the stream error it conveys.
    pub fn error(&self, id: StreamId) -> Result<Http2Error, Http2Error> {
        Ok(Http2Error::Stream(id, ErrorCode::try_from(self.error_code)?))
    }

    /// Whether the error code is NO_ERROR.
    pub fn is_no_error(&self) -> bool {
        self.error_code == 0
    }
}

impl Ping {
    /// Creates a PING payload with the given opaque data.
    pub fn new(data: [u8; 8]) -> Self {
        Ping { data }
    }

    /// Returns the opaque data.
    pub fn data(&self) -> [u8; 8] {
        self.data
    }

    /// Returns the acknowledgment frame for a received PING.
    pub fn ack(ping: Ping) -> Frame {
        Frame::new(0, FrameFlags::new(ACK_MASK), Payload::Ping(ping))
    }
}

impl PushPromise {
    /// `PushPromise` constructor.
    pub fn new(promised_stream_id: StreamId, list: MetadataList) -> Self {
        Self {
            promised_stream_id,
            list,
        }
    }

    /// Returns the promised stream id.
    pub fn promised_stream_id(&self) -> StreamId {
        self.promised_stream_id
    }
}

#[cfg(test)]
mod ut_frame {
    use super::*;

    /// UT test cases for `SettingsBuilder`.
    ///
    /// # Brief
    /// 1. Creates a `SettingsBuilder` and sets various parameters.
    /// 2. Builds a `Settings` payload.
    /// 3. Checks that every parameter appears in order with the expected
    ///    value.
    #[test]
    fn ut_settings_builder() {
        let settings = SettingsBuilder::new()
            .header_table_size(4096)
            .enable_push(false)
            .max_concurrent_streams(100)
            .max_frame_size(16384)
            .build();

        let mut iter = settings.get_settings().iter();
        assert_eq!(iter.next(), Some(&Setting::HeaderTableSize(4096)));
        assert_eq!(iter.next(), Some(&Setting::EnablePush(false)));
        assert_eq!(iter.next(), Some(&Setting::MaxConcurrentStreams(100)));
        assert_eq!(iter.next(), Some(&Setting::MaxFrameSize(16384)));
        assert_eq!(iter.next(), None);
        assert_eq!(settings.encoded_len(), 4 * 6);
    }

    /// UT test cases for `FrameFlags`.
    ///
    /// # Brief
    /// 1. Sets and clears flags on an empty `FrameFlags`.
    /// 2. Checks each predicate.
    #[test]
    fn ut_frame_flags() {
        let mut flags = FrameFlags::empty();
        assert!(!flags.is_end_stream());
        flags.set_end_stream(true);
        flags.set_end_headers(true);
        assert!(flags.is_end_stream());
        assert!(flags.is_end_headers());
        assert_eq!(flags.bits(), 0x05);
        flags.set_end_stream(false);
        assert_eq!(flags.bits(), 0x04);

        assert!(FrameFlags::new(0x08).is_padded());
        assert!(FrameFlags::new(0x01).is_ack());
    }

    /// UT test cases for `validate_preface`.
    ///
    /// # Brief
    /// 1. Validates the canonical preface, a truncated buffer and corrupted
    ///    bytes.
    /// 2. Checks the consumed length and the error level.
    #[test]
    fn ut_validate_preface() {
        let mut buf = CONNECTION_PREFACE.to_vec();
        buf.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 0, 0]);
        assert_eq!(validate_preface(&buf), Ok(24));
        assert_eq!(
            validate_preface(&buf[..10]),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
        buf[0] = b'X';
        assert_eq!(
            validate_preface(&buf),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        );
    }

    /// UT test cases for `Payload::frame_type` and helpers.
    ///
    /// # Brief
    /// 1. Creates a payload of each variant.
    /// 2. Checks the reported frame type and a few payload accessors.
    #[test]
    fn ut_payload() {
        let headers = Payload::Headers(Headers::new(MetadataList::new()));
        assert_eq!(headers.frame_type(), FrameType::Headers);

        let data = Payload::Data(Data::new(b"hh".to_vec()));
        assert_eq!(data.frame_type(), FrameType::Data);

        let ping = Ping::new([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ping.data(), [1, 2, 3, 4, 5, 6, 7, 8]);
        let ack = Ping::ack(ping);
        assert!(ack.flags().is_ack());
        assert_eq!(ack.stream_id(), 0);

        let goaway = Goaway::new(2, 5, b"debug".to_vec());
        assert_eq!(goaway.encoded_len(), 13);
        assert_eq!(goaway.get_last_stream_id(), 5);

        let reset = RstStream::new(8);
        assert!(!reset.is_no_error());
        assert_eq!(
            reset.error(3),
            Ok(Http2Error::Stream(3, ErrorCode::Cancel))
        );

        let update = WindowUpdate::new(1024);
        assert_eq!(update.get_increment(), 1024);
    }
}
