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

use std::sync::Arc;

use crate::call::CallCredentials;

const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024;
const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 16 * 1024;
// Connection-level receive window. The protocol's initial value is 65535;
// a larger window is advertised with WINDOW_UPDATE right after SETTINGS and
// kept in sync by the manager as data is consumed.
const DEFAULT_CONN_WINDOW_SIZE: u32 = 10 * 1024 * 1024;
const DEFAULT_STREAM_WINDOW_SIZE: u32 = 2 * 1024 * 1024;
const DEFAULT_ALLOWED_CACHE_FRAME_NUM: usize = 5;

/// Settings that configure one transport connection.
#[derive(Clone, Default)]
pub struct TransportConfig {
    inner: Inner,
}

#[derive(Clone)]
struct Inner {
    max_frame_size: u32,
    max_header_list_size: u32,
    header_table_size: u32,
    init_conn_window_size: u32,
    init_stream_window_size: u32,
    allowed_cache_frame_num: usize,
    use_huffman: bool,
    credentials: Option<Arc<dyn CallCredentials>>,
}

impl TransportConfig {
    /// `TransportConfig` constructor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the SETTINGS_MAX_FRAME_SIZE to advertise.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.inner.max_frame_size = size;
    }

    /// Sets the SETTINGS_MAX_HEADER_LIST_SIZE to advertise.
    pub fn set_max_header_list_size(&mut self, size: u32) {
        self.inner.max_header_list_size = size;
    }

    /// Sets the SETTINGS_HEADER_TABLE_SIZE to advertise.
    pub fn set_header_table_size(&mut self, size: u32) {
        self.inner.header_table_size = size;
    }

    /// Sets the connection-level receive window.
    pub fn set_conn_window_size(&mut self, size: u32) {
        self.inner.init_conn_window_size = size;
    }

    /// Sets the per-stream receive window advertised as
    /// SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn set_stream_window_size(&mut self, size: u32) {
        self.inner.init_stream_window_size = size;
    }

    /// Sets the number of decoded frames each stream may buffer before the
    /// reader is backpressured.
    pub fn set_allowed_cache_frame_num(&mut self, num: usize) {
        self.inner.allowed_cache_frame_num = num;
    }

    /// Sets whether metadata string literals are Huffman coded.
    pub fn set_use_huffman_coding(&mut self, use_huffman: bool) {
        self.inner.use_huffman = use_huffman;
    }

    /// Sets the credentials applied to every call opened on the connection.
    pub fn set_call_credentials(&mut self, credentials: Arc<dyn CallCredentials>) {
        self.inner.credentials = Some(credentials);
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.inner.max_frame_size
    }

    pub(crate) fn max_header_list_size(&self) -> u32 {
        self.inner.max_header_list_size
    }

    pub(crate) fn header_table_size(&self) -> u32 {
        self.inner.header_table_size
    }

    pub(crate) fn conn_window_size(&self) -> u32 {
        self.inner.init_conn_window_size
    }

    pub(crate) fn stream_window_size(&self) -> u32 {
        self.inner.init_stream_window_size
    }

    pub(crate) fn allowed_cache_frame_num(&self) -> usize {
        self.inner.allowed_cache_frame_num
    }

    pub(crate) fn use_huffman_coding(&self) -> bool {
        self.inner.use_huffman
    }

    pub(crate) fn call_credentials(&self) -> Option<Arc<dyn CallCredentials>> {
        self.inner.credentials.clone()
    }
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            init_conn_window_size: DEFAULT_CONN_WINDOW_SIZE,
            init_stream_window_size: DEFAULT_STREAM_WINDOW_SIZE,
            allowed_cache_frame_num: DEFAULT_ALLOWED_CACHE_FRAME_NUM,
            use_huffman: true,
            credentials: None,
        }
    }
}
