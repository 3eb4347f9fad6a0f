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

//! Flow-control windows at connection and stream level.

mod settings;
mod window;

pub(crate) use settings::FlowControl;
pub(crate) use window::{RecvWindow, SendWindow};

/// The protocol's maximum flow-control window, 2^31 - 1.
pub(crate) const MAX_FLOW_CONTROL_WINDOW: u32 = (1 << 31) - 1;
