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

//! Connection-level flow control.

use kite_rpc::{Frame, Http2Error};

use crate::buffer::window::RecvWindow;
use crate::buffer::SendWindow;

pub(crate) struct FlowControl {
    recv_window: RecvWindow,
    send_window: SendWindow,
}

impl FlowControl {
    pub(crate) fn new(conn_recv_window: u32, conn_send_window: u32) -> Self {
        FlowControl {
            recv_window: RecvWindow::new(conn_recv_window as i32),
            send_window: SendWindow::new(conn_send_window as i32),
        }
    }

    pub(crate) fn check_conn_recv_window_update(&mut self) -> Option<Frame> {
        self.recv_window.check_window_update(0)
    }

    /// Resizes the configured connection receive window; the difference to
    /// the protocol's initial 65535 is released to the peer through the
    /// next WINDOW_UPDATE check.
    pub(crate) fn setup_recv_window(&mut self, size: u32) {
        let actual = self.recv_window.actual_size() as u32;
        if size > actual {
            self.recv_window.increase_actual(size - actual);
        } else {
            self.recv_window.reduce_actual(actual - size);
        }
    }

    pub(crate) fn increase_send_size(&mut self, size: u32) -> Result<(), Http2Error> {
        self.send_window.increase_size(size)
    }

    pub(crate) fn send_size_available(&self) -> usize {
        self.send_window.size_available() as usize
    }

    pub(crate) fn recv_notification_size_available(&self) -> u32 {
        self.recv_window.notification_available()
    }

    pub(crate) fn send_data(&mut self, size: u32) {
        self.send_window.send_data(size)
    }

    pub(crate) fn recv_data(&mut self, size: u32) {
        self.recv_window.recv_data(size)
    }
}

#[cfg(test)]
mod ut_flow_control {
    use super::*;

    /// UT test case for `FlowControl::setup_recv_window`.
    ///
    /// # Brief
    /// 1. Grows the configured window beyond the protocol default.
    /// 2. Checks that the surplus is released through a connection
    ///    WINDOW_UPDATE.
    #[test]
    fn ut_flow_control_setup_recv_window() {
        let mut flow = FlowControl::new(65535, 65535);
        flow.setup_recv_window(1 << 20);
        let frame = flow.check_conn_recv_window_update().unwrap();
        assert_eq!(frame.stream_id(), 0);
        match frame.payload() {
            kite_rpc::Payload::WindowUpdate(update) => {
                assert_eq!(update.get_increment(), (1 << 20) - 65535);
            }
            _ => panic!("unexpected payload type!"),
        }
        assert!(flow.check_conn_recv_window_update().is_none());
    }

    /// UT test case for connection send/receive accounting.
    ///
    /// # Brief
    /// 1. Sends and receives data through the connection windows.
    /// 2. Checks both directions drain independently.
    #[test]
    fn ut_flow_control_send_and_recv() {
        let mut flow = FlowControl::new(100, 200);
        flow.send_data(50);
        flow.recv_data(60);
        assert_eq!(flow.send_size_available(), 150);
        assert_eq!(flow.recv_notification_size_available(), 40);
        assert!(flow.increase_send_size(25).is_ok());
        assert_eq!(flow.send_size_available(), 175);
    }
}
