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

//! Send and receive window definitions.

use kite_rpc::{ErrorCode, Frame, FrameFlags, Http2Error, Payload, StreamId, WindowUpdate};

use crate::buffer::MAX_FLOW_CONTROL_WINDOW;

/// The sender-side view of a window: the authoritative limit on how many
/// bytes may still be emitted. Only SETTINGS and WINDOW_UPDATE frames from
/// the peer replenish it; sending data drains it. The size may transiently
/// go negative when the peer shrinks SETTINGS_INITIAL_WINDOW_SIZE.
pub(crate) struct SendWindow {
    size: i32,
}

impl SendWindow {
    pub(crate) fn new(size: i32) -> Self {
        Self { size }
    }

    pub(crate) fn size_available(&self) -> u32 {
        if self.size < 0 {
            0
        } else {
            self.size as u32
        }
    }

    pub(crate) fn reduce_size(&mut self, size: u32) {
        self.size -= size as i32;
    }

    /// Applies a WINDOW_UPDATE increment. An overflow past the protocol
    /// maximum is a flow-control violation.
    pub(crate) fn increase_size(&mut self, size: u32) -> Result<(), Http2Error> {
        let (curr, overflow) = self.size.overflowing_add(size as i32);
        if overflow || curr > MAX_FLOW_CONTROL_WINDOW as i32 {
            return Err(Http2Error::Connection(ErrorCode::FlowControlError));
        }
        self.size = curr;
        Ok(())
    }

    pub(crate) fn send_data(&mut self, size: u32) {
        self.size -= size as i32;
    }
}

/// The receiver-side view of a window, split in two:
///
/// - `notification` is what the peer sees: it shrinks when DATA arrives and
///   grows when a WINDOW_UPDATE is sent. The peer violating it (driving it
///   negative) is a fatal flow-control error.
/// - `actual` is the locally configured window size; it changes only when
///   the configuration does.
///
/// The gap between the two is the "unreleased" amount; once it exceeds half
/// the configured window, a WINDOW_UPDATE is due. This decouples wire-level
/// accounting from application consumption speed.
#[derive(Default)]
pub(crate) struct RecvWindow {
    notification: i32,
    actual: i32,
}

impl RecvWindow {
    pub(crate) fn new(size: i32) -> Self {
        Self {
            notification: size,
            actual: size,
        }
    }

    pub(crate) fn unreleased_size(&self) -> Option<u32> {
        let unreleased = self.actual - self.notification;
        if unreleased <= 0 {
            return None;
        }
        if unreleased * 2 > self.notification {
            Some(unreleased as u32)
        } else {
            None
        }
    }

    pub(crate) fn actual_size(&self) -> i32 {
        self.actual
    }

    pub(crate) fn notification_available(&self) -> u32 {
        if self.notification < 0 {
            0
        } else {
            self.notification as u32
        }
    }

    pub(crate) fn reduce_actual(&mut self, size: u32) {
        self.actual -= size as i32
    }

    pub(crate) fn increase_actual(&mut self, size: u32) {
        self.actual += size as i32
    }

    pub(crate) fn reduce_notification(&mut self, size: u32) {
        self.notification -= size as i32
    }

    pub(crate) fn increase_notification(&mut self, size: u32) {
        self.notification += size as i32
    }

    /// Builds the WINDOW_UPDATE frame for the unreleased amount, if one is
    /// due, and accounts for it.
    pub(crate) fn check_window_update(&mut self, id: StreamId) -> Option<Frame> {
        let size = self.unreleased_size()?;
        self.increase_notification(size);
        Some(Frame::new(
            id,
            FrameFlags::empty(),
            Payload::WindowUpdate(WindowUpdate::new(size)),
        ))
    }

    /// Accounts received DATA bytes against the peer-visible window.
    pub(crate) fn recv_data(&mut self, size: u32) {
        self.notification -= size as i32;
    }
}

#[cfg(test)]
mod ut_send_window {
    use super::*;

    /// UT test case for `SendWindow` arithmetic.
    ///
    /// # Brief
    /// 1. Creates a `SendWindow` and drains part of it.
    /// 2. Checks the available size, including the negative case.
    #[test]
    fn ut_send_window_size() {
        let mut window = SendWindow::new(100);
        assert_eq!(window.size_available(), 100);
        window.send_data(50);
        assert_eq!(window.size_available(), 50);
        window.reduce_size(60);
        assert_eq!(window.size_available(), 0);
    }

    /// UT test case for `SendWindow::increase_size`.
    ///
    /// # Brief
    /// 1. Increases the window within bounds.
    /// 2. Increases it past the protocol maximum.
    /// 3. Checks the flow-control error.
    #[test]
    fn ut_send_window_increase_size() {
        let mut window = SendWindow::new(100);
        assert!(window.increase_size(50).is_ok());
        assert_eq!(window.size_available(), 150);

        let mut window = SendWindow::new(i32::MAX);
        assert_eq!(
            window.increase_size(1),
            Err(Http2Error::Connection(ErrorCode::FlowControlError))
        );

        let mut window = SendWindow::new(1);
        assert_eq!(
            window.increase_size(MAX_FLOW_CONTROL_WINDOW),
            Err(Http2Error::Connection(ErrorCode::FlowControlError))
        );
    }
}

#[cfg(test)]
mod ut_recv_window {
    use super::*;

    /// UT test case for `RecvWindow::unreleased_size`.
    ///
    /// # Brief
    /// 1. Receives data against the window.
    /// 2. Checks that an update is due only past the half-window mark.
    #[test]
    fn ut_recv_window_unreleased_size() {
        let mut window = RecvWindow::new(100);
        assert_eq!(window.unreleased_size(), None);
        window.recv_data(20);
        assert_eq!(window.unreleased_size(), None);
        window.recv_data(30);
        assert_eq!(window.unreleased_size(), Some(50));
    }

    /// UT test case for `RecvWindow::check_window_update`.
    ///
    /// # Brief
    /// 1. Receives data past the half-window mark.
    /// 2. Checks that a WINDOW_UPDATE frame is produced once and the
    ///    notification window is replenished.
    #[test]
    fn ut_recv_window_check_window_update() {
        let mut window = RecvWindow::new(100);
        assert!(window.check_window_update(1).is_none());
        window.recv_data(60);
        let frame = window.check_window_update(1).unwrap();
        assert_eq!(frame.stream_id(), 1);
        match frame.payload() {
            Payload::WindowUpdate(update) => assert_eq!(update.get_increment(), 60),
            _ => panic!("unexpected payload type!"),
        }
        assert_eq!(window.notification_available(), 100);
        assert!(window.check_window_update(1).is_none());
    }

    /// UT test case for the notification/actual split.
    ///
    /// # Brief
    /// 1. Grows the actual window beyond the notification window.
    /// 2. Checks the unreleased gap is reported.
    #[test]
    fn ut_recv_window_actual_split() {
        let mut window = RecvWindow::new(100);
        window.increase_actual(100);
        assert_eq!(window.actual_size(), 200);
        assert_eq!(window.unreleased_size(), Some(100));
        window.reduce_actual(150);
        assert_eq!(window.actual_size(), 50);
        assert_eq!(window.notification_available(), 100);
    }
}
