//! Fixed-layout control messages.
//!
//! Each message lives in its own flat module exposing the message `ID`,
//! the exact wire `SIZE`, an `encode` builder writing at offset 0 and
//! returning the new write offset, and positional accessors over a
//! received frame. None of the functions allocate or keep state.
//!
//! | Id | Message            | Body                          |
//! |----|--------------------|-------------------------------|
//! | 1  | Ping               | empty                         |
//! | 5  | RegisterRequest    | empty                         |
//! | 6  | RegisterReply      | device id (2 x u64)           |
//! | 7  | TrackerLinkRequest | device id                     |
//! | 8  | TrackerLinkReply   | link code (i32)               |
//! | 9  | MonitorLinkRequest | link code (i32)               |
//! | 10 | MonitorLinkReply   | device id, nil on failure     |
//! | 11 | StreamOpenRequest  | device id                     |
//!
//! Resync (12/13) and Tracking (16) have variable layouts and live in
//! [`crate::resync`] and [`crate::tracking`].

/// Keep-alive; carries nothing and triggers nothing.
pub mod ping {
    use crate::wire;

    pub const ID: u16 = 1;
    pub const SIZE: usize = wire::HEADER_SIZE;

    pub fn encode(buf: &mut [u8]) -> usize {
        wire::put_header(buf, SIZE as u16, ID)
    }
}

/// Sent by a tracker once to obtain a fresh device identifier.
pub mod register_request {
    use crate::wire;

    pub const ID: u16 = 5;
    pub const SIZE: usize = wire::HEADER_SIZE;

    pub fn encode(buf: &mut [u8]) -> usize {
        wire::put_header(buf, SIZE as u16, ID)
    }
}

/// Server response to [`register_request`]; the connection is closed
/// right after it is sent.
pub mod register_reply {
    use crate::{bytes, wire};
    use uuid::Uuid;

    pub const ID: u16 = 6;
    pub const SIZE: usize = wire::HEADER_SIZE + 16;

    pub fn encode(buf: &mut [u8], device_id: Uuid) -> usize {
        let pos = wire::put_header(buf, SIZE as u16, ID);
        bytes::put_device_id(buf, pos, device_id)
    }

    pub fn device_id(buf: &[u8]) -> Uuid {
        bytes::get_device_id(buf, wire::HEADER_SIZE)
    }
}

/// Tracker asks for a short link code to show to the user.
pub mod tracker_link_request {
    use crate::{bytes, wire};
    use uuid::Uuid;

    pub const ID: u16 = 7;
    pub const SIZE: usize = wire::HEADER_SIZE + 16;

    pub fn encode(buf: &mut [u8], device_id: Uuid) -> usize {
        let pos = wire::put_header(buf, SIZE as u16, ID);
        bytes::put_device_id(buf, pos, device_id)
    }

    pub fn device_id(buf: &[u8]) -> Uuid {
        bytes::get_device_id(buf, wire::HEADER_SIZE)
    }
}

/// Link code issued to a tracker, valid until the link request expires.
pub mod tracker_link_reply {
    use crate::{bytes, wire};

    pub const ID: u16 = 8;
    pub const SIZE: usize = wire::HEADER_SIZE + 4;

    pub fn encode(buf: &mut [u8], link_code: i32) -> usize {
        let pos = wire::put_header(buf, SIZE as u16, ID);
        bytes::put_i32(buf, pos, link_code)
    }

    pub fn link_code(buf: &[u8]) -> i32 {
        bytes::get_i32(buf, wire::HEADER_SIZE)
    }
}

/// Monitor redeems a link code it got from the tracker's user.
pub mod monitor_link_request {
    use crate::{bytes, wire};

    pub const ID: u16 = 9;
    pub const SIZE: usize = wire::HEADER_SIZE + 4;

    pub fn encode(buf: &mut [u8], link_code: i32) -> usize {
        let pos = wire::put_header(buf, SIZE as u16, ID);
        bytes::put_i32(buf, pos, link_code)
    }

    pub fn link_code(buf: &[u8]) -> i32 {
        bytes::get_i32(buf, wire::HEADER_SIZE)
    }
}

/// Redemption result; a nil device id means the code was unknown or
/// already spent.
pub mod monitor_link_reply {
    use crate::{bytes, wire};
    use uuid::Uuid;

    pub const ID: u16 = 10;
    pub const SIZE: usize = wire::HEADER_SIZE + 16;

    pub fn encode(buf: &mut [u8], device_id: Uuid) -> usize {
        let pos = wire::put_header(buf, SIZE as u16, ID);
        bytes::put_device_id(buf, pos, device_id)
    }

    pub fn device_id(buf: &[u8]) -> Uuid {
        bytes::get_device_id(buf, wire::HEADER_SIZE)
    }
}

/// Monitor subscribes to a device's live stream; answered with a
/// snapshot Tracking message followed by live updates.
pub mod stream_open_request {
    use crate::{bytes, wire};
    use uuid::Uuid;

    pub const ID: u16 = 11;
    pub const SIZE: usize = wire::HEADER_SIZE + 16;

    pub fn encode(buf: &mut [u8], device_id: Uuid) -> usize {
        let pos = wire::put_header(buf, SIZE as u16, ID);
        bytes::put_device_id(buf, pos, device_id)
    }

    pub fn device_id(buf: &[u8]) -> Uuid {
        bytes::get_device_id(buf, wire::HEADER_SIZE)
    }
}
