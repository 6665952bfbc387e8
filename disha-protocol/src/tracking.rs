//! Tracking message (id 16) and its TLV field codec.
//!
//! Two variants share the id:
//!
//! - **tracker → server**: `[header] [device id] [u64 sequence] [TLV*]`.
//!   Carries the source device and a per-device sequence number so the
//!   server can acknowledge UDP deliveries later.
//! - **server → monitor**: `[header] [TLV*]`. The receiver knows the
//!   device from the stream it opened, so neither id nor sequence travel.
//!
//! Each TLV field starts with a one-byte total length (header included)
//! and a one-byte field id:
//!
//! ```text
//! [u8 len] [u8 id] [body...]
//! ```
//!
//! | Id | Field            | Body                               | Len |
//! |----|------------------|------------------------------------|-----|
//! | 0  | BatteryLevel     | i64 time, i16 percent              | 12  |
//! | 1  | NetworkName      | i64 time, raw bytes                | 10+ |
//! | 2  | Location         | i64 time, f64 lat, f64 lon, f64 alt| 34  |
//! | 3  | TrackingStopped  | i64 time                           | 10  |
//!
//! A length byte of zero, one, or one overrunning the message is
//! malformed and aborts parsing of the rest of that message; fields
//! decoded before the malformed one stand. Unknown field ids are skipped
//! by their declared length.

use crate::{bytes, wire};
use thiserror::Error;
use uuid::Uuid;

pub const ID: u16 = 16;

/// tracker → server prefix: header + device id + sequence number.
pub const TS_PREFIX_SIZE: usize = wire::HEADER_SIZE + 16 + 8;

/// Length byte + field id byte.
pub const FIELD_HEADER_SIZE: usize = 2;

pub const FIELD_BATTERY_LEVEL: u8 = 0;
pub const FIELD_NETWORK_NAME: u8 = 1;
pub const FIELD_LOCATION: u8 = 2;
pub const FIELD_TRACKING_STOPPED: u8 = 3;

pub const BATTERY_LEVEL_SIZE: usize = FIELD_HEADER_SIZE + 8 + 2;
pub const NETWORK_NAME_HEADER_SIZE: usize = FIELD_HEADER_SIZE + 8;
pub const LOCATION_SIZE: usize = FIELD_HEADER_SIZE + 8 + 8 * 3;
pub const TRACKING_STOPPED_SIZE: usize = FIELD_HEADER_SIZE + 8;

/// Size of a network-name field carrying `name_len` raw bytes.
pub fn network_name_size(name_len: usize) -> usize {
    NETWORK_NAME_HEADER_SIZE + name_len
}

// ============================================================================
// Message builders
// ============================================================================

/// Write the tracker → server prefix. `size` is the final message size,
/// which the caller computes up front from the fields it will append.
pub fn encode_ts(buf: &mut [u8], size: u16, device_id: Uuid, sequence: u64) -> usize {
    let pos = wire::put_header(buf, size, ID);
    let pos = bytes::put_device_id(buf, pos, device_id);
    bytes::put_u64(buf, pos, sequence)
}

/// Write the server → monitor prefix (bare header).
pub fn encode_sm(buf: &mut [u8], size: u16) -> usize {
    wire::put_header(buf, size, ID)
}

pub fn device_id(buf: &[u8]) -> Uuid {
    bytes::get_device_id(buf, wire::HEADER_SIZE)
}

pub fn sequence_number(buf: &[u8]) -> u64 {
    bytes::get_u64(buf, wire::HEADER_SIZE + 16)
}

// ============================================================================
// Field builders - append one TLV at `pos`, return the new offset
// ============================================================================

pub fn add_battery_level(buf: &mut [u8], pos: usize, time: i64, level: i16) -> usize {
    let pos = bytes::put_u8(buf, pos, BATTERY_LEVEL_SIZE as u8);
    let pos = bytes::put_u8(buf, pos, FIELD_BATTERY_LEVEL);
    let pos = bytes::put_i64(buf, pos, time);
    bytes::put_i16(buf, pos, level)
}

pub fn add_network_name(buf: &mut [u8], pos: usize, time: i64, name: &[u8]) -> usize {
    let field_size = network_name_size(name.len());
    debug_assert!(field_size <= u8::MAX as usize);
    let pos = bytes::put_u8(buf, pos, field_size as u8);
    let pos = bytes::put_u8(buf, pos, FIELD_NETWORK_NAME);
    let pos = bytes::put_i64(buf, pos, time);
    buf[pos..pos + name.len()].copy_from_slice(name);
    pos + name.len()
}

pub fn add_location(
    buf: &mut [u8],
    pos: usize,
    time: i64,
    latitude: f64,
    longitude: f64,
    altitude: f64,
) -> usize {
    let pos = bytes::put_u8(buf, pos, LOCATION_SIZE as u8);
    let pos = bytes::put_u8(buf, pos, FIELD_LOCATION);
    let pos = bytes::put_i64(buf, pos, time);
    let pos = bytes::put_f64(buf, pos, latitude);
    let pos = bytes::put_f64(buf, pos, longitude);
    bytes::put_f64(buf, pos, altitude)
}

pub fn add_tracking_stopped(buf: &mut [u8], pos: usize, time: i64) -> usize {
    let pos = bytes::put_u8(buf, pos, TRACKING_STOPPED_SIZE as u8);
    let pos = bytes::put_u8(buf, pos, FIELD_TRACKING_STOPPED);
    bytes::put_i64(buf, pos, time)
}

// ============================================================================
// Field iteration
// ============================================================================

/// One decoded TLV field. Network names stay raw bytes; decoding to text
/// is a logging concern (see [`crate::text`]).
#[derive(Debug, PartialEq)]
pub enum Field<'a> {
    BatteryLevel {
        time: i64,
        level: i16,
    },
    NetworkName {
        time: i64,
        name: &'a [u8],
    },
    Location {
        time: i64,
        latitude: f64,
        longitude: f64,
        altitude: f64,
    },
    TrackingStopped {
        time: i64,
    },
    /// Skipped by declared length; kept visible so callers can log it.
    Unknown {
        id: u8,
        size: u8,
    },
}

/// Malformed TLV. Terminates iteration; earlier fields stand.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("field at offset {offset} has invalid length {size}")]
    BadLength { offset: usize, size: u8 },

    #[error("field {id} at offset {offset} is shorter than its minimum ({size} bytes)")]
    ShortField { id: u8, offset: usize, size: u8 },
}

/// Iterator over the TLV fields of a Tracking message.
///
/// Yields `Err` at most once, as the final item, when a malformed field
/// terminates parsing.
pub struct FieldIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

/// Fields of a tracker → server message.
pub fn fields_ts(buf: &[u8]) -> FieldIter<'_> {
    FieldIter {
        buf,
        pos: TS_PREFIX_SIZE,
        failed: false,
    }
}

/// Fields of a server → monitor message.
pub fn fields_sm(buf: &[u8]) -> FieldIter<'_> {
    FieldIter {
        buf,
        pos: wire::HEADER_SIZE,
        failed: false,
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = Result<Field<'a>, FieldError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }

        let offset = self.pos;
        let remaining = self.buf.len() - offset;
        let size = self.buf[offset] as usize;
        if size < FIELD_HEADER_SIZE || size > remaining {
            self.failed = true;
            return Some(Err(FieldError::BadLength {
                offset,
                size: size as u8,
            }));
        }

        let id = self.buf[offset + 1];
        let min = match id {
            FIELD_BATTERY_LEVEL => BATTERY_LEVEL_SIZE,
            FIELD_NETWORK_NAME => NETWORK_NAME_HEADER_SIZE,
            FIELD_LOCATION => LOCATION_SIZE,
            FIELD_TRACKING_STOPPED => TRACKING_STOPPED_SIZE,
            _ => {
                self.pos += size;
                return Some(Ok(Field::Unknown {
                    id,
                    size: size as u8,
                }));
            }
        };
        if size < min {
            self.failed = true;
            return Some(Err(FieldError::ShortField {
                id,
                offset,
                size: size as u8,
            }));
        }

        let body = offset + FIELD_HEADER_SIZE;
        let time = bytes::get_i64(self.buf, body);
        let field = match id {
            FIELD_BATTERY_LEVEL => Field::BatteryLevel {
                time,
                level: bytes::get_i16(self.buf, body + 8),
            },
            FIELD_NETWORK_NAME => Field::NetworkName {
                time,
                name: &self.buf[body + 8..offset + size],
            },
            FIELD_LOCATION => Field::Location {
                time,
                latitude: bytes::get_f64(self.buf, body + 8),
                longitude: bytes::get_f64(self.buf, body + 16),
                altitude: bytes::get_f64(self.buf, body + 24),
            },
            _ => Field::TrackingStopped { time },
        };
        self.pos += size;
        Some(Ok(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_frame(fields: impl Fn(&mut [u8], usize) -> usize, body_size: usize) -> Vec<u8> {
        let size = TS_PREFIX_SIZE + body_size;
        let mut buf = vec![0u8; size];
        let pos = encode_ts(&mut buf, size as u16, Uuid::from_u64_pair(1, 2), 42);
        let end = fields(&mut buf, pos);
        assert_eq!(end, size);
        buf
    }

    #[test]
    fn test_ts_prefix_round_trip() {
        let buf = ts_frame(|_, p| p, 0);
        assert_eq!(wire::size(&buf) as usize, TS_PREFIX_SIZE);
        assert_eq!(wire::id(&buf), ID);
        assert_eq!(device_id(&buf), Uuid::from_u64_pair(1, 2));
        assert_eq!(sequence_number(&buf), 42);
        assert_eq!(fields_ts(&buf).count(), 0);
    }

    #[test]
    fn test_all_field_kinds_round_trip() {
        let body = BATTERY_LEVEL_SIZE
            + network_name_size(4)
            + LOCATION_SIZE
            + TRACKING_STOPPED_SIZE;
        let buf = ts_frame(
            |buf, pos| {
                let pos = add_battery_level(buf, pos, 1_000, 80);
                let pos = add_network_name(buf, pos, 2_000, b"home");
                let pos = add_location(buf, pos, 3_000, 48.85, 2.29, 35.0);
                add_tracking_stopped(buf, pos, 4_000)
            },
            body,
        );

        let fields: Vec<_> = fields_ts(&buf).map(Result::unwrap).collect();
        assert_eq!(
            fields,
            vec![
                Field::BatteryLevel {
                    time: 1_000,
                    level: 80
                },
                Field::NetworkName {
                    time: 2_000,
                    name: b"home"
                },
                Field::Location {
                    time: 3_000,
                    latitude: 48.85,
                    longitude: 2.29,
                    altitude: 35.0
                },
                Field::TrackingStopped { time: 4_000 },
            ]
        );
    }

    #[test]
    fn test_sm_variant_has_bare_header() {
        let size = wire::HEADER_SIZE + TRACKING_STOPPED_SIZE;
        let mut buf = vec![0u8; size];
        let pos = encode_sm(&mut buf, size as u16);
        add_tracking_stopped(&mut buf, pos, 9_000);

        let fields: Vec<_> = fields_sm(&buf).map(Result::unwrap).collect();
        assert_eq!(fields, vec![Field::TrackingStopped { time: 9_000 }]);
    }

    #[test]
    fn test_zero_length_field_aborts() {
        let buf = ts_frame(|_, p| p + 4, 4); // four zero bytes
        let items: Vec<_> = fields_ts(&buf).collect();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0],
            Err(FieldError::BadLength {
                offset: TS_PREFIX_SIZE,
                size: 0
            })
        );
    }

    #[test]
    fn test_overrunning_field_aborts_but_keeps_prefix() {
        let body = BATTERY_LEVEL_SIZE + 2;
        let buf = ts_frame(
            |buf, pos| {
                let pos = add_battery_level(buf, pos, 1_000, 50);
                // declared length far beyond the message end
                buf[pos] = 200;
                buf[pos + 1] = FIELD_LOCATION;
                pos + 2
            },
            body,
        );

        let mut it = fields_ts(&buf);
        assert_eq!(
            it.next(),
            Some(Ok(Field::BatteryLevel {
                time: 1_000,
                level: 50
            }))
        );
        assert!(matches!(it.next(), Some(Err(FieldError::BadLength { .. }))));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn test_undersized_known_field_aborts() {
        // a location field squeezed into 10 bytes
        let body = 10;
        let buf = ts_frame(
            |buf, pos| {
                buf[pos] = 10;
                buf[pos + 1] = FIELD_LOCATION;
                pos + 10
            },
            body,
        );

        let items: Vec<_> = fields_ts(&buf).collect();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0],
            Err(FieldError::ShortField {
                id: FIELD_LOCATION,
                offset: TS_PREFIX_SIZE,
                size: 10
            })
        );
    }

    #[test]
    fn test_unknown_field_is_skipped() {
        let body = 5 + TRACKING_STOPPED_SIZE;
        let buf = ts_frame(
            |buf, pos| {
                buf[pos] = 5;
                buf[pos + 1] = 200; // unknown id
                add_tracking_stopped(buf, pos + 5, 7_000)
            },
            body,
        );

        let fields: Vec<_> = fields_ts(&buf).map(Result::unwrap).collect();
        assert_eq!(
            fields,
            vec![
                Field::Unknown { id: 200, size: 5 },
                Field::TrackingStopped { time: 7_000 },
            ]
        );
    }
}
