//! Wire protocol for the Disha location-tracking relay.
//!
//! Trackers push telemetry to the relay over TCP and UDP, monitors
//! subscribe to a tracker's stream over TCP. Both directions use the same
//! framed binary format:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬──────────────────────────┐
//! │ Size (2 bytes)   │ Id (2 bytes)     │ Body (variable)          │
//! │ Big-endian u16   │ Big-endian u16   │ Message-specific layout  │
//! └──────────────────┴──────────────────┴──────────────────────────┘
//! ```
//!
//! - **Size**: total message length in bytes, header included, max 32767
//! - **Byte order**: network byte order (big-endian) throughout
//! - **Tracking fields**: tiny TLV records, see [`tracking`]
//!
//! The codec is stateless and position-addressed: builders write into a
//! caller-owned buffer and return the new write offset, accessors read at
//! documented offsets without touching the buffer. The only stateful piece
//! is the reusable UTF-8 decoder in [`text`].

pub(crate) mod bytes;
pub mod display;
pub mod hexdump;
pub mod messages;
pub mod resync;
pub mod text;
pub mod tracking;
pub mod wire;

/// Default relay port (TCP and UDP).
pub const DEFAULT_PORT: u16 = 80;

/// Read-idle timeout enforced by the server, seconds.
pub const SOCKET_TIMEOUT_SECS: u64 = 15;

/// Interval at which clients are expected to ping long-lived
/// connections, seconds. Must stay well below [`SOCKET_TIMEOUT_SECS`].
pub const SOCKET_PING_INTERVAL_SECS: u64 = 5;
