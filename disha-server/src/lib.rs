//! Disha relay server - location telemetry fan-out daemon.
//!
//! Trackers push telemetry (GPS fixes, battery, network name, stop
//! events) over TCP and UDP; monitors subscribe over TCP and receive a
//! snapshot plus live updates. A short-code link ceremony pairs a monitor
//! to a tracker without ever showing the monitor the tracker's device id
//! before redemption.
//!
//! The daemon is plain threads end to end: an acceptor, one reader
//! thread per connection, a UDP loop, one timer-queue thread and one
//! persistence writer. See the module docs for the locking rules; the
//! short version is that no lock is ever held across a socket write.

pub mod config;
pub mod device;
pub mod error;
pub mod persist;
pub mod rate_limit;
pub mod runtime;
pub mod server;
pub mod session;
pub mod timer;
pub(crate) mod udp;
