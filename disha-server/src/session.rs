//! Per-connection session: stream defragmentation, validation, dispatch.
//!
//! Each accepted TCP connection gets its own thread running
//! [`Session::run`]. The read loop defragments the byte stream into
//! whole frames, validates each frame against the fixed layout for its
//! message id and hands it to the matching [`crate::server::Server`]
//! handler. Scratch state that is not thread-safe by design (the UTF-8
//! decoder used for log rendering) lives in the session, one instance per
//! connection, never shared.
//!
//! Dispatch table:
//!
//! | Id | Message            | Rate limited | After handling    |
//! |----|--------------------|--------------|-------------------|
//! | 1  | Ping               | no           | keep open         |
//! | 5  | RegisterRequest    | yes          | close             |
//! | 7  | TrackerLinkRequest | yes          | close             |
//! | 9  | MonitorLinkRequest | yes (11 next)| keep open         |
//! | 11 | StreamOpenRequest  | yes          | keep open         |
//! | 12 | ResyncRequest      | no           | keep open         |
//! | 16 | Tracking           | no           | keep open         |
//!
//! Anything else is logged with a hex dump and closes the connection.

use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::server::Server;
use crate::timer::TimerQueue;
use disha_protocol::display::{self, TrackingVariant};
use disha_protocol::text::StringDecoder;
use disha_protocol::{hexdump, messages, resync, tracking, wire};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to one connection: everything another thread needs to
/// send data to it or shut it down. Devices keep these in their
/// subscriber lists and compare them by `id`.
pub struct SessionHandle {
    id: u64,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    bytes_received: AtomicU64,
}

impl SessionHandle {
    pub fn new(stream: &TcpStream, peer: SocketAddr) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: Mutex::new(stream.try_clone()?),
            bytes_received: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Raw bytes read from this connection so far; sampled by the idle
    /// timer.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn add_bytes(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Write one frame. A failed write shuts the connection down; the
    /// session's read loop notices and cleans up.
    pub fn send(&self, frame: &[u8]) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(frame) {
            debug!("{}: send failed: {}", self.peer, e);
            let _ = writer.shutdown(Shutdown::Both);
        }
    }

    /// Shut both directions down; used by the idle timer and on shutdown.
    pub fn close(&self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

/// Buffers stream fragments and hands out whole frames.
///
/// Only the two-byte size prefix is inspected here; everything else is
/// the dispatcher's problem. A declared size below the header size or
/// above the protocol maximum poisons the stream and kills the
/// connection, there is no way to resynchronize after that.
pub(crate) struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(512),
        }
    }

    pub(crate) fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete frame out of the buffer, if one is there.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < wire::SIZE_FIELD_SIZE {
            return Ok(None);
        }
        let size = wire::size(&self.buf) as usize;
        if size < wire::HEADER_SIZE || size > wire::MAX_MESSAGE_SIZE {
            return Err(Error::InvalidFrame(format!("declared size {}", size)));
        }
        if self.buf.len() < size {
            return Ok(None);
        }
        Ok(Some(self.buf.drain(..size).collect()))
    }
}

/// One connection's read side. Owns the per-session scratch state.
pub struct Session {
    handle: Arc<SessionHandle>,
    server: Arc<Server>,
    limiter: Arc<RateLimiter>,
    timers: Arc<TimerQueue>,
    reader: FrameReader,
    decoder: StringDecoder,
}

impl Session {
    pub fn new(
        handle: Arc<SessionHandle>,
        server: Arc<Server>,
        limiter: Arc<RateLimiter>,
        timers: Arc<TimerQueue>,
    ) -> Self {
        Self {
            handle,
            server,
            limiter,
            timers,
            reader: FrameReader::new(),
            decoder: StringDecoder::new(),
        }
    }

    /// Read loop; runs until the peer disconnects, a framing error kills
    /// the connection, or the daemon shuts down.
    pub fn run(mut self, mut stream: TcpStream, shutdown: Arc<AtomicBool>) {
        // short read timeout so the shutdown flag gets checked
        if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(500))) {
            warn!("{}: failed to set read timeout: {}", self.handle.peer(), e);
        }

        let mut chunk = [0u8; 2048];
        while !shutdown.load(Ordering::Relaxed) {
            match self.drain_frames() {
                Ok(true) => {}
                Ok(false) => break,
                Err(Error::InvalidFrame(reason)) => {
                    warn!(
                        "{}: invalid message received ({}), close connection",
                        self.handle.peer(),
                        reason
                    );
                    break;
                }
                Err(e) => {
                    warn!("{}: {}", self.handle.peer(), e);
                    break;
                }
            }

            match stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("{}: end of stream", self.handle.peer());
                    break;
                }
                Ok(n) => {
                    self.handle.add_bytes(n as u64);
                    self.reader.push_bytes(&chunk[..n]);
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::UnexpectedEof
                        || e.kind() == std::io::ErrorKind::ConnectionReset => {
                    debug!("{}: disconnected", self.handle.peer());
                    break;
                }
                Err(e) => {
                    debug!("{}: read error: {}", self.handle.peer(), e);
                    break;
                }
            }
        }

        self.handle.close();
        info!("{}: connection closed", self.handle.peer());
        self.server.on_connection_closed(&self.handle);
    }

    /// Dispatch every buffered frame. `Ok(false)` asks the caller to
    /// close the connection.
    fn drain_frames(&mut self) -> Result<bool> {
        while let Some(frame) = self.reader.next_frame()? {
            if !self.on_message(&frame) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_rate(&self, message_id: u16, follow_up: u16) -> bool {
        self.limiter.check(
            &self.timers,
            self.handle.peer().ip(),
            message_id,
            follow_up,
        )
    }

    fn reject_frame(&self, frame: &[u8], what: &str) -> bool {
        warn!(
            "{}: invalid <{}> received, close connection\n{}",
            self.handle.peer(),
            what,
            hexdump::hex_dump(frame, 4)
        );
        false
    }

    fn on_message(&mut self, frame: &[u8]) -> bool {
        match wire::id(frame) {
            messages::ping::ID => true,

            messages::register_request::ID => {
                debug!("{}: received {}", self.handle.peer(), display::describe(frame));
                if self.check_rate(messages::register_request::ID, 0) {
                    self.server.handle_register_request(&self.handle);
                }
                // trackers do not hold the connection open for requests
                false
            }

            messages::tracker_link_request::ID => {
                debug!("{}: received {}", self.handle.peer(), display::describe(frame));
                // the limiter consumes the slot first so malformed frames
                // cannot probe at an unlimited rate
                if self.check_rate(messages::tracker_link_request::ID, 0) {
                    if frame.len() != messages::tracker_link_request::SIZE {
                        return self.reject_frame(frame, "TrackerLinkRequest");
                    }
                    self.server
                        .handle_tracker_link_request(&self.handle, frame, &self.timers);
                }
                false
            }

            messages::monitor_link_request::ID => {
                debug!("{}: received {}", self.handle.peer(), display::describe(frame));
                if self.check_rate(
                    messages::monitor_link_request::ID,
                    messages::stream_open_request::ID,
                ) {
                    if frame.len() != messages::monitor_link_request::SIZE {
                        return self.reject_frame(frame, "MonitorLinkRequest");
                    }
                    self.server.handle_monitor_link_request(&self.handle, frame);
                }
                true
            }

            messages::stream_open_request::ID => {
                debug!("{}: received {}", self.handle.peer(), display::describe(frame));
                if self.check_rate(messages::stream_open_request::ID, 0) {
                    if frame.len() != messages::stream_open_request::SIZE {
                        return self.reject_frame(frame, "StreamOpenRequest");
                    }
                    self.server
                        .handle_stream_open_request(&self.handle, frame, &mut self.decoder);
                }
                true
            }

            resync::resync_request::ID => {
                if frame.len() < resync::resync_request::MIN_SIZE {
                    return self.reject_frame(frame, "ResyncRequest");
                }
                let count = resync::resync_request::count(frame);
                if frame.len() != resync::resync_request::size(count) {
                    return self.reject_frame(frame, "ResyncRequest");
                }
                debug!("{}: received {}", self.handle.peer(), display::describe(frame));
                self.server.handle_resync_request(&self.handle, frame);
                true
            }

            tracking::ID => {
                if frame.len() < tracking::TS_PREFIX_SIZE {
                    return self.reject_frame(frame, "Tracking");
                }
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "{}: received {}",
                        self.handle.peer(),
                        display::describe_tracking(
                            frame,
                            TrackingVariant::TrackerToServer,
                            &mut self.decoder
                        )
                    );
                }
                self.server
                    .handle_tracking(frame, None, &mut self.decoder);
                true
            }

            other => {
                warn!(
                    "{}: unexpected message {} received, close connection\n{}",
                    self.handle.peer(),
                    other,
                    hexdump::hex_dump(frame, 5)
                );
                false
            }
        }
    }
}

/// Register the read-idle watchdog for a session: every tick it samples
/// the byte counter and closes the connection if nothing arrived since
/// the previous tick. The task retires itself once the handle is gone.
pub fn arm_idle_timer(timers: &TimerQueue, handle: &Arc<SessionHandle>, idle_timeout: Duration) {
    let watched = Arc::downgrade(handle);
    let mut last_seen = 0u64;
    timers.schedule(idle_timeout, move || {
        let handle = watched.upgrade()?;
        let received = handle.bytes_received();
        if received == last_seen {
            info!("{}: connection timeout, close connection", handle.peer());
            handle.close();
            return None;
        }
        last_seen = received;
        Some(idle_timeout)
    });
}

/// Spawn the detached reader thread for one accepted connection.
pub fn spawn(
    stream: TcpStream,
    peer: SocketAddr,
    server: Arc<Server>,
    limiter: Arc<RateLimiter>,
    timers: Arc<TimerQueue>,
    idle_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let handle = match SessionHandle::new(&stream, peer) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("{}: failed to set up session: {}", peer, e);
            return;
        }
    };

    info!(
        "{}: connection accepted (timeout={:?})",
        peer, idle_timeout
    );
    arm_idle_timer(&timers, &handle, idle_timeout);

    let session = Session::new(Arc::clone(&handle), server, limiter, Arc::clone(&timers));
    let spawned = thread::Builder::new()
        .name(format!("session-{}", handle.id()))
        .spawn(move || session.run(stream, shutdown));
    if let Err(e) = spawned {
        warn!("{}: failed to spawn session thread: {}", peer, e);
        handle.close();
    }
}
