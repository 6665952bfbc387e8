//! Device registry, message dispatch and the link-code broker.
//!
//! The server-level mutex guards three maps: registered devices, open
//! monitor streams and pending link requests. It is held for lookups and
//! insertions only, never across network or file I/O; per-device work
//! happens under the device's own lock inside
//! [`crate::device::TrackingDevice`].
//!
//! # Storage directory
//!
//! A device id is known exactly when an empty marker file named by its
//! canonical 36-character UUID exists in the storage directory. Files
//! starting with `tracking` are append logs of raw tracker → server
//! frames; at startup they are replayed oldest-modified first through the
//! normal fusion path, so the in-memory state reflects the durable
//! history before the first socket is opened.

use crate::config::ServerConfig;
use crate::device::TrackingDevice;
use crate::error::Result;
use crate::persist::{TrackingLog, TRACKING_FILE_PREFIX};
use crate::session::SessionHandle;
use crate::timer::TimerQueue;
use disha_protocol::text::StringDecoder;
use disha_protocol::{messages, resync, tracking};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

struct LinkRequest {
    link_code: i32,
    device_id: Uuid,
    deadline: Instant,
}

#[derive(Default)]
struct ServerState {
    devices: HashMap<Uuid, Arc<TrackingDevice>>,
    open_streams: HashMap<u64, Arc<TrackingDevice>>,
    link_requests: Vec<LinkRequest>,
}

pub struct Server {
    config: ServerConfig,
    state: Mutex<ServerState>,
    log: TrackingLog,
}

impl Server {
    /// Scan the storage directory, replay persisted tracking updates and
    /// open today's append log.
    pub fn open(config: ServerConfig) -> Result<Arc<Self>> {
        let mut devices: HashMap<Uuid, Arc<TrackingDevice>> = HashMap::new();
        let mut replay_files: Vec<(PathBuf, SystemTime)> = Vec::new();

        for entry in std::fs::read_dir(&config.storage_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("unknown file '{}'", entry.path().display());
                continue;
            };

            if name.len() == 36 {
                if let Ok(device_id) = Uuid::parse_str(name) {
                    devices.insert(device_id, Arc::new(TrackingDevice::new()));
                    continue;
                }
            }
            if name.starts_with(TRACKING_FILE_PREFIX) {
                match entry.metadata().and_then(|m| m.modified()) {
                    Ok(modified) => replay_files.push((entry.path(), modified)),
                    Err(e) => warn!("{}: {}", entry.path().display(), e),
                }
            } else {
                warn!("unknown file '{}'", entry.path().display());
            }
        }
        info!("{} tracking devices", devices.len());

        replay_files.sort_by_key(|(_, modified)| *modified);
        let replayed = replay_tracking_files(&devices, &replay_files);
        if !replay_files.is_empty() {
            let names: Vec<String> = replay_files
                .iter()
                .map(|(path, _)| path.display().to_string())
                .collect();
            info!("{} tracking updates ({})", replayed, names.join(", "));
        }

        let log = TrackingLog::open(&config.storage_dir)?;

        Ok(Arc::new(Self {
            config,
            state: Mutex::new(ServerState {
                devices,
                ..ServerState::default()
            }),
            log,
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn device(&self, device_id: Uuid) -> Option<Arc<TrackingDevice>> {
        self.state.lock().devices.get(&device_id).cloned()
    }

    /// Register a brand-new device: fresh random id, empty marker file,
    /// registry entry, reply. If the marker file cannot be created the
    /// connection is closed without a reply and the client retries.
    pub fn handle_register_request(&self, session: &Arc<SessionHandle>) {
        let device_id = Uuid::new_v4();
        let path = self.config.storage_dir.join(device_id.to_string());
        if let Err(e) = std::fs::File::create(&path) {
            warn!("failed to create file '{}': {}", path.display(), e);
            return;
        }

        self.state
            .lock()
            .devices
            .insert(device_id, Arc::new(TrackingDevice::new()));

        let mut reply = [0u8; messages::register_reply::SIZE];
        messages::register_reply::encode(&mut reply, device_id);
        info!("{}: registered device {}", session.peer(), device_id);
        session.send(&reply);
    }

    /// Issue (or refresh) the link code for a tracker. Returns 0 when
    /// the device is unknown; 0 is never a valid code.
    pub fn issue_link_code(self: &Arc<Self>, device_id: Uuid, timers: &TimerQueue) -> i32 {
        let deadline = Instant::now() + self.config.link_request_timeout;
        let mut link_code = 0i32;
        let mut start_timer = false;
        {
            let mut state = self.state.lock();
            if state.devices.contains_key(&device_id) {
                match state
                    .link_requests
                    .iter()
                    .position(|r| r.device_id == device_id)
                {
                    Some(idx) => {
                        // a retrying tracker keeps seeing the same code
                        let request = &mut state.link_requests[idx];
                        request.deadline = deadline;
                        link_code = request.link_code;
                    }
                    None => {
                        link_code = generate_link_code();
                        start_timer = state.link_requests.is_empty();
                        state.link_requests.push(LinkRequest {
                            link_code,
                            device_id,
                            deadline,
                        });
                    }
                }
            }
        }

        if start_timer {
            let server = Arc::downgrade(self);
            timers.schedule(self.config.link_request_timeout, move || {
                server.upgrade().and_then(|s| s.expire_link_requests())
            });
        }
        link_code
    }

    /// Redeem a link code for its device id, consuming it.
    pub fn redeem_link_code(&self, link_code: i32) -> Option<Uuid> {
        let mut state = self.state.lock();
        let idx = state
            .link_requests
            .iter()
            .position(|r| r.link_code == link_code)?;
        Some(state.link_requests.remove(idx).device_id)
    }

    /// Timer task: drop expired link requests, report the delay until
    /// the next one expires, or `None` when the list emptied.
    fn expire_link_requests(&self) -> Option<Duration> {
        let now = Instant::now();
        let (cancelled, next_deadline) = {
            let mut state = self.state.lock();
            let before = state.link_requests.len();
            state.link_requests.retain(|r| r.deadline > now);
            let next = state.link_requests.iter().map(|r| r.deadline).min();
            (before - state.link_requests.len(), next)
        };

        let delay = next_deadline.map(|d| d.saturating_duration_since(now));
        info!(
            "cancelled {} link requests, next timer in {:?}",
            cancelled, delay
        );
        delay
    }

    pub fn handle_tracker_link_request(
        self: &Arc<Self>,
        session: &Arc<SessionHandle>,
        frame: &[u8],
        timers: &TimerQueue,
    ) {
        let device_id = messages::tracker_link_request::device_id(frame);
        let link_code = self.issue_link_code(device_id, timers);
        if link_code == 0 {
            warn!(
                "{}: invalid tracking device identifier {}",
                session.peer(),
                device_id
            );
            return;
        }

        let mut reply = [0u8; messages::tracker_link_reply::SIZE];
        messages::tracker_link_reply::encode(&mut reply, link_code);
        info!(
            "{}: send link code {} for device {}",
            session.peer(),
            link_code,
            device_id
        );
        session.send(&reply);
    }

    pub fn handle_monitor_link_request(&self, session: &Arc<SessionHandle>, frame: &[u8]) {
        let link_code = messages::monitor_link_request::link_code(frame);
        let device_id = self.redeem_link_code(link_code);

        let reply_id = match device_id {
            Some(id) => id,
            None => {
                warn!(
                    "{}: received invalid link request code {}",
                    session.peer(),
                    link_code
                );
                Uuid::nil()
            }
        };

        let mut reply = [0u8; messages::monitor_link_reply::SIZE];
        messages::monitor_link_reply::encode(&mut reply, reply_id);
        info!("{}: send link reply, device {}", session.peer(), reply_id);
        session.send(&reply);
    }

    pub fn handle_stream_open_request(
        &self,
        session: &Arc<SessionHandle>,
        frame: &[u8],
        decoder: &mut StringDecoder,
    ) {
        let device_id = messages::stream_open_request::device_id(frame);
        let (device, previous) = {
            let mut state = self.state.lock();
            let device = state.devices.get(&device_id).cloned();
            let previous = match &device {
                Some(device) => state.open_streams.insert(session.id(), Arc::clone(device)),
                None => None,
            };
            (device, previous)
        };

        match device {
            Some(device) => {
                // a session subscribes to at most one device at a time
                if let Some(previous) = previous {
                    if !Arc::ptr_eq(&previous, &device) {
                        previous.remove_subscriber(session.id());
                    }
                }
                device.handle_stream_open(session, decoder);
            }
            None => warn!("{}: unexpected device id {}", session.peer(), device_id),
        }
    }

    pub fn handle_resync_request(&self, session: &Arc<SessionHandle>, frame: &[u8]) {
        let device_id = resync::resync_request::device_id(frame);
        match self.device(device_id) {
            Some(device) => device.handle_resync_request(session, frame),
            None => warn!("{}: unexpected device id {}", session.peer(), device_id),
        }
    }

    /// Common tracking path for TCP, UDP and startup replay. `source` is
    /// set on the UDP path only. Accepted frames are queued for
    /// persistence; frames for unknown devices are dropped.
    pub fn handle_tracking(
        &self,
        frame: &[u8],
        source: Option<SocketAddr>,
        decoder: &mut StringDecoder,
    ) {
        let device_id = tracking::device_id(frame);
        match self.device(device_id) {
            None => warn!("invalid device id {}", device_id),
            Some(device) => {
                device.handle_tracking(frame, source, decoder);
                self.log.append(frame.to_vec());
            }
        }
    }

    /// Drain and close the persistence pipeline. Called by the runtime
    /// as the last shutdown step, after the front ends have stopped.
    pub fn shutdown_persistence(&self) {
        self.log.shutdown();
    }

    /// Session teardown: drop the monitor subscription, if any (a
    /// session subscribes to at most one device).
    pub fn on_connection_closed(&self, session: &Arc<SessionHandle>) {
        let device = self.state.lock().open_streams.remove(&session.id());
        if let Some(device) = device {
            if !device.remove_subscriber(session.id()) {
                warn!("internal error: no open stream for {}", session.peer());
            }
        }
    }
}

/// Five decimal digits, never zero.
fn generate_link_code() -> i32 {
    let mut rng = rand::thread_rng();
    loop {
        let code = (rng.gen::<i32>().unsigned_abs() % 100_000) as i32;
        if code != 0 {
            return code;
        }
    }
}

/// Feed persisted tracking files back through the fusion path, oldest
/// first. Unreadable files and truncated tails are logged and skipped.
fn replay_tracking_files(
    devices: &HashMap<Uuid, Arc<TrackingDevice>>,
    files: &[(PathBuf, SystemTime)],
) -> usize {
    let mut decoder = StringDecoder::new();
    let mut replayed = 0usize;

    for (path, _) in files {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                info!("{}: {}", path.display(), e);
                continue;
            }
        };

        let mut pos = 0usize;
        while data.len() - pos >= disha_protocol::wire::SIZE_FIELD_SIZE {
            let size = disha_protocol::wire::size(&data[pos..]) as usize;
            if size < tracking::TS_PREFIX_SIZE || pos + size > data.len() {
                warn!(
                    "{}: truncated or foreign record at offset {}, rest skipped",
                    path.display(),
                    pos
                );
                break;
            }

            let frame = &data[pos..pos + size];
            if disha_protocol::wire::id(frame) == tracking::ID {
                let device_id = tracking::device_id(frame);
                if let Some(device) = devices.get(&device_id) {
                    device.handle_tracking(frame, None, &mut decoder);
                    replayed += 1;
                } else {
                    debug!("{}: update for unknown device {}", path.display(), device_id);
                }
            }
            pos += size;
        }
    }
    replayed
}

impl Drop for Server {
    fn drop(&mut self) {
        info!("server closed ({} devices)", self.device_count());
    }
}
