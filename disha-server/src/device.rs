//! Per-device tracking state and the telemetry fusion rules.
//!
//! One `TrackingDevice` exists per registered device id, created at
//! registration or at startup from its marker file, and never destroyed
//! while the process runs. All of its fields sit behind a single mutex;
//! handlers mutate state and build outgoing frames under the lock, then
//! release it before any socket write.
//!
//! # Fusion
//!
//! Telemetry can arrive twice (UDP now, TCP resync later) and out of
//! order, so every field carries the client's timestamp and the stored
//! value only moves forward:
//!
//! - battery level and network name apply iff their time is strictly
//!   newer than the stored one
//! - locations insert into a time-ordered map; equal keys overwrite,
//!   which makes replays idempotent
//! - tracking-stopped applies only when strictly newer than every other
//!   stored time, and any later activity clears it again
//!
//! The end state is invariant under reordering across delivery paths,
//! which is what makes the UDP path acceptable at all.
//!
//! A malformed TLV aborts parsing of the rest of its message; fields that
//! were decoded before it remain applied. Timestamps come from the client
//! and are trusted for ordering only.

use crate::session::SessionHandle;
use disha_protocol::display::{self, TrackingVariant};
use disha_protocol::text::StringDecoder;
use disha_protocol::tracking::{self, Field};
use disha_protocol::{resync, wire};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

#[derive(Default)]
struct DeviceState {
    subscribers: Vec<Arc<SessionHandle>>,
    received_messages: BTreeSet<u64>,
    last_source_addr: Option<SocketAddr>,

    battery_level_time: i64,
    battery_level: i16,

    network_name_time: i64,
    network_name: Vec<u8>,

    locations: BTreeMap<i64, LocationFix>,

    tracking_stopped_time: i64,
}

impl DeviceState {
    /// Activity at `time` cancels an older tracking-stopped mark.
    fn clear_stopped_before(&mut self, time: i64) {
        if self.tracking_stopped_time != 0 && self.tracking_stopped_time < time {
            self.tracking_stopped_time = 0;
        }
    }

    fn last_location_time(&self) -> Option<i64> {
        self.locations.keys().next_back().copied()
    }

    /// Snapshot for a freshly subscribed monitor: every set field once,
    /// plus at most the most recent location.
    fn snapshot_frame(&self) -> Vec<u8> {
        let mut size = wire::HEADER_SIZE;
        if self.battery_level_time != 0 {
            size += tracking::BATTERY_LEVEL_SIZE;
        }
        if self.network_name_time != 0 {
            size += tracking::network_name_size(self.network_name.len());
        }
        if !self.locations.is_empty() {
            size += tracking::LOCATION_SIZE;
        }
        if self.tracking_stopped_time != 0 {
            size += tracking::TRACKING_STOPPED_SIZE;
        }

        let mut frame = vec![0u8; size];
        let mut pos = tracking::encode_sm(&mut frame, size as u16);
        if self.battery_level_time != 0 {
            pos = tracking::add_battery_level(
                &mut frame,
                pos,
                self.battery_level_time,
                self.battery_level,
            );
        }
        if self.network_name_time != 0 {
            pos = tracking::add_network_name(
                &mut frame,
                pos,
                self.network_name_time,
                &self.network_name,
            );
        }
        if let Some((&time, fix)) = self.locations.iter().next_back() {
            pos = tracking::add_location(
                &mut frame,
                pos,
                time,
                fix.latitude,
                fix.longitude,
                fix.altitude,
            );
        }
        if self.tracking_stopped_time != 0 {
            pos = tracking::add_tracking_stopped(&mut frame, pos, self.tracking_stopped_time);
        }
        debug_assert_eq!(pos, size);
        frame
    }

    /// Live update for subscribers: only the values the current message
    /// actually applied.
    fn update_frame(
        &self,
        battery: bool,
        network: bool,
        stopped: bool,
        new_locations: &[i64],
    ) -> Vec<u8> {
        let mut size = wire::HEADER_SIZE;
        if battery {
            size += tracking::BATTERY_LEVEL_SIZE;
        }
        if network {
            size += tracking::network_name_size(self.network_name.len());
        }
        size += tracking::LOCATION_SIZE * new_locations.len();
        if stopped {
            size += tracking::TRACKING_STOPPED_SIZE;
        }

        let mut frame = vec![0u8; size];
        let mut pos = tracking::encode_sm(&mut frame, size as u16);
        if battery {
            pos = tracking::add_battery_level(
                &mut frame,
                pos,
                self.battery_level_time,
                self.battery_level,
            );
        }
        if network {
            pos = tracking::add_network_name(
                &mut frame,
                pos,
                self.network_name_time,
                &self.network_name,
            );
        }
        for &time in new_locations {
            if let Some(fix) = self.locations.get(&time) {
                pos = tracking::add_location(
                    &mut frame,
                    pos,
                    time,
                    fix.latitude,
                    fix.longitude,
                    fix.altitude,
                );
            }
        }
        if stopped {
            pos = tracking::add_tracking_stopped(&mut frame, pos, self.tracking_stopped_time);
        }
        debug_assert_eq!(pos, size);
        frame
    }
}

pub struct TrackingDevice {
    state: Mutex<DeviceState>,
}

impl TrackingDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Subscribe a monitor session and send it the current snapshot.
    /// Subscribing twice from the same session is a no-op.
    pub fn handle_stream_open(&self, session: &Arc<SessionHandle>, decoder: &mut StringDecoder) {
        let frame = {
            let mut state = self.state.lock();
            if state.subscribers.iter().any(|s| s.id() == session.id()) {
                return;
            }
            state.subscribers.push(Arc::clone(session));
            state.snapshot_frame()
        };

        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "{}: send {}",
                session.peer(),
                display::describe_tracking(&frame, TrackingVariant::ServerToMonitor, decoder)
            );
        }
        session.send(&frame);
    }

    /// Fuse one tracker → server Tracking message and fan the applied
    /// values out to subscribers.
    ///
    /// The sequence number is recorded before any field is touched so a
    /// resync request racing in right behind the message already sees it
    /// acknowledged.
    pub fn handle_tracking(
        &self,
        frame: &[u8],
        source: Option<SocketAddr>,
        decoder: &mut StringDecoder,
    ) {
        let sequence = tracking::sequence_number(frame);
        let mut broken_fields = 0u32;
        let mut fanout: Option<(Vec<u8>, Vec<Arc<SessionHandle>>)> = None;

        {
            let mut state = self.state.lock();
            if let Some(addr) = source {
                state.last_source_addr = Some(addr);
            }
            state.received_messages.insert(sequence);

            let mut battery_updated = false;
            let mut network_updated = false;
            let mut stopped_updated = false;
            let mut new_locations: Vec<i64> = Vec::new();

            for item in tracking::fields_ts(frame) {
                match item {
                    Ok(Field::BatteryLevel { time, level }) => {
                        // resync can re-deliver old messages, only the
                        // newest value may stick
                        if time > state.battery_level_time {
                            state.battery_level_time = time;
                            state.battery_level = level;
                            battery_updated = true;
                            state.clear_stopped_before(time);
                        }
                    }
                    Ok(Field::NetworkName { time, name }) => {
                        if time > state.network_name_time {
                            state.network_name_time = time;
                            state.network_name.clear();
                            state.network_name.extend_from_slice(name);
                            network_updated = true;
                            state.clear_stopped_before(time);
                        }
                    }
                    Ok(Field::Location {
                        time,
                        latitude,
                        longitude,
                        altitude,
                    }) => {
                        let fix = LocationFix {
                            latitude,
                            longitude,
                            altitude,
                        };
                        if state.locations.insert(time, fix).is_none() {
                            new_locations.push(time);
                        }
                        state.clear_stopped_before(time);
                    }
                    Ok(Field::TrackingStopped { time }) => {
                        // a stop only counts if it postdates everything
                        // the device has ever reported
                        let after_locations =
                            matches!(state.last_location_time(), Some(t) if time > t);
                        if time > state.tracking_stopped_time
                            && time > state.battery_level_time
                            && time > state.network_name_time
                            && after_locations
                        {
                            state.tracking_stopped_time = time;
                            stopped_updated = true;
                        }
                    }
                    Ok(Field::Unknown { id, size }) => {
                        debug!("skipping unknown tracking field {} (size={})", id, size);
                    }
                    Err(_) => {
                        broken_fields += 1;
                        // iteration ends here; applied prefix stands
                    }
                }
            }

            let updated = battery_updated
                || network_updated
                || stopped_updated
                || !new_locations.is_empty();
            if updated && !state.subscribers.is_empty() {
                let frame_sm = state.update_frame(
                    battery_updated,
                    network_updated,
                    stopped_updated,
                    &new_locations,
                );
                // copy the subscriber list so sends happen unlocked
                fanout = Some((frame_sm, state.subscribers.clone()));
            }
        }

        if broken_fields > 0 {
            warn!(
                "invalid <Tracking> message received ({} broken fields)\n{}",
                broken_fields,
                display::describe_tracking(frame, TrackingVariant::TrackerToServer, decoder)
            );
        }

        if let Some((frame_sm, subscribers)) = fanout {
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "fan out to {} subscribers: {}",
                    subscribers.len(),
                    display::describe_tracking(&frame_sm, TrackingVariant::ServerToMonitor, decoder)
                );
            }
            for subscriber in subscribers {
                subscriber.send(&frame_sm);
            }
        }
    }

    /// Answer a resync request: partition the listed sequence numbers by
    /// membership in the received set, preserving request order within
    /// each partition, and reply ack + request lists.
    pub fn handle_resync_request(&self, session: &Arc<SessionHandle>, frame: &[u8]) {
        let listed = resync::resync_request::sequence_numbers(frame);
        if listed.is_empty() {
            return;
        }

        let (acks, requests) = {
            let state = self.state.lock();
            let mut acks = Vec::new();
            let mut requests = Vec::new();
            for sn in listed {
                if state.received_messages.contains(&sn) {
                    acks.push(sn);
                } else {
                    requests.push(sn);
                }
            }
            (acks, requests)
        };

        let mut reply = vec![0u8; resync::resync_reply::size(acks.len(), requests.len())];
        resync::resync_reply::encode(&mut reply, &acks, &requests);
        debug!(
            "{}: send {}",
            session.peer(),
            display::describe(&reply)
        );
        session.send(&reply);
    }

    /// Drop a closed session from the subscriber list. Returns whether
    /// it was subscribed at all.
    pub fn remove_subscriber(&self, session_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.subscribers.iter().position(|s| s.id() == session_id) {
            Some(idx) => {
                state.subscribers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Last datagram source observed for this device (diagnostic).
    pub fn last_source_addr(&self) -> Option<SocketAddr> {
        self.state.lock().last_source_addr
    }
}

impl Default for TrackingDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl TrackingDevice {
    pub(crate) fn has_received(&self, sequence: u64) -> bool {
        self.state.lock().received_messages.contains(&sequence)
    }

    pub(crate) fn battery(&self) -> (i64, i16) {
        let state = self.state.lock();
        (state.battery_level_time, state.battery_level)
    }
}
