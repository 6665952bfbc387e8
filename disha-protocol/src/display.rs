//! Human-readable message rendering for debug-level traffic logging.
//!
//! Every rendered line is self-contained: message name, declared size and
//! the decoded payload, with client timestamps formatted as UTC wall
//! clock. Truncated frames render as a note instead of panicking so the
//! renderer is safe to call on anything the session layer accepted.

use crate::text::StringDecoder;
use crate::tracking::{self, Field};
use crate::{hexdump, messages, resync, wire};
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Which Tracking variant a frame should be decoded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingVariant {
    TrackerToServer,
    ServerToMonitor,
}

fn format_time(time: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(time) {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => time.to_string(),
    }
}

/// Describe a control message frame by its id. Tracking frames need the
/// variant and go through [`describe_tracking`].
pub fn describe(frame: &[u8]) -> String {
    if frame.len() < wire::HEADER_SIZE {
        return format!("<truncated frame> {}", hexdump::hex_dump_line(frame));
    }

    let size = wire::size(frame);
    let id = wire::id(frame);
    match id {
        messages::ping::ID => format!("<Ping> (size={})", size),
        messages::register_request::ID => format!("<RegisterRequest> (size={})", size),
        messages::register_reply::ID if frame.len() >= messages::register_reply::SIZE => format!(
            "<RegisterReply> (size={}) device id {}",
            size,
            messages::register_reply::device_id(frame)
        ),
        messages::tracker_link_request::ID
            if frame.len() >= messages::tracker_link_request::SIZE =>
        {
            format!(
                "<TrackerLinkRequest> (size={}) device id {}",
                size,
                messages::tracker_link_request::device_id(frame)
            )
        }
        messages::tracker_link_reply::ID if frame.len() >= messages::tracker_link_reply::SIZE => {
            format!(
                "<TrackerLinkReply> (size={}) link code {}",
                size,
                messages::tracker_link_reply::link_code(frame)
            )
        }
        messages::monitor_link_request::ID
            if frame.len() >= messages::monitor_link_request::SIZE =>
        {
            format!(
                "<MonitorLinkRequest> (size={}) link code {}",
                size,
                messages::monitor_link_request::link_code(frame)
            )
        }
        messages::monitor_link_reply::ID if frame.len() >= messages::monitor_link_reply::SIZE => {
            format!(
                "<MonitorLinkReply> (size={}) device id {}",
                size,
                messages::monitor_link_reply::device_id(frame)
            )
        }
        messages::stream_open_request::ID
            if frame.len() >= messages::stream_open_request::SIZE =>
        {
            format!(
                "<StreamOpenRequest> (size={}) device id {}",
                size,
                messages::stream_open_request::device_id(frame)
            )
        }
        resync::resync_request::ID if frame.len() >= resync::resync_request::MIN_SIZE => {
            format!(
                "<ResyncRequest> (size={}) device id {}, messages {:?}",
                size,
                resync::resync_request::device_id(frame),
                resync::resync_request::sequence_numbers(frame)
            )
        }
        resync::resync_reply::ID if frame.len() >= resync::resync_reply::MIN_SIZE => {
            let (acks, requests) = resync::resync_reply::decode(frame);
            format!(
                "<ResyncReply> (size={}) ack {:?}, request {:?}",
                size, acks, requests
            )
        }
        _ => format!(
            "<message {}> (size={}) {}",
            id,
            size,
            hexdump::hex_dump_line(frame)
        ),
    }
}

/// Describe a Tracking frame, decoding every TLV field. Malformed fields
/// render in place and end the listing, mirroring how the fusion path
/// treats them.
pub fn describe_tracking(
    frame: &[u8],
    variant: TrackingVariant,
    decoder: &mut StringDecoder,
) -> String {
    let mut out = String::new();
    let _ = write!(out, "<Tracking> (size={}) {{", wire::size(frame));

    let fields = match variant {
        TrackingVariant::TrackerToServer => {
            if frame.len() < tracking::TS_PREFIX_SIZE {
                let _ = write!(out, " <truncated> }}");
                return out;
            }
            let _ = write!(
                out,
                "\n   <device id> = {}\n   <sequence number> = {}",
                tracking::device_id(frame),
                tracking::sequence_number(frame)
            );
            tracking::fields_ts(frame)
        }
        TrackingVariant::ServerToMonitor => tracking::fields_sm(frame),
    };

    for field in fields {
        out.push_str("\n   ");
        match field {
            Ok(Field::BatteryLevel { time, level }) => {
                let _ = write!(out, "<battery level> = {}, {}%", format_time(time), level);
            }
            Ok(Field::NetworkName { time, name }) => {
                let _ = write!(out, "<network name> = {}, ", format_time(time));
                match decoder.decode(name) {
                    Some(text) => {
                        let _ = write!(out, "'{}'", text);
                    }
                    None => {
                        let _ = write!(out, "failed to decode {}", hexdump::hex_dump_line(name));
                    }
                }
            }
            Ok(Field::Location {
                time,
                latitude,
                longitude,
                altitude,
            }) => {
                let _ = write!(
                    out,
                    "<location> = {}, ({}, {}, {})",
                    format_time(time),
                    latitude,
                    longitude,
                    altitude
                );
            }
            Ok(Field::TrackingStopped { time }) => {
                let _ = write!(out, "<tracking stopped> = {}", format_time(time));
            }
            Ok(Field::Unknown { id, size }) => {
                let _ = write!(out, "unknown field {} (size={})", id, size);
            }
            Err(err) => {
                let _ = write!(out, "invalid message: {}", err);
            }
        }
    }
    out.push_str("\n}");
    out
}
