//! Datagram front end for tracking telemetry.
//!
//! Trackers push Tracking messages over UDP on the relay port. A
//! datagram must hold exactly one message: the declared size has to match
//! the datagram length byte for byte, anything else is dropped with a
//! warning. Valid messages go through the same fusion path as TCP
//! deliveries, with the source address recorded on the device.

use crate::server::Server;
use disha_protocol::display::{self, TrackingVariant};
use disha_protocol::text::StringDecoder;
use disha_protocol::{hexdump, tracking, wire};
use log::{debug, error, info, warn};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Receive loop; runs on its own thread until shutdown.
pub(crate) fn datagram_loop(socket: UdpSocket, server: Arc<Server>, shutdown: Arc<AtomicBool>) {
    let mut decoder = StringDecoder::new();
    let mut buf = vec![0u8; wire::MAX_MESSAGE_SIZE];

    info!("UDP listener started");
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, source)) => {
                handle_datagram(&buf[..len], source, &server, &mut decoder);
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                error!("UDP receive error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    info!("UDP listener exiting");
}

fn handle_datagram(data: &[u8], source: SocketAddr, server: &Server, decoder: &mut StringDecoder) {
    if data.len() < wire::HEADER_SIZE {
        warn!(
            "invalid message received from {}\n{}",
            source,
            hexdump::hex_dump(data, 4)
        );
        return;
    }

    let size = wire::size(data) as usize;
    if size != data.len() {
        warn!(
            "invalid message from {} (declared {} bytes, datagram {})\n{}",
            source,
            size,
            data.len(),
            hexdump::hex_dump(data, 4)
        );
        return;
    }

    let id = wire::id(data);
    if id != tracking::ID || data.len() < tracking::TS_PREFIX_SIZE {
        warn!(
            "unexpected message {} from {}\n{}",
            id,
            source,
            hexdump::hex_dump(data, 4)
        );
        return;
    }

    if log::log_enabled!(log::Level::Debug) {
        debug!(
            "{}: received {}",
            source,
            display::describe_tracking(data, TrackingVariant::TrackerToServer, decoder)
        );
    }
    server.handle_tracking(data, Some(source), decoder);
}
