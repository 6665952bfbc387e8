//! Composition root: binds the sockets, owns the shared services and the
//! front-end threads, and knows how to shut everything down.
//!
//! TCP and UDP share one port: the listener binds first (port 0 lets the
//! OS pick, used by tests), then the datagram socket binds whatever port
//! the listener actually got. Accepted connections each run on their own
//! detached session thread; the acceptor and UDP loops are joined on
//! shutdown.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::server::Server;
use crate::session;
use crate::timer::TimerQueue;
use crate::udp;
use log::{error, info};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct ServerRuntime {
    server: Arc<Server>,
    timers: Arc<TimerQueue>,
    shutdown: Arc<AtomicBool>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerRuntime {
    /// Open the storage, bind both sockets and start all service
    /// threads.
    pub fn start(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))?;
        let tcp_addr = listener.local_addr()?;
        let udp_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, tcp_addr.port()))?;
        let udp_addr = udp_socket.local_addr()?;

        // non-blocking accept / timed recv so the loops can observe the
        // shutdown flag
        listener.set_nonblocking(true)?;
        udp_socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        let server = Server::open(config)?;
        let timers = Arc::new(TimerQueue::new());
        let limiter = Arc::new(RateLimiter::new(server.config().request_min_interval));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        {
            let server = Arc::clone(&server);
            let timers = Arc::clone(&timers);
            let shutdown = Arc::clone(&shutdown);
            let idle_timeout = server.config().idle_timeout;
            workers.push(
                thread::Builder::new()
                    .name("acceptor".to_string())
                    .spawn(move || {
                        accept_loop(listener, server, limiter, timers, idle_timeout, shutdown)
                    })?,
            );
        }
        {
            let server = Arc::clone(&server);
            let shutdown = Arc::clone(&shutdown);
            workers.push(
                thread::Builder::new()
                    .name("udp-listener".to_string())
                    .spawn(move || udp::datagram_loop(udp_socket, server, shutdown))?,
            );
        }

        info!("server acceptor started at port {}", tcp_addr.port());
        Ok(Self {
            server,
            timers,
            shutdown,
            tcp_addr,
            udp_addr,
            workers: Mutex::new(workers),
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Stop timers and front ends, then wait for them. Sessions notice
    /// the flag via their read timeouts and drain on their own. Safe to
    /// call more than once.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("shutting down...");
        self.timers.stop();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        self.server.shutdown_persistence();
        info!("server stopped");
    }
}

impl Drop for ServerRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    server: Arc<Server>,
    limiter: Arc<RateLimiter>,
    timers: Arc<TimerQueue>,
    idle_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                session::spawn(
                    stream,
                    peer,
                    Arc::clone(&server),
                    Arc::clone(&limiter),
                    Arc::clone(&timers),
                    idle_timeout,
                    Arc::clone(&shutdown),
                );
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("accept error: {}", e);
            }
        }
    }
    info!("acceptor exiting");
}
