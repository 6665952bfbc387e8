//! Server configuration.
//!
//! The external surface is fixed by the protocol (`-s`/`-p` on the command
//! line, one shared TCP/UDP port), so configuration is a plain struct with
//! documented defaults rather than a config-file layer.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Storage directory: one empty marker file per registered device
    /// (named by its canonical UUID) plus dated `tracking-*` append logs.
    /// Must exist; the server never creates it.
    pub storage_dir: PathBuf,

    /// Listen port for both TCP and UDP. Port 0 asks the OS for an
    /// ephemeral port (used by tests); the UDP socket always binds the
    /// port the TCP listener actually got.
    pub port: u16,

    /// Minimum interval between rate-limited control requests from one
    /// remote address.
    pub request_min_interval: Duration,

    /// How long an unredeemed link code stays valid. The tracker can
    /// refresh it by re-sending its link request.
    pub link_request_timeout: Duration,

    /// A connection that receives nothing for this long is closed.
    pub idle_timeout: Duration,
}

impl ServerConfig {
    /// Configuration with protocol defaults for the given storage
    /// directory.
    pub fn new(storage_dir: PathBuf) -> Self {
        Self {
            storage_dir,
            port: disha_protocol::DEFAULT_PORT,
            request_min_interval: Duration::from_secs(2),
            link_request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(disha_protocol::SOCKET_TIMEOUT_SECS),
        }
    }
}
