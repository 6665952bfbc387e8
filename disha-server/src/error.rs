//! Error types for the relay daemon.
//!
//! Recovery is handler-local wherever possible:
//!
//! - **`Io`**: socket and file errors. Connection-level ones tear down the
//!   affected session only; persistence errors are logged and swallowed,
//!   the in-memory state stays authoritative for the run.
//! - **`InvalidFrame`**: a stream delivered a header that cannot be
//!   trusted (undersized or oversized declared length). The only error
//!   that closes a connection on its own.
//! - **`Config`**: bad startup input; reported once and fatal.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
