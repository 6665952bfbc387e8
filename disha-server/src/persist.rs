//! Append-only persistence of accepted tracking messages.
//!
//! Every accepted tracker → server Tracking frame (TCP or UDP) is queued
//! to a single writer thread that appends the raw wire bytes to
//! `tracking-YYYY-MM-DD` in the storage directory. Contract:
//!
//! - strictly FIFO, single consumer
//! - each frame is retained until written, then released
//! - the file is flushed before the writer goes idle, never mid-batch
//! - write errors are logged and swallowed; the in-memory state stays
//!   authoritative for this run
//!
//! Producers never block: the channel is unbounded and `append` is a
//! plain send.

use crate::error::Result;
use chrono::Local;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{info, warn};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::thread::{self, JoinHandle};

/// File-name prefix shared with the startup replay scan.
pub const TRACKING_FILE_PREFIX: &str = "tracking";

pub struct TrackingLog {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl TrackingLog {
    /// Open (append, create) today's tracking file and start the writer
    /// thread.
    pub fn open(storage_dir: &Path) -> Result<Self> {
        let name = Local::now()
            .format(&format!("{}-%Y-%m-%d", TRACKING_FILE_PREFIX))
            .to_string();
        let path = storage_dir.join(name);
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        info!("write tracking updates to file {}", path.display());

        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = thread::Builder::new()
            .name("tracking-log".to_string())
            .spawn(move || writer_loop(file, rx))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Queue one wire frame for appending. Frames arriving after
    /// [`TrackingLog::shutdown`] are dropped with a warning.
    pub fn append(&self, frame: Vec<u8>) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            warn!("tracking log writer is gone, update dropped");
            return;
        };
        if tx.send(frame).is_err() {
            warn!("tracking log writer is gone, update dropped");
        }
    }

    /// Drain the queue, flush and close the file. Idempotent.
    pub fn shutdown(&self) {
        // closing the channel lets the writer drain and exit
        self.tx.lock().take();
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.join();
        }
    }
}

impl Drop for TrackingLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop(mut file: File, rx: Receiver<Vec<u8>>) {
    while let Ok(frame) = rx.recv() {
        write_frame(&mut file, &frame);
        // drain whatever queued up behind it, then flush once
        loop {
            match rx.try_recv() {
                Ok(frame) => write_frame(&mut file, &frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    flush(&mut file);
                    return;
                }
            }
        }
        flush(&mut file);
    }
    flush(&mut file);
}

fn write_frame(file: &mut File, frame: &[u8]) {
    if let Err(e) = file.write_all(frame) {
        warn!("tracking log write failed: {}", e);
    }
}

fn flush(file: &mut File) {
    if let Err(e) = file.flush() {
        warn!("tracking log flush failed: {}", e);
    }
}
