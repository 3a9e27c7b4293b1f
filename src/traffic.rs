//! Traffic logging for rprox.
//!
//! One line per copied chunk, flushed immediately:
//! `<unix-timestamp> <client-addr>:<port> <direction-tag> <hex-bytes>`

use crate::endpoint::Direction;
use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Append-only sink for proxied traffic.
pub struct TrafficLog {
    file: File,
}

impl TrafficLog {
    /// Creates (truncating) the log file.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
        })
    }

    /// Appends one record and flushes it.
    pub fn record(&mut self, addr: SocketAddr, dir: Direction, data: &[u8]) -> io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        writeln!(
            self.file,
            "{}.{:06} {} {} {}",
            now.as_secs(),
            now.subsec_micros(),
            addr,
            dir.tag(),
            hex::encode(data)
        )?;
        self.file.flush()
    }
}
