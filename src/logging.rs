//! General structured logging (via `tracing`) plus a dedicated access log.
//!
//! The two are deliberately separate sinks: `tracing` output goes to
//! stderr for operators, while the access log is a single-line-per-request
//! file meant for offline analysis and is never interleaved with general
//! diagnostics.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

/// Initializes the general `tracing` subscriber, reading the filter from
/// `RUST_LOG` (default `info`).
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
}

/// A buffered, single-line-per-request access log. `log` is safe to call
/// from a single-threaded worker without extra synchronization, but the
/// writer is mutex-guarded since the type must be `Sync` to live in a
/// worker's shared state.
pub struct AccessLog {
    writer: Mutex<BufWriter<File>>,
}

impl AccessLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: Mutex::new(BufWriter::new(file)) })
    }

    /// Writes `<ip> "<method> <uri>" <status> <bytes>\n`.
    pub fn log(&self, ip: IpAddr, method: &str, uri: &str, status: u16, bytes: u64) {
        let mut w = self.writer.lock().unwrap();
        let _ = writeln!(w, "{ip} \"{method} {uri}\" {status} {bytes}");
        let _ = w.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn writes_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let log = AccessLog::open(&path).unwrap();
        log.log(IpAddr::V4(Ipv4Addr::LOCALHOST), "GET", "/index.html", 200, 2);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "127.0.0.1 \"GET /index.html\" 200 2\n");
    }
}
