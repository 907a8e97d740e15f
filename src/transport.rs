//! Transport collaborator used by the relay queue.
//!
//! The node does not open sockets itself. [`OutboxTransport`] hands each
//! payload to an external forwarder by appending a JSON line to a spool file.
//! The forwarder reads the spool back with [`OutboxTransport::read_all`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pushes a payload toward a peer address. A call either fully succeeds or
/// fails; the relay queue records no partial delivery.
pub trait Transport: Send + Sync {
    fn send(&self, peer_address: &str, payload: &str) -> Result<(), String>;
}

/// One spooled hand-off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub address: String,
    pub payload: String,
    /// RFC 3339, second precision.
    pub queued_at: String,
}

/// Appends hand-offs to a JSON-lines spool.
#[derive(Debug)]
pub struct OutboxTransport {
    path: PathBuf,
    // serializes appends from the shell and the background ticker
    lock: Mutex<()>,
}

impl OutboxTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    /// Parse every entry currently in the spool, oldest first. This is the
    /// forwarder side of the hand-off; a missing spool reads as empty.
    pub fn read_all(&self) -> Result<Vec<OutboxEntry>, String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(format!("cannot read {}: {e}", self.path.display())),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| format!("malformed outbox line: {e}")))
            .collect()
    }
}

impl Transport for OutboxTransport {
    fn send(&self, peer_address: &str, payload: &str) -> Result<(), String> {
        let entry = OutboxEntry {
            address: peer_address.to_string(),
            payload: payload.to_string(),
            queued_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| format!("serialize: {e}"))?;
        line.push('\n');

        let _guard = self.lock.lock().map_err(|_| "outbox lock poisoned".to_string())?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| format!("cannot open {}: {e}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| format!("cannot append to {}: {e}", self.path.display()))?;

        debug!(address = %peer_address, bytes = payload.len(), "payload spooled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn send_appends_json_lines() {
        let tmp = TempDir::new().unwrap();
        let t = OutboxTransport::new(tmp.path().join("spool").join("outbox.jsonl"));
        t.send("10.0.0.2:7000", "hello").unwrap();
        t.send("10.0.0.3:7000", "line\nbreak").unwrap();

        let entries = t.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].address, "10.0.0.2:7000");
        assert_eq!(entries[1].payload, "line\nbreak");
    }

    #[test]
    fn missing_spool_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let t = OutboxTransport::new(tmp.path().join("outbox.jsonl"));
        assert!(t.read_all().unwrap().is_empty());
    }

    #[test]
    fn unwritable_spool_fails() {
        let tmp = TempDir::new().unwrap();
        // a directory where the file should be
        let t = OutboxTransport::new(tmp.path());
        assert!(t.send("addr", "payload").is_err());
    }
}
