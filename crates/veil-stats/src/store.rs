//! Session Log
//!
//! Append-only history of completed sessions, persisted as a JSON array.
//!
//! Key Features:
//! - Whole-file rewrite on every append
//! - Atomic writes (temp file + rename) so a crash never leaves a torn log
//! - Retention window pruning

use crate::session::{now_millis, SessionRecord};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the session log
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt session log {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Aggregate over all closed sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatistics {
    pub total_sessions: u64,
    /// Sum of session durations in milliseconds
    pub total_duration_ms: u64,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    /// Zero when there are no sessions
    pub average_session_duration_ms: u64,
}

impl SessionStatistics {
    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.total_duration_ms)
    }

    pub fn average_session_duration(&self) -> Duration {
        Duration::from_millis(self.average_session_duration_ms)
    }
}

/// The session log.
///
/// A store without a path keeps records in memory only.
#[derive(Debug, Default)]
pub struct SessionStore {
    path: Option<PathBuf>,
    records: Vec<SessionRecord>,
    retention: Option<Duration>,
}

impl SessionStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the log at `path`, loading every record it holds.
    ///
    /// A missing file is an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice::<Vec<SessionRecord>>(&bytes).map_err(|e| {
                StoreError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Loaded {} sessions from {}", records.len(), path.display());

        Ok(Self {
            path: Some(path),
            records,
            retention: None,
        })
    }

    /// Keep only sessions that ended within `retention` of now.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.set_retention(Some(retention));
        self
    }

    /// Change the retention window and prune in memory.
    pub fn set_retention(&mut self, retention: Option<Duration>) {
        self.retention = retention;
        self.prune(now_millis());
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a closed session and persist the whole log.
    ///
    /// The record stays in memory even if persisting fails.
    pub fn append(&mut self, record: SessionRecord) -> Result<(), StoreError> {
        debug!(
            "Appending session {} ({} ms, {} B rx, {} B tx)",
            record.id,
            record.duration().as_millis(),
            record.bytes_received,
            record.bytes_sent
        );
        self.records.push(record);
        self.prune(now_millis());
        self.persist()
    }

    /// Rewrite the log on disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.records)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Aggregate over every record in the log.
    pub fn statistics(&self) -> SessionStatistics {
        let mut stats = SessionStatistics::default();
        for record in &self.records {
            stats.total_sessions += 1;
            stats.total_duration_ms = stats
                .total_duration_ms
                .saturating_add(record.duration().as_millis() as u64);
            stats.total_bytes_received = stats
                .total_bytes_received
                .saturating_add(record.bytes_received);
            stats.total_bytes_sent = stats.total_bytes_sent.saturating_add(record.bytes_sent);
        }
        if stats.total_sessions > 0 {
            stats.average_session_duration_ms = stats.total_duration_ms / stats.total_sessions;
        }
        stats
    }

    fn prune(&mut self, now: u64) {
        let Some(retention) = self.retention else {
            return;
        };
        let cutoff = now.saturating_sub(retention.as_millis() as u64);
        let before = self.records.len();
        self.records.retain(|r| r.ended_at >= cutoff);
        let pruned = before - self.records.len();
        if pruned > 0 {
            info!("Pruned {} sessions older than {:?}", pruned, retention);
        }
    }
}

/// Write `bytes` to `path` atomically.
///
/// Writes a sibling temp file, syncs it and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    write_atomic_with(path, bytes, false)
}

/// Like [`write_atomic`], but on unix the file is owner-only (0600) from
/// creation, before any byte is written.
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    write_atomic_with(path, bytes, true)
}

fn write_atomic_with(path: &Path, bytes: &[u8], private: bool) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = temp_path_for(path);
    let result = (|| {
        let file = open_temp(&temp_path, private)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        if let Err(e) = fs::remove_file(&temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", temp_path.display(), e);
            }
        }
    }
    result
}

#[cfg(unix)]
fn open_temp(path: &Path, private: bool) -> io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if private {
        options.mode(0o600);
    }
    let file = options.open(path)?;
    // A leftover temp file keeps its old mode
    if private {
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

#[cfg(not(unix))]
fn open_temp(path: &Path, _private: bool) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OpenSession;

    fn record(started_at: u64, ended_at: u64, rx: u64, tx: u64) -> SessionRecord {
        let mut record = OpenSession::start_at(started_at, "srv", "wifi").close_at(ended_at);
        record.bytes_received = rx;
        record.bytes_sent = tx;
        record
    }

    #[test]
    fn test_empty_statistics() {
        let store = SessionStore::in_memory();
        let stats = store.statistics();
        assert_eq!(stats, SessionStatistics::default());
        assert_eq!(stats.average_session_duration(), Duration::ZERO);
    }

    #[test]
    fn test_statistics_sum_over_sessions() {
        let now = now_millis();
        let mut store = SessionStore::in_memory();
        store.append(record(now - 10_000, now - 8_000, 100, 1)).unwrap();
        store.append(record(now - 6_000, now - 2_000, 200, 2)).unwrap();
        store.append(record(now - 1_000, now, 300, 3)).unwrap();

        let stats = store.statistics();
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.total_duration_ms, 7_000);
        assert_eq!(stats.total_bytes_received, 600);
        assert_eq!(stats.total_bytes_sent, 6);
        assert_eq!(stats.average_session_duration_ms, 7_000 / 3);
    }

    #[test]
    fn test_statistics_independent_of_close_order() {
        let now = now_millis();
        let records = vec![
            record(now - 5_000, now - 4_000, 7, 70),
            record(now - 3_000, now - 1_000, 11, 110),
            record(now - 900, now - 100, 13, 130),
        ];

        let mut forward = SessionStore::in_memory();
        for r in records.iter().cloned() {
            forward.append(r).unwrap();
        }
        let mut backward = SessionStore::in_memory();
        for r in records.iter().rev().cloned() {
            backward.append(r).unwrap();
        }

        assert_eq!(forward.statistics(), backward.statistics());
        assert_eq!(
            forward.statistics().total_bytes_received,
            records.iter().map(|r| r.bytes_received).sum::<u64>()
        );
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let now = now_millis();
        {
            let mut store = SessionStore::open(&path).unwrap();
            assert!(store.is_empty());
            store.append(record(now - 2_000, now - 1_000, 42, 24)).unwrap();
        }

        let reopened = SessionStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.records()[0].bytes_received, 42);
        assert!(!dir.path().join("sessions.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_log_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, b"{not json").unwrap();

        let err = SessionStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_retention_prunes_old_sessions() {
        let now = now_millis();
        let day = 24 * 3600 * 1000;
        let mut store = SessionStore::in_memory();
        store.append(record(now - 10 * day, now - 9 * day, 1, 1)).unwrap();
        store.append(record(now - 2 * day, now - day, 2, 2)).unwrap();

        store.set_retention(Some(Duration::from_millis(7 * day)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].bytes_received, 2);
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_private_is_owner_only_from_creation() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        // Stale temp file from an interrupted write, world readable
        let temp = dir.path().join("secrets.json.tmp");
        fs::write(&temp, b"stale").unwrap();
        fs::set_permissions(&temp, fs::Permissions::from_mode(0o644)).unwrap();

        write_atomic_private(&path, b"first").unwrap();
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        write_atomic_private(&path, b"second").unwrap();
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!temp.exists());
    }
}
