//! On-destination provenance artifacts: per-session CSV manifest, daily
//! event CSV, and the source/quarantine marker files (spec §4.9, §6).

use crate::error::CoreError;
use crate::hash::ALGORITHM_NAME;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const QUARANTINE_DIR_NAME: &str = ".imageintact_quarantine";
const CHECKSUMS_DIR_NAME: &str = ".imageintact_checksums";
const LOGS_DIR_NAME: &str = ".imageintact_logs";
const SOURCE_MARKER_NAME: &str = ".imageintact_source";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestAction {
    Copied,
    Skipped,
    Quarantined,
}

impl ManifestAction {
    fn as_str(&self) -> &'static str {
        match self {
            ManifestAction::Copied => "COPIED",
            ManifestAction::Skipped => "SKIPPED",
            ManifestAction::Quarantined => "QUARANTINED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestRow {
    pub file_path: String,
    pub checksum: String,
    pub file_size: u64,
    pub action: ManifestAction,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub timestamp: chrono::DateTime<Utc>,
    pub session_id: String,
    pub action: String,
    pub source: String,
    pub destination: String,
    pub checksum: String,
    pub file_size: u64,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SourceMarker {
    source_id: String,
    tagged_date: chrono::DateTime<Utc>,
    app_version: String,
}

/// Writes one session's manifest/event CSVs and marker files for a single
/// destination root. One instance per destination, constructed when the
/// Coordinator hands that destination its filtered manifest.
pub struct ManifestWriter {
    dest_root: PathBuf,
    session_id: String,
    session_started_at: chrono::DateTime<Utc>,
}

impl ManifestWriter {
    /// `session_started_at` is fixed once per session and used to name the
    /// per-session manifest CSV; it must not be recomputed per call, or
    /// every append would land in a freshly-named file instead of
    /// accumulating into one (spec §4.9: one manifest CSV per session).
    pub fn new(
        dest_root: impl Into<PathBuf>,
        session_id: impl Into<String>,
        session_started_at: chrono::DateTime<Utc>,
    ) -> Self {
        Self {
            dest_root: dest_root.into(),
            session_id: session_id.into(),
            session_started_at,
        }
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.dest_root.join(QUARANTINE_DIR_NAME)
    }

    /// Build a collision-resolved quarantine destination for `original`.
    /// Same-second collisions append `_<n>` before the extension.
    pub fn quarantine_path_for(&self, original: &Path, now: chrono::DateTime<Utc>) -> PathBuf {
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = original.extension().map(|e| e.to_string_lossy().to_string());
        let timestamp = now.format("%Y%m%d_%H%M%S").to_string();

        let dir = self.quarantine_dir();
        let mut n = 0u32;
        loop {
            let base = if n == 0 {
                format!("{stem}_{timestamp}")
            } else {
                format!("{stem}_{timestamp}_{n}")
            };
            let candidate = match &ext {
                Some(e) => dir.join(format!("{base}.{e}")),
                None => dir.join(base),
            };
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Write the `.imageintact_source` marker at `source_root` if absent.
    /// Idempotent: an existing marker is left untouched.
    pub fn ensure_source_marker(source_root: &Path, app_version: &str) -> Result<(), CoreError> {
        let marker_path = source_root.join(SOURCE_MARKER_NAME);
        if marker_path.exists() {
            return Ok(());
        }
        let marker = SourceMarker {
            source_id: Uuid::new_v4().to_string(),
            tagged_date: Utc::now(),
            app_version: app_version.to_string(),
        };
        let json = serde_json::to_vec_pretty(&marker)?;
        std::fs::write(&marker_path, json)?;
        Ok(())
    }

    pub fn is_designated_source(path: &Path) -> bool {
        path.join(SOURCE_MARKER_NAME).exists()
    }

    /// Append one row to this session's per-destination manifest CSV,
    /// creating the file (with header) on first write.
    pub fn append_manifest_row(&self, row: &ManifestRow) -> Result<(), CoreError> {
        let dir = self.dest_root.join(CHECKSUMS_DIR_NAME);
        std::fs::create_dir_all(&dir)?;
        let filename = format!(
            "manifest_{}_{}.csv",
            self.session_id_timestamp(),
            self.session_id
        );
        let path = dir.join(filename);
        let write_header = !path.exists();

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if write_header {
            writer.write_record([
                "file_path",
                "checksum",
                "algorithm",
                "file_size",
                "action",
                "timestamp",
            ])?;
        }
        writer.write_record([
            row.file_path.as_str(),
            row.checksum.as_str(),
            ALGORITHM_NAME,
            &row.file_size.to_string(),
            row.action.as_str(),
            &row.timestamp.to_rfc3339(),
        ])?;
        writer.flush().map_err(CoreError::Io)?;
        Ok(())
    }

    /// Append one row to today's daily event CSV for this destination.
    pub fn append_event_row(&self, row: &EventRow) -> Result<(), CoreError> {
        let dir = self.dest_root.join(LOGS_DIR_NAME);
        std::fs::create_dir_all(&dir)?;
        let filename = format!("imageintact_{}.csv", row.timestamp.format("%Y-%m-%d"));
        let path = dir.join(filename);
        let write_header = !path.exists();

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if write_header {
            writer.write_record([
                "timestamp",
                "session_id",
                "action",
                "source",
                "destination",
                "checksum",
                "algorithm",
                "file_size",
                "reason",
            ])?;
        }
        writer.write_record([
            row.timestamp.to_rfc3339(),
            row.session_id.clone(),
            row.action.clone(),
            row.source.clone(),
            row.destination.clone(),
            row.checksum.clone(),
            ALGORITHM_NAME.to_string(),
            row.file_size.to_string(),
            row.reason.clone(),
        ])?;
        writer.flush().map_err(CoreError::Io)?;
        Ok(())
    }

    fn session_id_timestamp(&self) -> String {
        self.session_started_at.format("%Y%m%d_%H%M%S").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn manifest_csv_gets_header_on_first_write() {
        let dest = TempDir::new().unwrap();
        let writer = ManifestWriter::new(dest.path(), "sess-1", Utc::now());

        writer
            .append_manifest_row(&ManifestRow {
                file_path: "a.jpg".to_string(),
                checksum: "deadbeef".to_string(),
                file_size: 10,
                action: ManifestAction::Copied,
                timestamp: Utc::now(),
            })
            .unwrap();

        let dir = dest.path().join(CHECKSUMS_DIR_NAME);
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert!(content.starts_with("file_path,checksum,algorithm,file_size,action,timestamp"));
        assert!(content.contains("a.jpg,deadbeef,SHA256,10,COPIED"));
    }

    #[test]
    fn source_marker_is_idempotent() {
        let source = TempDir::new().unwrap();
        ManifestWriter::ensure_source_marker(source.path(), "1.0.0").unwrap();
        let first = std::fs::read_to_string(source.path().join(SOURCE_MARKER_NAME)).unwrap();
        ManifestWriter::ensure_source_marker(source.path(), "1.0.0").unwrap();
        let second = std::fs::read_to_string(source.path().join(SOURCE_MARKER_NAME)).unwrap();
        assert_eq!(first, second);
        assert!(ManifestWriter::is_designated_source(source.path()));
    }

    #[test]
    fn quarantine_path_resolves_same_second_collisions() {
        let dest = TempDir::new().unwrap();
        std::fs::create_dir_all(dest.path().join(QUARANTINE_DIR_NAME)).unwrap();
        let writer = ManifestWriter::new(dest.path(), "sess-1", Utc::now());
        let now = Utc::now();

        let first = writer.quarantine_path_for(Path::new("a.jpg"), now);
        std::fs::write(&first, b"x").unwrap();
        let second = writer.quarantine_path_for(Path::new("a.jpg"), now);

        assert_ne!(first, second);
        assert!(second.to_string_lossy().contains("_1"));
    }
}
