//! Per-destination worker: copy → verify → record, with bounded
//! concurrency, retry, and quarantine (spec §4.5, the largest component).

use crate::error::FileOpError;
use crate::eventlog::{EventLogger, EventType, NewEvent, Severity};
use crate::fileops::FileOps;
use crate::hash;
use crate::manifest_writer::{EventRow, ManifestAction, ManifestRow, ManifestWriter};
use crate::progress::{DestinationState, FailedFile, ProgressPublisher};
use crate::retry::RetryPolicy;
use crate::scanner::manifest::{Manifest, ManifestEntry};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Clamps a configured worker count into the bracket for a destination
/// class (spec §4.5: local ≤ 8, external ≤ 4, network = 1 effective).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationClass {
    Local,
    External,
    Network,
}

impl DestinationClass {
    pub fn clamp_workers(&self, requested: usize) -> usize {
        let ceiling = match self {
            DestinationClass::Local => 8,
            DestinationClass::External => 4,
            DestinationClass::Network => 1,
        };
        requested.clamp(1, ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub destination_name: String,
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub organization_name: String,
    pub class: DestinationClass,
    pub worker_count: usize,
    pub network_destination: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Copied,
    Skipped,
    /// Reserved for a future terminal "quarantined, not replaced" policy;
    /// today quarantine is always followed by a copy attempt.
    #[allow(dead_code)]
    Quarantined,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FileResult {
    pub relative_path: String,
    pub outcome: FileOutcome,
}

/// Per-destination worker pool. One instance owns exactly one destination
/// root's DestinationStatus and task list; never shares them with another
/// queue (spec §4.5 "At-most-one writer per (destination, relative_path)").
pub struct DestinationQueue {
    config: QueueConfig,
    fileops: Arc<FileOps>,
    retry: RetryPolicy,
    progress: ProgressPublisher,
    eventlog: Option<EventLogger>,
    session_id: String,
    session_started_at: chrono::DateTime<Utc>,
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

impl DestinationQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: QueueConfig,
        fileops: Arc<FileOps>,
        retry: RetryPolicy,
        progress: ProgressPublisher,
        eventlog: Option<EventLogger>,
        session_id: String,
        session_started_at: chrono::DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            fileops,
            retry,
            progress,
            eventlog,
            session_id,
            session_started_at,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub fn in_flight_files(&self) -> Vec<String> {
        self.in_flight
            .lock()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Run the full manifest through this destination's worker pool.
    /// Returns once every task reaches a terminal state (done or failed)
    /// or cancellation drains the pool.
    pub async fn run(&self, manifest: Arc<Manifest>, cancel: &CancellationToken) -> Vec<FileResult> {
        self.progress
            .register_destination(&self.config.destination_name, manifest.len())
            .await;
        self.progress
            .update_destination(&self.config.destination_name, |s| s.state = DestinationState::Copying)
            .await;

        let worker_count = self.config.class.clamp_workers(self.config.worker_count);
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let mut handles = Vec::with_capacity(manifest.len());

        for entry in manifest.entries() {
            if cancel.is_cancelled() {
                break;
            }
            let entry = entry.clone();
            let sem = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let this = self.clone_for_task();

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                this.run_one(entry, &cancel).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!("file task panicked: {}", e),
            }
        }

        if !cancel.is_cancelled() {
            let any_failed = results.iter().any(|r| matches!(r.outcome, FileOutcome::Failed(_)));
            let terminal = if any_failed {
                DestinationState::Failed
            } else {
                DestinationState::Completed
            };
            self.progress
                .update_destination(&self.config.destination_name, |s| s.state = terminal)
                .await;
        }

        results
    }

    /// Clone the bits a spawned task needs; cheap, everything is `Arc`/`Clone`.
    fn clone_for_task(&self) -> TaskContext {
        TaskContext {
            config: self.config.clone(),
            fileops: Arc::clone(&self.fileops),
            retry: self.retry,
            progress: self.progress.clone(),
            eventlog: self.eventlog.clone(),
            session_id: self.session_id.clone(),
            manifest_writer_dest_root: self.config.dest_root.clone(),
            manifest_writer_session: self.session_id.clone(),
            manifest_writer_started_at: self.session_started_at,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

/// Owned state handed to each spawned per-file task. Split out from
/// `DestinationQueue` so `run_one` can be a plain async fn without
/// borrowing across the `tokio::spawn` boundary.
#[derive(Clone)]
struct TaskContext {
    config: QueueConfig,
    fileops: Arc<FileOps>,
    retry: RetryPolicy,
    progress: ProgressPublisher,
    eventlog: Option<EventLogger>,
    session_id: String,
    manifest_writer_dest_root: PathBuf,
    manifest_writer_session: String,
    manifest_writer_started_at: chrono::DateTime<Utc>,
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

impl TaskContext {
    fn manifest_writer(&self) -> ManifestWriter {
        ManifestWriter::new(
            self.manifest_writer_dest_root.clone(),
            self.manifest_writer_session.clone(),
            self.manifest_writer_started_at,
        )
    }

    fn log_event(&self, event: NewEvent) {
        if let Some(logger) = &self.eventlog {
            logger.log_event(&self.session_id, event);
        }
    }

    async fn run_one(self, entry: ManifestEntry, cancel: &CancellationToken) -> FileResult {
        self.in_flight
            .lock()
            .expect("lock poisoned")
            .insert(entry.relative_path.clone());

        let result = self.run_one_inner(&entry, cancel).await;

        self.in_flight
            .lock()
            .expect("lock poisoned")
            .remove(&entry.relative_path);

        result
    }

    async fn run_one_inner(&self, entry: &ManifestEntry, cancel: &CancellationToken) -> FileResult {
        if cancel.is_cancelled() {
            return FileResult {
                relative_path: entry.relative_path.clone(),
                outcome: FileOutcome::Failed("cancelled".to_string()),
            };
        }

        let dest_path = if self.config.organization_name.is_empty() {
            self.config.dest_root.join(&entry.relative_path)
        } else {
            self.config
                .dest_root
                .join(&self.config.organization_name)
                .join(&entry.relative_path)
        };

        if let Some(parent) = dest_path.parent() {
            if let Err(e) = self.fileops.create_dir_all(parent).await {
                return self.record_failure(entry, e).await;
            }
        }

        if self.fileops.exists(&dest_path) {
            match hash::digest_blocking(&dest_path) {
                Ok(existing_digest) if existing_digest == entry.source_digest => {
                    return self.record_skip(entry, &dest_path).await;
                }
                _ => {
                    if let Err(e) = self.quarantine_existing(entry, &dest_path).await {
                        return self.record_failure(entry, e).await;
                    }
                }
            }
        }

        let copy_result = self
            .retry
            .execute_with_retry(
                cancel,
                || {
                    let fileops = Arc::clone(&self.fileops);
                    let src = entry.source_absolute_path.clone();
                    let dst = dest_path.clone();
                    let network = self.config.network_destination;
                    let dest_root = self.config.dest_root.clone();
                    let src_root = self.config.source_root.clone();
                    async move { fileops.copy(&src, &src_root, &dst, &dest_root, network).await }
                },
                |attempt, max| {
                    debug!(
                        "retrying copy of {} (attempt {}/{})",
                        entry.relative_path, attempt, max
                    );
                },
            )
            .await;

        if let Err(e) = copy_result {
            return self.record_failure(entry, e).await;
        }

        self.progress
            .update_destination(&self.config.destination_name, |s| s.state = DestinationState::Verifying)
            .await;

        match hash::digest(&dest_path, cancel).await {
            Ok(digest) if digest == entry.source_digest => {
                self.fileops
                    .xattr_copy(&entry.source_absolute_path, &dest_path)
                    .await;
                self.record_copied(entry, &dest_path).await
            }
            Ok(mismatched) => {
                let err = FileOpError::ChecksumMismatch {
                    path: entry.relative_path.clone(),
                    expected: entry.source_digest.clone(),
                    actual: mismatched,
                };
                let _ = self.quarantine_existing(entry, &dest_path).await;
                self.record_failure(entry, err).await
            }
            Err(e) => self.record_failure(entry, e).await,
        }
    }

    async fn quarantine_existing(
        &self,
        entry: &ManifestEntry,
        dest_path: &PathBuf,
    ) -> Result<(), FileOpError> {
        let writer = self.manifest_writer();
        let quarantine_dir = writer.quarantine_dir();
        self.fileops.create_dir_all(&quarantine_dir).await?;

        // The displaced file's own content digest, not the incoming
        // manifest entry's, since they differ (that's why it's quarantined).
        let displaced_digest = hash::digest_blocking(dest_path).unwrap_or_default();
        let displaced_size = self.fileops.attributes(dest_path).map(|a| a.size).unwrap_or(0);

        let quarantine_path = writer.quarantine_path_for(dest_path, Utc::now());
        self.fileops.rename(dest_path, &quarantine_path).await?;

        self.log_event(NewEvent {
            event_type: Some(EventType::Quarantine),
            severity: Some(Severity::Warning),
            file_path: Some(dest_path.display().to_string()),
            destination_path: Some(quarantine_path.display().to_string()),
            ..Default::default()
        });

        let _ = writer.append_manifest_row(&ManifestRow {
            file_path: entry.relative_path.clone(),
            checksum: displaced_digest,
            file_size: displaced_size,
            action: ManifestAction::Quarantined,
            timestamp: Utc::now(),
        });
        let _ = writer.append_event_row(&EventRow {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            action: "QUARANTINED".to_string(),
            source: entry.relative_path.clone(),
            destination: quarantine_path.display().to_string(),
            checksum: entry.source_digest.clone(),
            file_size: entry.size_bytes,
            reason: "destination content diverged from source".to_string(),
        });

        Ok(())
    }

    async fn record_skip(&self, entry: &ManifestEntry, dest_path: &PathBuf) -> FileResult {
        self.progress
            .advance_completed(&self.config.destination_name, 0, true)
            .await;

        self.log_event(NewEvent {
            event_type: Some(EventType::Skip),
            severity: Some(Severity::Info),
            file_path: Some(entry.relative_path.clone()),
            destination_path: Some(dest_path.display().to_string()),
            size: Some(entry.size_bytes),
            digest: Some(entry.source_digest.clone()),
            ..Default::default()
        });

        let _ = self.manifest_writer().append_manifest_row(&ManifestRow {
            file_path: entry.relative_path.clone(),
            checksum: entry.source_digest.clone(),
            file_size: entry.size_bytes,
            action: ManifestAction::Skipped,
            timestamp: Utc::now(),
        });
        let _ = self.manifest_writer().append_event_row(&EventRow {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            action: "SKIPPED".to_string(),
            source: entry.relative_path.clone(),
            destination: dest_path.display().to_string(),
            checksum: entry.source_digest.clone(),
            file_size: entry.size_bytes,
            reason: "digest matched existing destination file".to_string(),
        });

        FileResult {
            relative_path: entry.relative_path.clone(),
            outcome: FileOutcome::Skipped,
        }
    }

    async fn record_copied(&self, entry: &ManifestEntry, dest_path: &PathBuf) -> FileResult {
        self.progress
            .advance_completed(&self.config.destination_name, entry.size_bytes, true)
            .await;

        self.log_event(NewEvent {
            event_type: Some(EventType::Copy),
            severity: Some(Severity::Info),
            file_path: Some(entry.relative_path.clone()),
            destination_path: Some(dest_path.display().to_string()),
            size: Some(entry.size_bytes),
            digest: Some(entry.source_digest.clone()),
            ..Default::default()
        });

        let _ = self.manifest_writer().append_manifest_row(&ManifestRow {
            file_path: entry.relative_path.clone(),
            checksum: entry.source_digest.clone(),
            file_size: entry.size_bytes,
            action: ManifestAction::Copied,
            timestamp: Utc::now(),
        });
        let _ = self.manifest_writer().append_event_row(&EventRow {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            action: "COPIED".to_string(),
            source: entry.relative_path.clone(),
            destination: dest_path.display().to_string(),
            checksum: entry.source_digest.clone(),
            file_size: entry.size_bytes,
            reason: String::new(),
        });

        info!("copied {} -> {}", entry.relative_path, dest_path.display());

        FileResult {
            relative_path: entry.relative_path.clone(),
            outcome: FileOutcome::Copied,
        }
    }

    async fn record_failure(&self, entry: &ManifestEntry, error: FileOpError) -> FileResult {
        if error.classify() == crate::error::ErrorClass::Cancelled {
            return FileResult {
                relative_path: entry.relative_path.clone(),
                outcome: FileOutcome::Failed("cancelled".to_string()),
            };
        }

        self.progress
            .record_failure(FailedFile {
                relative_path: entry.relative_path.clone(),
                destination_name: self.config.destination_name.clone(),
                error_kind: error.kind_str().to_string(),
                message: error.to_string(),
                attempt_count: 1,
            })
            .await;

        self.log_event(NewEvent {
            event_type: Some(EventType::Error),
            severity: Some(Severity::Error),
            file_path: Some(entry.relative_path.clone()),
            error_message: Some(error.to_string()),
            ..Default::default()
        });

        warn!(
            "failed to back up {} to {}: {}",
            entry.relative_path, self.config.destination_name, error
        );

        FileResult {
            relative_path: entry.relative_path.clone(),
            outcome: FileOutcome::Failed(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn entry(path: &str, content: &[u8], source_dir: &std::path::Path) -> ManifestEntry {
        let abs = source_dir.join(path);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&abs, content).unwrap();
        let digest = hash::digest_blocking(&abs).unwrap();
        ManifestEntry {
            relative_path: path.to_string(),
            source_absolute_path: abs,
            source_digest: digest,
            size_bytes: content.len() as u64,
            image_width: None,
            image_height: None,
        }
    }

    fn test_queue(source_root: &std::path::Path, dest_root: &std::path::Path) -> DestinationQueue {
        DestinationQueue::new(
            QueueConfig {
                destination_name: "d1".to_string(),
                source_root: source_root.to_path_buf(),
                dest_root: dest_root.to_path_buf(),
                organization_name: String::new(),
                class: DestinationClass::Local,
                worker_count: 4,
                network_destination: false,
            },
            Arc::new(FileOps::default()),
            RetryPolicy::default(),
            ProgressPublisher::new(),
            None,
            "test-session".to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn fresh_copy_succeeds_and_verifies() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let entries = vec![
            entry("a.jpg", b"aaaaaaaaaa", source.path()),
            entry("sub/c.jpg", b"ccc", source.path()),
        ];
        let manifest = Arc::new(Manifest::from_sorted_entries(entries));

        let queue = test_queue(source.path(), dest.path());
        let cancel = CancellationToken::new();
        let results = queue.run(manifest, &cancel).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == FileOutcome::Copied));
        assert_eq!(fs::read(dest.path().join("a.jpg")).unwrap(), b"aaaaaaaaaa");
        assert_eq!(fs::read(dest.path().join("sub/c.jpg")).unwrap(), b"ccc");
    }

    #[tokio::test]
    async fn second_run_skips_unchanged_file() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let entries = vec![entry("a.jpg", b"aaaaaaaaaa", source.path())];
        let manifest = Arc::new(Manifest::from_sorted_entries(entries));

        let queue = test_queue(source.path(), dest.path());
        let cancel = CancellationToken::new();
        queue.run(Arc::clone(&manifest), &cancel).await;

        let second = test_queue(source.path(), dest.path());
        let results = second.run(manifest, &cancel).await;

        assert_eq!(results[0].outcome, FileOutcome::Skipped);
    }

    #[tokio::test]
    async fn divergent_content_is_quarantined_then_replaced() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("a.jpg"), b"zzzzzzzzzz").unwrap();
        let entries = vec![entry("a.jpg", b"aaaaaaaaaa", source.path())];
        let manifest = Arc::new(Manifest::from_sorted_entries(entries));

        let queue = test_queue(source.path(), dest.path());
        let cancel = CancellationToken::new();
        let results = queue.run(manifest, &cancel).await;

        assert_eq!(results[0].outcome, FileOutcome::Copied);
        assert_eq!(fs::read(dest.path().join("a.jpg")).unwrap(), b"aaaaaaaaaa");

        let quarantine_dir = dest.path().join(".imageintact_quarantine");
        let quarantined: Vec<_> = fs::read_dir(&quarantine_dir).unwrap().collect();
        assert_eq!(quarantined.len(), 1);
        let content = fs::read(quarantined[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(content, b"zzzzzzzzzz");
    }

    #[tokio::test]
    async fn destination_state_reaches_completed_after_a_clean_run() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let entries = vec![entry("a.jpg", b"aaaaaaaaaa", source.path())];
        let manifest = Arc::new(Manifest::from_sorted_entries(entries));

        let progress = ProgressPublisher::new();
        let queue = DestinationQueue::new(
            QueueConfig {
                destination_name: "d1".to_string(),
                source_root: source.path().to_path_buf(),
                dest_root: dest.path().to_path_buf(),
                organization_name: String::new(),
                class: DestinationClass::Local,
                worker_count: 4,
                network_destination: false,
            },
            Arc::new(FileOps::default()),
            RetryPolicy::default(),
            progress.clone(),
            None,
            "test-session".to_string(),
            Utc::now(),
        );
        let cancel = CancellationToken::new();
        queue.run(manifest, &cancel).await;

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.destinations["d1"].state, DestinationState::Completed);
    }

    #[tokio::test]
    async fn cancellation_before_run_yields_no_results() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let entries = vec![entry("a.jpg", b"aaaaaaaaaa", source.path())];
        let manifest = Arc::new(Manifest::from_sorted_entries(entries));

        let queue = test_queue(source.path(), dest.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = queue.run(manifest, &cancel).await;

        assert!(results.is_empty());
        assert!(!dest.path().join("a.jpg").exists());
    }
}
