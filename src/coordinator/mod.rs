//! Orchestrates Scanner → DuplicateDetector → DestinationQueue fan-out across
//! every destination of one backup run, aggregates progress, and owns the
//! cancel/complete lifecycle (spec §4.6, the run's top-level state machine).

use crate::duplicate::{Analysis, DuplicateDetector};
use crate::error::{CoreError, FileOpError};
use crate::eventlog::{EventLogger, EventType, NewEvent, SessionStatus, Severity};
use crate::fileops::FileOps;
use crate::manifest_writer::ManifestWriter;
use crate::progress::{Phase, ProgressPublisher};
use crate::queue::{DestinationClass, DestinationQueue, FileResult, QueueConfig};
use crate::retry::RetryPolicy;
use crate::scanner::{self, ScanOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One destination as handed to the Coordinator by the caller (CLI, host
/// app, or test harness). `network_destination` is a caller hint; the
/// Coordinator additionally probes with `FileOps::is_network_volume` and
/// ORs the two, since a caller may not know a mount's true nature.
#[derive(Debug, Clone)]
pub struct DestinationSpec {
    pub name: String,
    pub root: PathBuf,
    pub organization_name: String,
    pub class: DestinationClass,
    pub worker_count: usize,
    pub network_destination: bool,
}

/// Terminal status of a run. `CompletedWithErrors` is still `complete` at
/// the phase level (spec §4.6); it is broken out here so callers can tell
/// a clean run from one with `failed_files` without re-walking results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    CompletedWithErrors,
    Cancelled,
    Failed,
}

#[derive(Debug)]
pub struct DestinationOutcome {
    pub name: String,
    pub results: Vec<FileResult>,
    pub analysis: Analysis,
}

#[derive(Debug)]
pub struct BackupOutcome {
    pub session_id: String,
    pub outcome: SessionOutcome,
    pub destinations: Vec<DestinationOutcome>,
    /// Set for non-fatal boundary conditions, e.g. an empty manifest or a
    /// destination excluded for being unreachable while others succeeded.
    pub warning: Option<String>,
}

/// One full backup run: one source, N destinations, one session id.
/// Constructed fresh per run; not reused across runs.
pub struct BackupCoordinator {
    source_root: PathBuf,
    destinations: Vec<DestinationSpec>,
    scan_options: ScanOptions,
    duplicate_scan_depth: usize,
    skip_exact_duplicates: bool,
    skip_renamed_duplicates: bool,
    fileops: Arc<FileOps>,
    retry: RetryPolicy,
    progress: ProgressPublisher,
    eventlog: Option<EventLogger>,
    app_version: String,
    prevent_sleep: bool,
    cancel: CancellationToken,
}

impl BackupCoordinator {
    /// Validates the destination set before constructing: at least one
    /// destination, and no two destinations sharing a root (spec §8:
    /// "zero destinations: illegal"; identical destination paths undefined
    /// behavior unless caught here).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_root: PathBuf,
        destinations: Vec<DestinationSpec>,
        scan_options: ScanOptions,
        duplicate_scan_depth: usize,
        skip_exact_duplicates: bool,
        skip_renamed_duplicates: bool,
        fileops: Arc<FileOps>,
        retry: RetryPolicy,
        eventlog: Option<EventLogger>,
        app_version: &str,
        prevent_sleep: bool,
    ) -> Result<Self, CoreError> {
        if destinations.is_empty() {
            return Err(CoreError::Config(
                "at least one destination is required".to_string(),
            ));
        }
        for (i, a) in destinations.iter().enumerate() {
            for b in &destinations[i + 1..] {
                if a.root == b.root {
                    return Err(CoreError::Config(format!(
                        "destinations '{}' and '{}' share the same root",
                        a.name, b.name
                    )));
                }
            }
        }

        Ok(Self {
            source_root,
            destinations,
            scan_options,
            duplicate_scan_depth,
            skip_exact_duplicates,
            skip_renamed_duplicates,
            fileops,
            retry,
            progress: ProgressPublisher::new(),
            eventlog,
            app_version: app_version.to_string(),
            prevent_sleep,
            cancel: CancellationToken::new(),
        })
    }

    pub fn progress(&self) -> &ProgressPublisher {
        &self.progress
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal cancellation. Idempotent; multiple calls coalesce (spec §5).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the full pipeline to a terminal state. Returns `Ok` even when
    /// the session ends `Failed`/`Cancelled` — `Err` is reserved for
    /// problems in the surrounding infrastructure (e.g. a caller bug such
    /// as an invalid destination set, already rejected in `new`), not for
    /// backup-domain conditions the spec enumerates as ordinary outcomes.
    pub async fn run(&self) -> Result<BackupOutcome, CoreError> {
        let session_id = Uuid::new_v4().to_string();
        let session_started_at = chrono::Utc::now();

        self.progress.set_phase(Phase::AnalyzingSource).await;

        if !self.source_root.is_dir() {
            let message = format!("source root is not a readable directory: {}", self.source_root.display());
            error!("{}", message);
            self.progress.fail_backup(message.clone()).await;
            return Ok(BackupOutcome {
                session_id,
                outcome: SessionOutcome::Failed,
                destinations: vec![],
                warning: Some(message),
            });
        }

        if let Err(e) = ManifestWriter::ensure_source_marker(&self.source_root, &self.app_version) {
            warn!("failed to write source marker: {}", e);
        }

        let scan = match scanner::build_manifest(&self.source_root, self.scan_options.clone(), &self.cancel).await {
            Ok(result) => result,
            Err(FileOpError::Cancelled) => {
                self.progress.cancel_backup().await;
                return Ok(BackupOutcome {
                    session_id,
                    outcome: SessionOutcome::Cancelled,
                    destinations: vec![],
                    warning: None,
                });
            }
            Err(e) => {
                let message = format!("failed to scan source: {e}");
                error!("{}", message);
                self.progress.fail_backup(message.clone()).await;
                return Ok(BackupOutcome {
                    session_id,
                    outcome: SessionOutcome::Failed,
                    destinations: vec![],
                    warning: Some(message),
                });
            }
        };
        self.progress.set_phase(Phase::BuildingManifest).await;

        for warning in &scan.warnings {
            warn!("scan warning: {} ({})", warning.reason, warning.path.display());
        }

        let manifest = Arc::new(scan.manifest);
        let total_files = manifest.len();
        let total_bytes = manifest.total_bytes();

        if let Some(logger) = &self.eventlog {
            let _ = logger.start_session(
                &self.source_root.display().to_string(),
                total_files as u64,
                total_bytes,
                &self.app_version,
                Some(session_id.clone()),
            );
            logger.log_event(
                &session_id,
                NewEvent {
                    event_type: Some(EventType::Scan),
                    severity: Some(Severity::Info),
                    metadata: Some(format!("{{\"warnings\":{}}}", scan.warnings.len())),
                    ..Default::default()
                },
            );
        }

        self.progress.set_phase(Phase::AnalyzingDestinations).await;

        let mut plans = Vec::with_capacity(self.destinations.len());
        let mut excluded = Vec::new();

        for spec in &self.destinations {
            if ManifestWriter::is_designated_source(&spec.root) {
                warn!(
                    "destination '{}' is a tagged source tree; excluding",
                    spec.name
                );
                excluded.push(spec.name.clone());
                continue;
            }
            if let Err(e) = self.fileops.create_dir_all(&spec.root).await {
                warn!("destination '{}' unreachable: {}", spec.name, e);
                excluded.push(spec.name.clone());
                continue;
            }

            let detector = match DuplicateDetector::build(
                &spec.root,
                &spec.organization_name,
                self.duplicate_scan_depth,
                &self.cancel,
            )
            .await
            {
                Ok(d) => d,
                Err(e) => {
                    warn!("destination '{}' duplicate index failed: {}", spec.name, e);
                    excluded.push(spec.name.clone());
                    continue;
                }
            };

            let (filtered, analysis) = detector.analyze_and_filter(
                &manifest,
                self.skip_exact_duplicates,
                self.skip_renamed_duplicates,
                None,
            );
            let network_destination = spec.network_destination || self.fileops.is_network_volume(&spec.root);

            plans.push((spec.clone(), Arc::new(crate::scanner::manifest::Manifest::from_sorted_entries(filtered)), analysis, network_destination));
        }

        if plans.is_empty() {
            let message = "all destinations are unreachable".to_string();
            error!("{}", message);
            self.progress.fail_backup(message.clone()).await;
            if let Some(logger) = &self.eventlog {
                logger.complete_session(&session_id, SessionStatus::Failed);
                logger.flush().await;
            }
            return Ok(BackupOutcome {
                session_id,
                outcome: SessionOutcome::Failed,
                destinations: vec![],
                warning: Some(message),
            });
        }

        let destination_names: Vec<String> = plans.iter().map(|(s, _, _, _)| s.name.clone()).collect();
        self.progress.start_backup(total_files, total_bytes, &destination_names).await;
        if self.prevent_sleep {
            crate::power::begin(&format!("backup session {session_id} in progress"));
        }
        self.progress.set_phase(Phase::Copying).await;

        let mut queues = Vec::with_capacity(plans.len());
        let mut handles = Vec::with_capacity(plans.len());

        for (spec, filtered_manifest, analysis, network_destination) in plans {
            let queue = Arc::new(DestinationQueue::new(
                QueueConfig {
                    destination_name: spec.name.clone(),
                    source_root: self.source_root.clone(),
                    dest_root: spec.root.clone(),
                    organization_name: spec.organization_name.clone(),
                    class: spec.class,
                    worker_count: spec.worker_count,
                    network_destination,
                },
                Arc::clone(&self.fileops),
                self.retry,
                self.progress.clone(),
                self.eventlog.clone(),
                session_id.clone(),
                session_started_at,
            ));
            queues.push(Arc::clone(&queue));

            let cancel = self.cancel.clone();
            let manifest_for_task = Arc::clone(&filtered_manifest);
            let name = spec.name.clone();
            handles.push(tokio::spawn(async move {
                let results = queue.run(manifest_for_task, &cancel).await;
                (name, results, analysis)
            }));
        }

        let cancel_for_watch = self.cancel.clone();
        let queues_for_watch = queues.clone();
        let eventlog_for_watch = self.eventlog.clone();
        let session_for_watch = session_id.clone();
        let watcher = tokio::spawn(async move {
            cancel_for_watch.cancelled().await;
            let mut in_flight = Vec::new();
            for queue in &queues_for_watch {
                in_flight.extend(queue.in_flight_files());
            }
            if let Some(logger) = &eventlog_for_watch {
                logger.log_cancellation(&session_for_watch, &in_flight);
            }
        });

        let mut destination_outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((name, results, analysis)) => {
                    destination_outcomes.push(DestinationOutcome { name, results, analysis });
                }
                Err(e) => error!("destination queue task panicked: {}", e),
            }
        }

        let was_cancelled = self.cancel.is_cancelled();
        if !was_cancelled {
            watcher.abort();
        } else {
            let _ = watcher.await;
        }

        if !excluded.is_empty() {
            info!("destinations excluded from this run: {:?}", excluded);
        }

        if was_cancelled {
            if self.prevent_sleep {
                crate::power::end();
            }
            self.progress.cancel_backup().await;
            if let Some(logger) = &self.eventlog {
                logger.flush().await;
            }
            return Ok(BackupOutcome {
                session_id,
                outcome: SessionOutcome::Cancelled,
                destinations: destination_outcomes,
                warning: None,
            });
        }

        let any_failed = destination_outcomes
            .iter()
            .any(|d| d.results.iter().any(|r| matches!(r.outcome, crate::queue::FileOutcome::Failed(_))));

        // spec §7: escalate to `Failed` rather than `CompletedWithErrors`
        // when every destination that failed anything failed *exclusively*
        // on NoSpace. `failed_files` carries the classified error kind that
        // `FileOutcome::Failed`'s formatted message does not.
        let outcome = if any_failed && self.all_failures_are_no_space(&destination_outcomes).await {
            SessionOutcome::Failed
        } else if any_failed {
            SessionOutcome::CompletedWithErrors
        } else {
            SessionOutcome::Completed
        };

        if self.prevent_sleep {
            crate::power::end();
        }
        self.progress.complete_backup().await;
        if let Some(logger) = &self.eventlog {
            logger.complete_session(&session_id, SessionStatus::Completed);
            logger.flush().await;
        }

        let warning = if total_files == 0 {
            Some("source manifest was empty".to_string())
        } else if !excluded.is_empty() {
            Some(format!("destinations excluded as unreachable: {}", excluded.join(", ")))
        } else {
            None
        };

        Ok(BackupOutcome {
            session_id,
            outcome,
            destinations: destination_outcomes,
            warning,
        })
    }

    /// True iff every destination with at least one failure failed
    /// exclusively on `NoSpace` (spec §7). A destination with zero
    /// failures doesn't block the escalation; one failure of any other
    /// kind on any destination does.
    async fn all_failures_are_no_space(&self, destinations: &[DestinationOutcome]) -> bool {
        let snapshot = self.progress.snapshot().await;
        destinations
            .iter()
            .filter(|d| d.results.iter().any(|r| matches!(r.outcome, crate::queue::FileOutcome::Failed(_))))
            .all(|d| {
                snapshot
                    .failed_files
                    .iter()
                    .filter(|f| f.destination_name == d.name)
                    .all(|f| f.error_kind == "NoSpace")
            })
    }
}
