//! Single source of truth for phase, per-destination counters, ETA, and
//! the bounded error list (spec §4.7, §C7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Maximum number of failed-file records retained; oldest drops on overflow.
pub const MAX_FAILED_FILES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AnalyzingSource,
    BuildingManifest,
    AnalyzingDestinations,
    Copying,
    Verifying,
    Complete,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Idle,
    Copying,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DestinationStatus {
    pub total: usize,
    pub completed: usize,
    pub verified: usize,
    pub failed: usize,
    pub state: DestinationState,
    pub current_file: Option<String>,
}

impl DestinationStatus {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            verified: 0,
            failed: 0,
            state: DestinationState::Idle,
            current_file: None,
        }
    }

    /// A destination is terminal iff `completed + failed == total`.
    pub fn is_terminal(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

#[derive(Debug, Clone)]
pub struct FailedFile {
    pub relative_path: String,
    pub destination_name: String,
    pub error_kind: String,
    pub message: String,
    pub attempt_count: u32,
}

/// A consistent, point-in-time read of every observable field.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub is_running: bool,
    pub overall_progress: f64,
    pub total_files: usize,
    pub processed_files: usize,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub copy_speed_mb_per_s: f64,
    pub eta_seconds: Option<u64>,
    pub destinations: HashMap<String, DestinationStatus>,
    pub last_error: Option<String>,
    pub failed_files: Vec<FailedFile>,
    pub network_operation_in_progress: bool,
    pub network_retry_attempt: u32,
    pub network_retry_max_attempts: u32,
}

struct Inner {
    phase: Phase,
    is_running: bool,
    total_files: usize,
    processed_files: usize,
    total_bytes: u64,
    transferred_bytes: u64,
    start_time: Option<Instant>,
    destinations: HashMap<String, DestinationStatus>,
    last_error: Option<String>,
    failed_files: std::collections::VecDeque<FailedFile>,
    network_operation_in_progress: bool,
    network_retry_attempt: u32,
    network_retry_max_attempts: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            is_running: false,
            total_files: 0,
            processed_files: 0,
            total_bytes: 0,
            transferred_bytes: 0,
            start_time: None,
            destinations: HashMap::new(),
            last_error: None,
            failed_files: std::collections::VecDeque::new(),
            network_operation_in_progress: false,
            network_retry_attempt: 0,
            network_retry_max_attempts: 0,
        }
    }
}

/// Single-writer progress publisher. All mutating methods take `&self`
/// and serialize on an internal lock; readers take a lock-free-feeling
/// snapshot (a single read-lock acquisition copies every field out).
#[derive(Clone)]
pub struct ProgressPublisher {
    inner: Arc<RwLock<Inner>>,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub async fn start_backup(&self, total_files: usize, total_bytes: u64, destinations: &[String]) {
        let mut inner = self.inner.write().await;
        inner.phase = Phase::Copying;
        inner.is_running = true;
        inner.total_files = total_files;
        inner.total_bytes = total_bytes;
        inner.processed_files = 0;
        inner.transferred_bytes = 0;
        inner.start_time = Some(Instant::now());
        inner.last_error = None;
        inner.failed_files.clear();
        inner.destinations = destinations
            .iter()
            .map(|d| (d.clone(), DestinationStatus::new(0)))
            .collect();
    }

    pub async fn set_phase(&self, phase: Phase) {
        let mut inner = self.inner.write().await;
        inner.phase = phase;
    }

    pub async fn register_destination(&self, name: &str, total: usize) {
        let mut inner = self.inner.write().await;
        inner
            .destinations
            .entry(name.to_string())
            .or_insert_with(|| DestinationStatus::new(total))
            .total = total;
    }

    pub async fn update_destination<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut DestinationStatus),
    {
        let mut inner = self.inner.write().await;
        if let Some(status) = inner.destinations.get_mut(name) {
            f(status);
        }
    }

    /// Monotonic advance: `completed`/`verified`/`processed_files`/
    /// `transferred_bytes` never decrement (spec §5).
    pub async fn advance_completed(&self, name: &str, bytes: u64, verified: bool) {
        let mut inner = self.inner.write().await;
        inner.processed_files += 1;
        inner.transferred_bytes += bytes;
        if let Some(status) = inner.destinations.get_mut(name) {
            status.completed += 1;
            if verified {
                status.verified += 1;
            }
        }
    }

    pub async fn record_failure(&self, failure: FailedFile) {
        let mut inner = self.inner.write().await;
        inner.processed_files += 1;
        if let Some(status) = inner.destinations.get_mut(&failure.destination_name) {
            status.failed += 1;
        }
        inner.last_error = Some(failure.message.clone());
        if inner.failed_files.len() >= MAX_FAILED_FILES {
            inner.failed_files.pop_front();
        }
        inner.failed_files.push_back(failure);
    }

    pub async fn set_network_retry(&self, in_progress: bool, attempt: u32, max_attempts: u32) {
        let mut inner = self.inner.write().await;
        inner.network_operation_in_progress = in_progress;
        inner.network_retry_attempt = attempt;
        inner.network_retry_max_attempts = max_attempts;
    }

    pub async fn complete_backup(&self) {
        let mut inner = self.inner.write().await;
        inner.is_running = false;
        inner.phase = Phase::Complete;
    }

    pub async fn cancel_backup(&self) {
        let mut inner = self.inner.write().await;
        inner.is_running = false;
        inner.phase = Phase::Cancelled;
        for status in inner.destinations.values_mut() {
            if !matches!(
                status.state,
                DestinationState::Completed | DestinationState::Failed
            ) {
                status.state = DestinationState::Cancelled;
            }
        }
    }

    pub async fn fail_backup(&self, error: String) {
        let mut inner = self.inner.write().await;
        inner.is_running = false;
        inner.phase = Phase::Failed;
        inner.last_error = Some(error);
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
    }

    /// Aggregation rule (spec §4.6): mean of per-destination completion
    /// ratios, excluding destinations with `total == 0`; `0` if none have
    /// work (legal for an empty destination set, no division by zero).
    pub async fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.read().await;

        let active: Vec<&DestinationStatus> =
            inner.destinations.values().filter(|d| d.total > 0).collect();
        let overall_progress = if active.is_empty() {
            0.0
        } else {
            active
                .iter()
                .map(|d| d.completed as f64 / d.total as f64)
                .sum::<f64>()
                / active.len() as f64
        };

        let elapsed_secs = inner
            .start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let copy_speed_mb_per_s = if elapsed_secs > 0.0 {
            (inner.transferred_bytes as f64 / (1024.0 * 1024.0)) / elapsed_secs
        } else {
            0.0
        };
        let eta_seconds = if copy_speed_mb_per_s > 0.0 {
            let remaining_bytes = inner.total_bytes.saturating_sub(inner.transferred_bytes);
            Some((remaining_bytes as f64 / (copy_speed_mb_per_s * 1024.0 * 1024.0)) as u64)
        } else {
            None
        };

        ProgressSnapshot {
            phase: inner.phase,
            is_running: inner.is_running,
            overall_progress,
            total_files: inner.total_files,
            processed_files: inner.processed_files,
            total_bytes: inner.total_bytes,
            transferred_bytes: inner.transferred_bytes,
            copy_speed_mb_per_s,
            eta_seconds,
            destinations: inner.destinations.clone(),
            last_error: inner.last_error.clone(),
            failed_files: inner.failed_files.iter().cloned().collect(),
            network_operation_in_progress: inner.network_operation_in_progress,
            network_retry_attempt: inner.network_retry_attempt,
            network_retry_max_attempts: inner.network_retry_max_attempts,
        }
    }
}
