//! Shared progress state, the single operation slot and cooperative
//! cancellation.
//!
//! One [`ProgressReporter`] and one [`OperationSlot`] exist per engine. The
//! running task is the only writer; any number of callers may poll
//! [`ProgressReporter::snapshot`] or hold a [`watch::Receiver`] from
//! [`ProgressReporter::subscribe`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::errors::{BackupError, ErrorKind, Result};

/// Recovers the guard from a poisoned mutex. A panicking writer must not take
/// the polling path down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "Mutex poisoned, recovering state of type {}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
    Maintenance,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => f.write_str("backup"),
            OperationKind::Restore => f.write_str("restore"),
            OperationKind::Maintenance => f.write_str("maintenance"),
        }
    }
}

/// Phase of the running operation. Backups go through
/// `Initializing → Reading → Converting → Compressing → Finalizing`, restores
/// through `Initializing → Validating → Staging → Verifying → Swapping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Idle,
    Initializing,
    Reading,
    Converting,
    Compressing,
    Finalizing,
    Validating,
    Staging,
    Verifying,
    Swapping,
    Completed,
}

/// What a poller sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub operation: Option<OperationKind>,
    pub phase: OperationPhase,
    pub percentage: f64,
    pub message: String,
    pub processed: u64,
    pub total: u64,
    pub elapsed_seconds: u64,
    /// `-1` until at least one unit has been processed.
    pub estimated_remaining_seconds: i64,
    pub current_table: u32,
    pub total_tables: u32,
    pub stalled: bool,
}

impl ProgressSnapshot {
    pub fn idle() -> Self {
        Self {
            operation: None,
            phase: OperationPhase::Idle,
            percentage: 0.0,
            message: String::new(),
            processed: 0,
            total: 0,
            elapsed_seconds: 0,
            estimated_remaining_seconds: -1,
            current_table: 0,
            total_tables: 0,
            stalled: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == OperationPhase::Idle
    }
}

#[derive(Debug)]
struct ProgressState {
    operation: Option<OperationKind>,
    phase: OperationPhase,
    message: String,
    processed: u64,
    total: u64,
    current_table: u32,
    total_tables: u32,
    started: Option<Instant>,
    frozen_elapsed: Option<Duration>,
    last_update: Option<Instant>,
    stalled: bool,
}

impl ProgressState {
    fn idle() -> Self {
        Self {
            operation: None,
            phase: OperationPhase::Idle,
            message: String::new(),
            processed: 0,
            total: 0,
            current_table: 0,
            total_tables: 0,
            started: None,
            frozen_elapsed: None,
            last_update: None,
            stalled: false,
        }
    }

    fn elapsed(&self) -> Duration {
        match (self.frozen_elapsed, self.started) {
            (Some(frozen), _) => frozen,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    fn percentage(&self) -> f64 {
        if self.phase == OperationPhase::Completed {
            return 100.0;
        }
        if self.total == 0 {
            return 0.0;
        }
        (self.processed as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }

    fn eta_seconds(&self) -> i64 {
        if self.phase == OperationPhase::Completed {
            return 0;
        }
        if self.processed == 0 {
            return -1;
        }
        let remaining = self.total.saturating_sub(self.processed) as f64;
        let eta = self.elapsed().as_secs_f64() * remaining / self.processed as f64;
        eta.round() as i64
    }

    fn snapshot(&self) -> ProgressSnapshot {
        if self.phase == OperationPhase::Idle {
            return ProgressSnapshot::idle();
        }
        ProgressSnapshot {
            operation: self.operation,
            phase: self.phase,
            percentage: self.percentage(),
            message: self.message.clone(),
            processed: self.processed,
            total: self.total,
            elapsed_seconds: self.elapsed().as_secs(),
            estimated_remaining_seconds: self.eta_seconds(),
            current_table: self.current_table,
            total_tables: self.total_tables,
            stalled: self.stalled,
        }
    }
}

struct SharedProgress {
    state: Mutex<ProgressState>,
    tx: watch::Sender<ProgressSnapshot>,
}

/// Synchronized progress state with a polling view and a push view.
#[derive(Clone)]
pub struct ProgressReporter {
    shared: Arc<SharedProgress>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::idle());
        Self {
            shared: Arc::new(SharedProgress {
                state: Mutex::new(ProgressState::idle()),
                tx,
            }),
        }
    }

    /// Non-blocking; safe before, during and after an operation.
    pub fn snapshot(&self) -> ProgressSnapshot {
        lock(&self.shared.state).snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.shared.tx.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut ProgressState)) {
        let snapshot = {
            let mut state = lock(&self.shared.state);
            f(&mut state);
            state.last_update = Some(Instant::now());
            state.stalled = false;
            state.snapshot()
        };
        self.shared.tx.send_replace(snapshot);
    }

    pub(crate) fn begin(&self, kind: OperationKind, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| {
            *state = ProgressState::idle();
            state.operation = Some(kind);
            state.phase = OperationPhase::Initializing;
            state.message = message;
            state.started = Some(Instant::now());
        });
    }

    pub(crate) fn phase(&self, phase: OperationPhase, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| {
            state.phase = phase;
            state.message = message;
        });
    }

    pub(crate) fn set_totals(&self, total: u64, total_tables: u32) {
        self.update(|state| {
            state.total = total;
            state.total_tables = total_tables;
        });
    }

    /// `index` is 1-based.
    pub(crate) fn enter_table(&self, index: u32, phase: OperationPhase, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| {
            state.current_table = index.max(state.current_table);
            state.phase = phase;
            state.message = message;
        });
    }

    /// Moves `processed` forward by `delta`. Never moves it backwards.
    pub(crate) fn advance(&self, delta: u64) {
        self.update(|state| {
            state.processed = state.processed.saturating_add(delta);
            if state.processed > state.total {
                state.total = state.processed;
            }
        });
    }

    pub(crate) fn complete(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| {
            state.frozen_elapsed = Some(state.elapsed());
            state.phase = OperationPhase::Completed;
            state.processed = state.processed.max(state.total);
            state.current_table = state.total_tables;
            state.message = message;
        });
    }

    pub(crate) fn reset(&self) {
        let snapshot = {
            let mut state = lock(&self.shared.state);
            *state = ProgressState::idle();
            state.snapshot()
        };
        self.shared.tx.send_replace(snapshot);
    }

    /// Flags the running operation as stalled when nothing was reported for
    /// `threshold`. Returns the silence duration the first time it trips.
    pub(crate) fn flag_stall(&self, threshold: Duration) -> Option<Duration> {
        let snapshot = {
            let mut state = lock(&self.shared.state);
            if matches!(state.phase, OperationPhase::Idle | OperationPhase::Completed) || state.stalled {
                return None;
            }
            let silent_for = state.last_update?.elapsed();
            if silent_for < threshold {
                return None;
            }
            state.stalled = true;
            (state.snapshot(), silent_for)
        };
        self.shared.tx.send_replace(snapshot.0);
        Some(snapshot.1)
    }
}

/// Final state of the most recent operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Completed { operation: OperationKind },
    Failed { operation: OperationKind, kind: ErrorKind, message: String },
    Cancelled { operation: OperationKind },
}

struct ActiveOperation {
    id: Uuid,
    kind: OperationKind,
    cancel: CancellationToken,
}

/// Holds at most one running operation.
#[derive(Default)]
pub struct OperationSlot {
    active: Mutex<Option<ActiveOperation>>,
    last_outcome: Mutex<Option<OperationOutcome>>,
}

impl OperationSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims the slot or fails synchronously with a concurrency error.
    pub fn try_begin(self: &Arc<Self>, kind: OperationKind) -> Result<OperationGuard> {
        let mut active = lock(&self.active);
        if let Some(running) = active.as_ref() {
            return Err(BackupError::Concurrency(running.kind));
        }
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        *active = Some(ActiveOperation {
            id,
            kind,
            cancel: cancel.clone(),
        });
        Ok(OperationGuard {
            slot: Arc::clone(self),
            id,
            kind,
            cancel,
        })
    }

    /// Requests cancellation of the running operation. Returns `false` and
    /// does nothing when idle.
    pub fn cancel(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_kind(&self) -> Option<OperationKind> {
        lock(&self.active).as_ref().map(|running| running.kind)
    }

    pub fn last_outcome(&self) -> Option<OperationOutcome> {
        lock(&self.last_outcome).clone()
    }
}

/// Ownership of the slot. Dropping it frees the slot.
pub struct OperationGuard {
    slot: Arc<OperationSlot>,
    id: Uuid,
    kind: OperationKind,
    cancel: CancellationToken,
}

impl OperationGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn context(&self, reporter: ProgressReporter) -> OperationContext {
        OperationContext {
            id: self.id,
            reporter,
            cancel: self.cancel.clone(),
        }
    }

    pub(crate) fn finish(self, outcome: OperationOutcome) {
        *lock(&self.slot.last_outcome) = Some(outcome);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut active = lock(&self.slot.active);
        if active.as_ref().is_some_and(|running| running.id == self.id) {
            *active = None;
        }
    }
}

/// Handed to the running task: progress writer plus cancellation checkpoint.
#[derive(Clone)]
pub struct OperationContext {
    pub id: Uuid,
    reporter: ProgressReporter,
    cancel: CancellationToken,
}

impl OperationContext {
    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point: returns `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Logs a warning when the running operation stops reporting progress for
/// `threshold`. Never aborts the operation. Stops when `done` is cancelled.
pub fn spawn_watchdog(
    reporter: ProgressReporter,
    threshold: Duration,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (threshold / 3).max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(silent_for) = reporter.flag_stall(threshold) {
                        let snapshot = reporter.snapshot();
                        warn!(
                            phase = ?snapshot.phase,
                            processed = snapshot.processed,
                            silent_secs = silent_for.as_secs(),
                            "Operation possibly hung: no progress update"
                        );
                    }
                }
            }
        }
    })
}
