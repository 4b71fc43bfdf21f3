//! Bounded worker pool

use super::types::{CancelHandle, EngineError, EngineEvent, EngineResult, RunOptions, RunSummary, SubjectResult};
use crate::capture::{CaptureError, CaptureRequest, CaptureTargets, Capturer};
use crate::catalog::Subject;
use crate::index::{CompositeKey, FileKind, ResultMetrics, ResultStatus, ResultsIndex, SnapshotIndex};
use futures_util::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

/// Per-run shared state
struct RunState {
    queue: Mutex<VecDeque<Subject>>,
    results: Mutex<Vec<SubjectResult>>,
    options: RunOptions,
    total: usize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failures: AtomicUsize,
    /// Set by the failure limit
    limit_reached: AtomicBool,
}

/// Runs capture-and-compare for a list of subjects.
///
/// Holds both index stores and the capturer. One run at a time.
#[derive(Clone)]
pub struct Engine {
    snapshots: Arc<SnapshotIndex>,
    results: Arc<ResultsIndex>,
    capturer: Arc<dyn Capturer>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    cancel: CancelHandle,
    active: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(snapshots: Arc<SnapshotIndex>, results: Arc<ResultsIndex>, capturer: Arc<dyn Capturer>) -> Self {
        Self {
            snapshots,
            results,
            capturer,
            events: None,
            cancel: CancelHandle::new(),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send progress events to `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use an existing cancel handle
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is watching
            let _ = events.send(event);
        }
    }

    fn emit_progress(&self, state: &RunState) {
        self.emit(EngineEvent::Progress {
            running: state.running.load(Ordering::SeqCst),
            completed: state.completed.load(Ordering::SeqCst),
            total: state.total,
        });
    }

    fn should_stop(&self, state: &RunState) -> bool {
        self.cancel.is_cancelled() || state.limit_reached.load(Ordering::SeqCst)
    }

    /// Run every subject and return the aggregate.
    ///
    /// Per-subject capture errors and capturer panics become failed results.
    /// Both stores are flushed before returning, and the cancel handle is
    /// cleared so the engine can run again.
    pub async fn run_all(&self, subjects: Vec<Subject>, options: RunOptions) -> EngineResult<RunSummary> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let outcome = self.run_pool(subjects, options).await;

        if let Err(e) = self.snapshots.flush().await {
            tracing::warn!(error = %e, "Failed to flush snapshot index");
        }
        if let Err(e) = self.results.flush().await {
            tracing::warn!(error = %e, "Failed to flush results index");
        }

        self.cancel.reset();
        self.active.store(false, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn run_pool(&self, subjects: Vec<Subject>, options: RunOptions) -> RunSummary {
        let total = subjects.len();
        let workers = options.concurrency.clamp(1, total.max(1));

        let state = Arc::new(RunState {
            queue: Mutex::new(subjects.into_iter().collect()),
            results: Mutex::new(Vec::with_capacity(total)),
            options,
            total,
            running: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            limit_reached: AtomicBool::new(false),
        });

        tracing::info!(total, workers, "Starting run");
        self.emit(EngineEvent::Log(format!("Running {} stories with {} workers", total, workers)));

        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                let engine = self.clone();
                let state = Arc::clone(&state);
                tokio::spawn(async move { engine.worker(worker_id, state).await })
            })
            .collect();

        // A lost worker only loses its in-flight subject; the rest still report
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        let mut results = std::mem::take(&mut *state.results.lock().await);
        results.sort_by(|a, b| a.subject_key.cmp(&b.subject_key));

        let summary = RunSummary {
            total,
            passed: results.iter().filter(|r| r.status == ResultStatus::Passed).count(),
            failed: results.iter().filter(|r| r.status.is_failure()).count(),
            new_baselines: results.iter().filter(|r| r.status == ResultStatus::New).count(),
            cancelled: self.cancel.is_cancelled(),
            stopped_early: state.limit_reached.load(Ordering::SeqCst),
            results,
        };

        tracing::info!(%summary, "Run finished");
        summary
    }

    async fn worker(&self, worker_id: usize, state: Arc<RunState>) {
        loop {
            if self.should_stop(&state) {
                break;
            }
            let Some(subject) = state.queue.lock().await.pop_front() else {
                break;
            };

            state.running.fetch_add(1, Ordering::SeqCst);
            self.emit(EngineEvent::SubjectStarted {
                subject_key: subject.key.clone(),
                display_name: subject.display_name(),
            });
            self.emit_progress(&state);

            let result = self.run_subject(&subject, &state.options).await;
            tracing::debug!(worker_id, subject = %subject.key, status = %result.status, "Subject completed");

            if result.status.is_failure() {
                let failures = state.failures.fetch_add(1, Ordering::SeqCst) + 1;
                let limit = state.options.max_failures;
                if limit > 0 && failures >= limit && !state.limit_reached.swap(true, Ordering::SeqCst) {
                    tracing::info!(failures, "Failure limit reached, not starting new subjects");
                    self.emit(EngineEvent::Log(format!(
                        "Stopping after {} failures",
                        failures
                    )));
                }
            }

            state.results.lock().await.push(result.clone());
            state.running.fetch_sub(1, Ordering::SeqCst);
            state.completed.fetch_add(1, Ordering::SeqCst);

            self.emit(EngineEvent::SubjectCompleted(result));
            self.emit_progress(&state);
        }
    }

    /// Capture one subject and record its verdict in the results index
    async fn run_subject(&self, subject: &Subject, options: &RunOptions) -> SubjectResult {
        let started = Instant::now();
        let browser = options.browser.as_deref();
        let viewport = options.viewport.as_deref();

        let generated_id = self.snapshots.get_or_create_id(&subject.key, browser, viewport).await;
        let key = Some(subject.key.as_str());
        let targets = CaptureTargets {
            baseline: self
                .snapshots
                .get_path(&generated_id, self.snapshots.root(), FileKind::Baseline, key),
            actual: self
                .results
                .get_path(&generated_id, self.results.root(), FileKind::Actual, key),
            diff: self
                .results
                .get_path(&generated_id, self.results.root(), FileKind::Diff, key),
        };

        let request = CaptureRequest {
            subject: subject.clone(),
            generated_id: generated_id.clone(),
            targets: targets.clone(),
            browser: options.browser.clone(),
            viewport: options.viewport.clone(),
            update_baselines: options.update_baselines,
        };

        let outcome = match targets.ensure_dirs().await {
            Ok(()) => AssertUnwindSafe(self.capturer.capture(&request))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(CaptureError::Failed(panic_message(panic)))),
            Err(e) => Err(CaptureError::Io(e)),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, diff_pixels, diff_percent, error) = match outcome {
            Ok(outcome) => (outcome.status, outcome.diff_pixels, outcome.diff_percent, outcome.error),
            Err(e) => {
                tracing::warn!(subject = %subject.key, error = %e, "Capture failed");
                (ResultStatus::Failed, None, None, Some(e.to_string()))
            }
        };

        if status == ResultStatus::Passed {
            let key = CompositeKey::with_target(
                subject.key.clone(),
                options.browser.clone(),
                options.viewport.clone(),
            );
            self.results.remove_entry(&key).await;
        } else {
            let metrics = ResultMetrics {
                browser: options.browser.clone(),
                viewport_name: options.viewport.clone(),
                diff_pixels,
                diff_percent,
                duration: Some(duration_ms),
                error: error.clone(),
            };
            self.results.set_entry(&subject.key, &generated_id, status, metrics).await;
        }

        SubjectResult {
            subject_key: subject.key.clone(),
            display_name: subject.display_name(),
            generated_id,
            status,
            diff_pixels,
            diff_percent,
            duration_ms,
            error,
            actual_path: targets.actual,
            diff_path: targets.diff,
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("Capture panicked: {}", detail)
}
