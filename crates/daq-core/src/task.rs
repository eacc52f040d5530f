//! Cancellable Tasks
//!
//! Every long-running hardware procedure (centering, autofocus, the whole
//! alignment) runs as a task: a tokio task with a shared handle that exposes
//! its state, a revisable completion estimate, and cooperative cancellation.
//!
//! # Lifecycle
//!
//! ```text
//! launch() ──► Running ──► Finished    (operation returned, no cancel seen)
//!                 │
//!                 └──────► Cancelled   (cancel() accepted while Running)
//! ```
//!
//! Terminal states are sticky. The completion signal fires exactly once, after
//! the operation future has returned, i.e. after whatever cleanup it does on
//! its way out (hardware restoration runs in drop guards inside it).
//!
//! # Cancellation
//!
//! [`TaskHandle::cancel`] flips the state, trips the task's
//! [`CancellationToken`], forwards the request to the nested task currently
//! joined through [`TaskContext::join`], and then waits (bounded by the cancel
//! timeout) for the worker's completion signal. The worker is never aborted:
//! it notices the request at its next [`TaskContext::checkpoint`] and unwinds.
//!
//! ```rust,ignore
//! let handle = launch("spot-center", Duration::from_secs(5), |ctx| async move {
//!     for _ in 0..10 {
//!         ctx.checkpoint()?;
//!         stage.move_rel(&[(Axis::X, 1e-6)]).await?;
//!     }
//!     Ok(())
//! });
//! handle.cancel().await;
//! assert!(handle.result().await.unwrap_err().is_cancelled());
//! ```

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};
use crate::observable::Observable;

/// How long `cancel()` waits for the worker to unwind.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Offset between launch and the estimated start of work.
const START_LATENCY: Duration = Duration::from_millis(100);

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Operation in flight
    Running,
    /// Cancellation accepted (terminal)
    Cancelled,
    /// Operation returned without being cancelled (terminal)
    Finished,
}

/// Snapshot consumed by progress observers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Estimated (then actual) start of work
    pub start: DateTime<Utc>,
    /// Estimated end of work; set to the actual end once done
    pub end: DateTime<Utc>,
    /// Current lifecycle state
    pub state: TaskState,
}

impl TaskProgress {
    /// Fraction of the estimated duration elapsed at `now`, in `[0, 1]`.
    pub fn fraction_at(&self, now: DateTime<Utc>) -> f64 {
        if self.state != TaskState::Running {
            return 1.0;
        }
        let total = (self.end - self.start).num_milliseconds() as f64;
        if total <= 0.0 {
            return 1.0;
        }
        let elapsed = (now - self.start).num_milliseconds() as f64;
        (elapsed / total).clamp(0.0, 1.0)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

struct TaskCore {
    name: String,
    state: Mutex<TaskState>,
    token: CancellationToken,
    progress: Observable<TaskProgress>,
    done: watch::Sender<bool>,
    nested: Mutex<Option<Arc<TaskCore>>>,
    cancel_timeout: Duration,
}

impl TaskCore {
    fn new(name: String, estimate: Duration, cancel_timeout: Duration) -> Self {
        let start = Utc::now() + to_chrono(START_LATENCY);
        let progress = Observable::new(
            format!("{name}.progress"),
            TaskProgress {
                start,
                end: start + to_chrono(estimate),
                state: TaskState::Running,
            },
        )
        .read_only();
        let (done, _) = watch::channel(false);
        Self {
            name,
            state: Mutex::new(TaskState::Running),
            token: CancellationToken::new(),
            progress,
            done,
            nested: Mutex::new(None),
            cancel_timeout,
        }
    }

    fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Running -> Cancelled, forwarded to the active nested task.
    fn request_cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TaskState::Running {
            return false;
        }
        *state = TaskState::Cancelled;
        self.token.cancel();
        if let Some(child) = self.nested.lock().as_ref() {
            child.request_cancel();
        }
        self.progress.modify(|p| p.state = TaskState::Cancelled);
        true
    }

    /// Called once by the worker after the operation returned.
    fn complete(&self) -> TaskState {
        let mut state = self.state.lock();
        if *state == TaskState::Running {
            *state = TaskState::Finished;
        }
        let final_state = *state;
        self.nested.lock().take();
        self.progress.modify(|p| {
            p.state = final_state;
            p.end = Utc::now();
        });
        self.done.send_replace(true);
        final_state
    }

    async fn cancel(&self) -> bool {
        if !self.request_cancel() {
            debug!("Task '{}' already done, nothing to cancel", self.name);
            return false;
        }
        debug!("Cancelling task '{}'...", self.name);

        let mut done = self.done.subscribe();
        let finished = tokio::time::timeout(self.cancel_timeout, done.wait_for(|d| *d))
            .await
            .is_ok();
        if finished {
            debug!("Task '{}' cancelled", self.name);
        } else {
            warn!(
                "Task '{}' still unwinding {:?} after cancellation",
                self.name, self.cancel_timeout
            );
        }
        true
    }
}

/// Builder for tasks that need a non-default cancel timeout.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    estimate: Duration,
    cancel_timeout: Duration,
}

impl TaskBuilder {
    /// Start building a task called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            estimate: Duration::ZERO,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }

    /// Initial duration estimate for progress reporting.
    pub fn estimate(mut self, estimate: Duration) -> Self {
        self.estimate = estimate;
        self
    }

    /// Upper bound `cancel()` waits for the worker.
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Spawn `operation` on its own tokio task and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T, F, Fut>(self, operation: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let core = Arc::new(TaskCore::new(self.name, self.estimate, self.cancel_timeout));
        let ctx = TaskContext { core: core.clone() };
        let work = operation(ctx);

        debug!("Starting task '{}'", core.name);
        let worker = core.clone();
        let join = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(work).catch_unwind().await;
            let final_state = worker.complete();
            match (final_state, outcome) {
                (TaskState::Cancelled, _) => Err(DaqError::Cancelled),
                (_, Err(_)) => Err(DaqError::TaskPanicked(worker.name.clone())),
                (_, Ok(result)) => result,
            }
        });

        TaskHandle { core, join }
    }
}

/// Spawn `operation` as a task with the default cancel timeout.
pub fn launch<T, F, Fut>(name: impl Into<String>, estimate: Duration, operation: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = AppResult<T>> + Send + 'static,
{
    TaskBuilder::new(name).estimate(estimate).spawn(operation)
}

/// Worker-side view of a task: checkpoints, progress updates and nesting.
#[derive(Clone)]
pub struct TaskContext {
    core: Arc<TaskCore>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("name", &self.core.name)
            .field("state", &self.core.state())
            .finish()
    }
}

impl TaskContext {
    /// Task name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// True once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.core.token.is_cancelled()
    }

    /// Fail with [`DaqError::Cancelled`] if cancellation was requested.
    pub fn checkpoint(&self) -> AppResult<()> {
        if self.is_cancelled() {
            debug!("Task '{}' observed cancellation", self.core.name);
            Err(DaqError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Token tripped on cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.token.clone()
    }

    /// Revise the estimated end of the task.
    pub fn set_end_estimate(&self, end: DateTime<Utc>) {
        self.core.progress.modify(|p| p.end = end);
    }

    /// Revise the estimate to `remaining` from now.
    pub fn set_remaining(&self, remaining: Duration) {
        self.set_end_estimate(Utc::now() + to_chrono(remaining));
    }

    /// Wait for a nested task, forwarding cancellation to it meanwhile.
    ///
    /// At most one nested task is tracked per context; joining a second one
    /// replaces the first.
    pub async fn join<T>(&self, child: TaskHandle<T>) -> AppResult<T> {
        *self.core.nested.lock() = Some(child.core.clone());
        // A cancel that landed before the child was registered.
        if self.is_cancelled() {
            child.core.request_cancel();
        }
        let result = child.result().await;
        self.core.nested.lock().take();
        result
    }
}

/// Caller-side handle of a running (or finished) task.
pub struct TaskHandle<T> {
    core: Arc<TaskCore>,
    join: JoinHandle<AppResult<T>>,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.core.name)
            .field("state", &self.core.state())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    /// Task name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// True once the worker has signalled completion.
    pub fn is_done(&self) -> bool {
        *self.core.done.borrow()
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> TaskProgress {
        self.core.progress.get()
    }

    /// Follow progress updates.
    pub fn subscribe(&self) -> watch::Receiver<TaskProgress> {
        self.core.progress.subscribe()
    }

    /// Clonable cancel/monitor handle, usable while `result()` is awaited elsewhere.
    pub fn control(&self) -> TaskControl {
        TaskControl {
            core: self.core.clone(),
        }
    }

    /// Request cancellation and wait (bounded) for the worker to unwind.
    ///
    /// Returns `false` without side effects if the task is no longer running.
    pub async fn cancel(&self) -> bool {
        self.core.cancel().await
    }

    /// Wait for the outcome.
    pub async fn result(self) -> AppResult<T> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(DaqError::Cancelled),
            Err(_) => Err(DaqError::TaskPanicked(self.core.name.clone())),
        }
    }
}

/// Clonable monitor for a task whose handle is owned elsewhere.
#[derive(Clone)]
pub struct TaskControl {
    core: Arc<TaskCore>,
}

impl TaskControl {
    /// Task name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> TaskProgress {
        self.core.progress.get()
    }

    /// Follow progress updates.
    pub fn subscribe(&self) -> watch::Receiver<TaskProgress> {
        self.core.progress.subscribe()
    }

    /// See [`TaskHandle::cancel`].
    pub async fn cancel(&self) -> bool {
        self.core.cancel().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    async fn spin_until_cancelled(ctx: TaskContext) -> AppResult<()> {
        loop {
            ctx.checkpoint()?;
            sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_finished_task_returns_value() {
        let handle = launch("answer", Duration::from_secs(1), |_ctx| async { Ok(42) });
        let control = handle.control();

        assert_eq!(handle.result().await.unwrap(), 42);
        assert_eq!(control.state(), TaskState::Finished);
        assert_eq!(control.progress().state, TaskState::Finished);
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_noop() {
        let handle = launch("quick", Duration::ZERO, |_ctx| async { Ok("done") });
        while !handle.is_done() {
            sleep(Duration::from_millis(1)).await;
        }

        assert!(!handle.cancel().await);
        assert_eq!(handle.state(), TaskState::Finished);
        assert_eq!(handle.result().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let handle: TaskHandle<()> = launch("spinner", Duration::from_secs(5), spin_until_cancelled);
        sleep(Duration::from_millis(10)).await;

        assert!(handle.cancel().await);
        assert!(handle.is_done());
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(handle.result().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_second_cancel_returns_false() {
        let handle: TaskHandle<()> = launch("spinner", Duration::ZERO, spin_until_cancelled);
        assert!(handle.cancel().await);
        assert!(!handle.cancel().await);
    }

    #[tokio::test]
    async fn test_cleanup_runs_before_completion_signal() {
        struct Restore(Arc<AtomicBool>);
        impl Drop for Restore {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let restored = Arc::new(AtomicBool::new(false));
        let flag = restored.clone();
        let handle: TaskHandle<()> = launch("guarded", Duration::ZERO, move |ctx| async move {
            let _guard = Restore(flag);
            spin_until_cancelled(ctx).await
        });
        sleep(Duration::from_millis(5)).await;

        assert!(handle.cancel().await);
        assert!(restored.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancellation_takes_precedence_over_success() {
        let handle = launch("stubborn", Duration::ZERO, |_ctx| async {
            sleep(Duration::from_millis(20)).await;
            Ok(7)
        });
        assert!(handle.cancel().await);
        assert!(handle.result().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_nested_cancellation_unwinds_inner_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let inner_order = order.clone();
        let outer_order = order.clone();
        let inner_started = Arc::new(AtomicBool::new(false));
        let started = inner_started.clone();

        let outer: TaskHandle<()> = launch("outer", Duration::ZERO, move |ctx| async move {
            let inner: TaskHandle<()> = launch("inner", Duration::ZERO, move |ictx| async move {
                started.store(true, Ordering::SeqCst);
                let result = spin_until_cancelled(ictx).await;
                inner_order.lock().push("inner");
                result
            });
            let result = ctx.join(inner).await;
            outer_order.lock().push("outer");
            result
        });

        while !inner_started.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(1)).await;
        }
        assert!(outer.cancel().await);
        assert_eq!(*order.lock(), vec!["inner", "outer"]);
        assert!(outer.result().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_end_estimate_is_observable() {
        let handle: TaskHandle<()> = launch("slow", Duration::from_secs(60), |ctx| async move {
            ctx.set_remaining(Duration::from_secs(1));
            spin_until_cancelled(ctx).await
        });
        let mut rx = handle.subscribe();
        rx.wait_for(|p| (p.end - Utc::now()).num_seconds() < 5)
            .await
            .unwrap();
        let progress = *rx.borrow();
        assert_eq!(progress.state, TaskState::Running);
        assert!(progress.fraction_at(progress.start) <= 1.0);
        handle.cancel().await;
    }

    #[tokio::test]
    async fn test_cancel_timeout_is_bounded() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let handle = TaskBuilder::new("deaf")
            .cancel_timeout(Duration::from_millis(20))
            .spawn(move |_ctx| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(300)).await;
                Ok(())
            });
        sleep(Duration::from_millis(5)).await;

        let start = std::time::Instant::now();
        assert!(handle.cancel().await);
        assert!(start.elapsed() < Duration::from_millis(250));
        assert!(!handle.is_done());
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(handle.result().await.unwrap_err().is_cancelled());
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_operation_reports_panic() {
        let handle: TaskHandle<()> = launch("broken", Duration::ZERO, |_ctx| async {
            let values: Vec<u8> = Vec::new();
            let _ = values[3];
            Ok(())
        });
        let err = handle.result().await.unwrap_err();
        assert!(matches!(err, DaqError::TaskPanicked(name) if name == "broken"));
    }
}
