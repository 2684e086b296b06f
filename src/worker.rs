//! Worker Executor: named background jobs bound to one session.
//!
//! A worker is bound to the session that is current when it is started and
//! keeps operating on it for its whole lifetime, whatever becomes active in
//! the meantime. Workers are plain threads; cancellation is cooperative via
//! [`WorkerCx::checkpoint`] and [`WorkerCx::sleep`], which report
//! [`Interrupted`] once the worker is stopped.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{binding, SessionContext, SessionId, SessionManager};
use crate::tree::StateTree;

/// Marker error for a worker that stopped because it was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted")
    }
}

impl std::error::Error for Interrupted {}

#[derive(Debug)]
pub enum WorkerOutcome {
    Completed,
    /// Interrupted by [`WorkerHandle::stop`] or by closing the session.
    Stopped,
    Failed(anyhow::Error),
}

impl WorkerOutcome {
    fn from_result(result: Result<()>, cancelled: bool) -> Self {
        match result {
            Ok(()) => Self::Completed,
            Err(e) if e.is::<Interrupted>() => Self::Stopped,
            Err(_) if cancelled => Self::Stopped,
            Err(e) => Self::Failed(e),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed(e) => write!(f, "failed: {e:#}"),
        }
    }
}

/// What a worker task sees: its bound session and its stop signal.
pub struct WorkerCx {
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
    name: String,
}

impl WorkerCx {
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Interrupted)` once the worker has been asked to stop.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Interrupted.into());
        }
        Ok(())
    }

    /// Sleep that wakes early with `Err(Interrupted)` when stopped.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::park_timeout(deadline - now);
        }
    }

    /// Run `f` against the bound session's tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut dyn StateTree) -> R) -> Result<R> {
        self.checkpoint()?;
        Ok(self.ctx.with_tree(f))
    }

    pub fn notify(&self, text: &str) {
        self.ctx.with_tree(|t| t.notify(text));
    }
}

type Task = Box<dyn FnOnce(&WorkerCx) -> Result<()> + Send>;

/// Auxiliary task that runs alongside a main worker and is interrupted
/// when the main task ends.
pub struct SupportTask {
    name: String,
    task: Task,
}

impl SupportTask {
    pub fn new<F>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(&WorkerCx) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            task: Box::new(task),
        }
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    name: String,
    session_id: SessionId,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
    outcome: oneshot::Receiver<WorkerOutcome>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Ask the worker to stop. It ends with [`WorkerOutcome::Stopped`] at
    /// its next checkpoint.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Outcome if the worker has finished, without blocking.
    pub fn try_outcome(&mut self) -> Option<WorkerOutcome> {
        self.outcome.try_recv().ok()
    }

    /// Block until the worker ends.
    pub fn join(mut self) -> WorkerOutcome {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                return WorkerOutcome::Failed(anyhow!("worker {} panicked", self.name));
            }
        }
        self.outcome
            .try_recv()
            .unwrap_or_else(|_| WorkerOutcome::Failed(anyhow!("worker {} vanished", self.name)))
    }

    /// Completion future, for async callers.
    pub async fn finished(self) -> WorkerOutcome {
        let name = self.name.clone();
        self.outcome
            .await
            .unwrap_or_else(|_| WorkerOutcome::Failed(anyhow!("worker {name} vanished")))
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Starts workers bound to sessions of one [`SessionManager`].
#[derive(Clone)]
pub struct WorkerExecutor {
    manager: SessionManager,
}

impl WorkerExecutor {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Run `task` bound to the calling thread's current session (its own
    /// binding, else the active session), captured now.
    pub fn run_async<F>(&self, name: &str, task: F) -> Result<WorkerHandle>
    where
        F: FnOnce(&WorkerCx) -> Result<()> + Send + 'static,
    {
        let ctx = self
            .manager
            .current()
            .with_context(|| format!("no session to run worker {name} on"))?;
        self.run_bound(ctx, name, task)
    }

    /// Run `task` bound to an explicit session.
    pub fn run_bound<F>(&self, ctx: Arc<SessionContext>, name: &str, task: F) -> Result<WorkerHandle>
    where
        F: FnOnce(&WorkerCx) -> Result<()> + Send + 'static,
    {
        spawn_worker(ctx, name, Box::new(task), Vec::new(), None)
    }

    /// Like [`run_async`](Self::run_async), also running `supports` on the
    /// same session. Supports are interrupted once `task` ends, then
    /// `on_complete` runs with the task's outcome.
    pub fn run_with_supports<F, C>(
        &self,
        name: &str,
        task: F,
        supports: Vec<SupportTask>,
        on_complete: C,
    ) -> Result<WorkerHandle>
    where
        F: FnOnce(&WorkerCx) -> Result<()> + Send + 'static,
        C: FnOnce(&WorkerOutcome) + Send + 'static,
    {
        let ctx = self
            .manager
            .current()
            .with_context(|| format!("no session to run worker {name} on"))?;
        spawn_worker(ctx, name, Box::new(task), supports, Some(Box::new(on_complete)))
    }
}

type OnComplete = Box<dyn FnOnce(&WorkerOutcome) + Send>;

fn spawn_worker(
    ctx: Arc<SessionContext>,
    name: &str,
    task: Task,
    supports: Vec<SupportTask>,
    on_complete: Option<OnComplete>,
) -> Result<WorkerHandle> {
    let cancel = CancellationToken::new();
    let (tx, outcome) = oneshot::channel();
    let session_id = ctx.id();

    let thread = thread::Builder::new()
        .name(format!("worker-{name}"))
        .spawn({
            let cancel = cancel.clone();
            let name = name.to_string();
            move || {
                let outcome = run_worker(ctx, name, cancel, task, supports);
                if let Some(on_complete) = on_complete {
                    if panic::catch_unwind(AssertUnwindSafe(|| on_complete(&outcome))).is_err() {
                        warn!("Worker completion callback panicked");
                    }
                }
                let _ = tx.send(outcome);
            }
        })
        .with_context(|| format!("failed to spawn worker {name}"))?;

    Ok(WorkerHandle {
        name: name.to_string(),
        session_id,
        cancel,
        thread: Some(thread),
        outcome,
    })
}

fn run_worker(
    ctx: Arc<SessionContext>,
    name: String,
    cancel: CancellationToken,
    task: Task,
    supports: Vec<SupportTask>,
) -> WorkerOutcome {
    let _binding = binding::bind(Arc::clone(&ctx));
    let slot = ctx.register_worker(&name, cancel.clone(), thread::current());
    ctx.set_current_worker(Some(name.clone()));
    info!(session_id = %ctx.id(), worker = %name, "Worker started");

    let support_cancel = cancel.child_token();
    let support_threads: Vec<_> = supports
        .into_iter()
        .filter_map(|support| spawn_support(&ctx, &name, support, support_cancel.clone()))
        .collect();

    let cx = WorkerCx {
        ctx: Arc::clone(&ctx),
        cancel: cancel.clone(),
        name: name.clone(),
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| task(&cx)))
        .unwrap_or_else(|_| Err(anyhow!("worker {name} panicked")));
    let outcome = WorkerOutcome::from_result(result, cancel.is_cancelled());

    support_cancel.cancel();
    for support in support_threads {
        support.thread().unpark();
        let _ = support.join();
    }

    if outcome.is_stopped() && !ctx.is_closed() {
        cx.notify(&format!("{name}: STOPPED"));
    }
    ctx.unregister_worker(slot);
    if ctx.current_worker().as_deref() == Some(name.as_str()) {
        ctx.set_current_worker(None);
    }

    match &outcome {
        WorkerOutcome::Failed(e) => warn!(session_id = %ctx.id(), worker = %name, "Worker failed: {e:#}"),
        other => info!(session_id = %ctx.id(), worker = %name, "Worker {other}"),
    }
    outcome
}

fn spawn_support(
    ctx: &Arc<SessionContext>,
    parent: &str,
    support: SupportTask,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let ctx = Arc::clone(ctx);
    let name = format!("{parent}/{}", support.name);
    let spawned = thread::Builder::new()
        .name(format!("worker-{name}"))
        .spawn({
            let name = name.clone();
            move || {
                let _binding = binding::bind(Arc::clone(&ctx));
                let slot = ctx.register_worker(&name, cancel.clone(), thread::current());
                let cx = WorkerCx { ctx, cancel, name };
                let result = panic::catch_unwind(AssertUnwindSafe(|| (support.task)(&cx)))
                    .unwrap_or_else(|_| Err(anyhow!("support task panicked")));
                match result {
                    Err(e) if !e.is::<Interrupted>() => {
                        warn!(worker = %cx.name, "Support task failed: {e:#}")
                    }
                    _ => debug!(worker = %cx.name, "Support task ended"),
                }
                cx.ctx.unregister_worker(slot);
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(worker = %name, "Failed to spawn support task: {e}");
            None
        }
    }
}
