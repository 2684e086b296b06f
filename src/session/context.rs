//! One session's state: connection, state tree, and the Visual/Headless
//! lifecycle.
//!
//! Lock order: a context's `lifecycle` lock may be taken before its tree
//! lock, never the other way round. Tree mutation from any thread (pump,
//! tick loop, workers) goes through [`SessionContext::with_tree`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{binding, SessionId, SessionInfo, SessionMode, SessionStatus};
use crate::config::SessionSettings;
use crate::net::{Envelope, SessionHandle};
use crate::tree::{self, RenderTarget, SharedTree, StateTree};

pub struct SessionContext {
    id: SessionId,
    handle: SessionHandle,
    tree: SharedTree,
    settings: SessionSettings,
    info: Mutex<SessionInfo>,
    headless: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    /// Serializes promote/demote/close and owns the tick task while headless.
    lifecycle: Mutex<Option<Ticker>>,
    activity: Mutex<Activity>,
    workers: Mutex<Vec<RunningWorker>>,
    next_worker_id: AtomicU64,
}

#[derive(Debug, Clone)]
struct Activity {
    current_worker: Option<String>,
    last_activity: Instant,
}

struct RunningWorker {
    id: u64,
    name: String,
    cancel: CancellationToken,
    thread: thread::Thread,
}

impl SessionContext {
    /// New contexts start Visual; the manager demotes the ones that should not be.
    pub fn new(handle: SessionHandle, tree: SharedTree, settings: SessionSettings) -> Arc<Self> {
        let info = SessionInfo::new(handle.username().map(str::to_string));
        Arc::new(Self {
            id: SessionId::default(),
            handle,
            tree,
            settings,
            info: Mutex::new(info),
            headless: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
            activity: Mutex::new(Activity {
                current_worker: None,
                last_activity: Instant::now(),
            }),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn mode(&self) -> SessionMode {
        if self.is_headless() {
            SessionMode::Headless
        } else {
            SessionMode::Visual
        }
    }

    pub fn is_headless(&self) -> bool {
        self.headless.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.handle.is_closed()
    }

    /// The connection ended without this context being closed (e.g. the
    /// server dropped a duplicate login). Stops the tick loop on its next pass.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run `f` with the state tree locked.
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut dyn StateTree) -> R) -> R {
        let mut guard = tree::lock(&self.tree);
        f(&mut *guard)
    }

    /// Whether a headless tick task is currently attached.
    pub fn has_tick_task(&self) -> bool {
        self.lifecycle().is_some()
    }

    /// Switch to headless: wake the foreground pump with a `Detach`
    /// sentinel and start the fixed-rate tick loop. No-op when already
    /// headless.
    ///
    /// Never waits on the state tree, so the manager may call it with the
    /// registry locked. Does not touch the manager's active pointer; use
    /// [`SessionManager::demote_session`](super::SessionManager::demote_session)
    /// for the active context.
    pub fn demote_to_headless(self: &Arc<Self>) -> bool {
        let mut ticker = self.lifecycle();
        if self.headless.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.handle.inject(Envelope::Detach);

        if self.is_connected() && !self.is_closed() {
            match Ticker::start(Arc::clone(self)) {
                Ok(t) => *ticker = Some(t),
                Err(e) => error!(session_id = %self.id, "Failed to start headless tick loop: {e}"),
            }
        }
        info!(session_id = %self.id, "Session demoted to headless");
        true
    }

    /// Switch to visual: stop the tick loop (bounded wait), release the
    /// background pump with a `Promoted` sentinel and rebind the render
    /// target. No-op when already visual.
    pub fn promote_to_visual(&self, target: Option<&RenderTarget>) -> bool {
        match self.begin_promotion() {
            Some(promotion) => {
                promotion.finish(self, target);
                true
            }
            None => false,
        }
    }

    /// First half of [`promote_to_visual`](Self::promote_to_visual): flip
    /// the mode, signal the tick loop and hand the queue back. Never waits,
    /// so it may run under the registry lock; the returned [`Promotion`]
    /// does the waiting part once that lock is released.
    pub(crate) fn begin_promotion(&self) -> Option<Promotion> {
        let mut ticker = self.lifecycle();
        if !self.is_headless() {
            return None;
        }

        // The tick loop checks the token under the tree lock, so no tick
        // starts after this point even before the thread is joined.
        let ticker = ticker.take();
        if let Some(t) = &ticker {
            t.signal();
        }
        self.headless.store(false, Ordering::SeqCst);
        self.handle.inject(Envelope::Promoted);
        info!(session_id = %self.id, "Session promoted to visual");
        Some(Promotion { ticker })
    }

    /// Tear down: stop the tick loop and workers, close the connection
    /// (which unblocks any pump) and destroy the state tree. Idempotent.
    pub fn close(&self) {
        let ticker = {
            let mut lifecycle = self.lifecycle();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            lifecycle.take()
        };
        self.connected.store(false, Ordering::SeqCst);

        if let Some(t) = ticker {
            if !t.stop(self.settings.promote_timeout()) {
                warn!(session_id = %self.id, "Headless tick loop still running at close");
            }
        }
        self.stop_workers();
        self.handle.close();
        self.with_tree(|tree| tree.teardown());
        debug!(session_id = %self.id, "Session context closed");
    }

    pub fn info(&self) -> SessionInfo {
        lock_unpoisoned(&self.info).clone()
    }

    pub fn username(&self) -> Option<String> {
        lock_unpoisoned(&self.info).username.clone()
    }

    /// Cached character name, then the tree's, then the account, then the id.
    pub fn display_name(&self) -> String {
        let mut info = lock_unpoisoned(&self.info);
        if let Some(name) = info.character_name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        if let Some(name) = self.peek_tree(|t| t.character_name()).flatten() {
            if !name.is_empty() {
                info.character_name = Some(name.clone());
                return name;
            }
        }
        if let Some(name) = info.username.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        self.id.short()
    }

    /// Refresh character and world from the tree once the game UI exists.
    pub fn update_from_tree(&self) {
        let (character, world) = self.with_tree(|t| (t.character_name(), t.world()));
        let mut info = lock_unpoisoned(&self.info);
        if character.is_some() {
            info.character_name = character;
        }
        if world.is_some() {
            info.world = world;
        }
    }

    pub fn status(&self) -> SessionStatus {
        if !self.is_connected() {
            SessionStatus::Disconnected
        } else if self.peek_tree(|t| t.in_combat()).unwrap_or(false) {
            SessionStatus::Combat
        } else if self.is_running_worker() {
            SessionStatus::Bot
        } else if !self.is_headless() {
            SessionStatus::Active
        } else {
            SessionStatus::Idle
        }
    }

    /// Name of the worker that most recently started on this session.
    pub fn current_worker(&self) -> Option<String> {
        lock_unpoisoned(&self.activity).current_worker.clone()
    }

    pub fn set_current_worker(&self, name: Option<String>) {
        let mut activity = lock_unpoisoned(&self.activity);
        activity.current_worker = name;
        activity.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        lock_unpoisoned(&self.activity).last_activity
    }

    pub fn touch(&self) {
        lock_unpoisoned(&self.activity).last_activity = Instant::now();
    }

    pub fn running_workers(&self) -> Vec<String> {
        lock_unpoisoned(&self.workers)
            .iter()
            .map(|w| w.name.clone())
            .collect()
    }

    pub fn is_running_worker(&self) -> bool {
        !lock_unpoisoned(&self.workers).is_empty()
    }

    /// Interrupt every worker bound to this session.
    pub fn stop_workers(&self) {
        for worker in lock_unpoisoned(&self.workers).iter() {
            debug!(session_id = %self.id, worker = %worker.name, "Stopping worker");
            worker.cancel.cancel();
            worker.thread.unpark();
        }
    }

    /// Track a worker so [`stop_workers`](Self::stop_workers) and
    /// [`close`](Self::close) can reach it. On a closed context the worker
    /// is cancelled right away.
    pub(crate) fn register_worker(
        &self,
        name: &str,
        cancel: CancellationToken,
        thread: thread::Thread,
    ) -> u64 {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let mut workers = lock_unpoisoned(&self.workers);
        // `close` sets the flag before it takes this lock to stop workers.
        if self.is_closed() {
            debug!(session_id = %self.id, worker = name, "Worker started on closed session");
            cancel.cancel();
        }
        workers.push(RunningWorker {
            id,
            name: name.to_string(),
            cancel,
            thread,
        });
        id
    }

    pub(crate) fn unregister_worker(&self, id: u64) {
        lock_unpoisoned(&self.workers).retain(|w| w.id != id);
    }

    /// Read from the tree without waiting behind a long-running holder.
    fn peek_tree<R>(&self, f: impl FnOnce(&dyn StateTree) -> R) -> Option<R> {
        match self.tree.try_lock() {
            Ok(guard) => Some(f(&*guard)),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Some(f(&*poisoned.into_inner())),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<Ticker>> {
        lock_unpoisoned(&self.lifecycle)
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("mode", &self.mode())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The headless tick task of one context.
struct Ticker {
    cancel: CancellationToken,
    thread: JoinHandle<()>,
    /// Disconnects when the loop thread exits.
    exited: mpsc::Receiver<()>,
}

impl Ticker {
    fn start(ctx: Arc<SessionContext>) -> std::io::Result<Self> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (exited_tx, exited) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name(format!("headless-{}", ctx.id.short()))
            .spawn(move || {
                let _exited = exited_tx;
                run_headless_loop(&ctx, &token);
            })?;
        Ok(Self {
            cancel,
            thread,
            exited,
        })
    }

    /// Ask the loop to exit without waiting for it.
    fn signal(&self) {
        self.cancel.cancel();
        self.thread.thread().unpark();
    }

    /// Interrupt the loop and wait up to `timeout` for it to exit.
    /// Returns `false` if the thread had to be left running.
    fn stop(self, timeout: Duration) -> bool {
        self.signal();
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            _ => {
                let _ = self.thread.join();
                true
            }
        }
    }
}

/// A promotion whose tick loop may still be winding down.
#[must_use]
pub(crate) struct Promotion {
    ticker: Option<Ticker>,
}

impl Promotion {
    /// Wait (bounded) for the tick loop to exit, then rebind the render
    /// target. Takes the tree lock, so call it without the registry locked.
    pub(crate) fn finish(self, ctx: &SessionContext, target: Option<&RenderTarget>) {
        if let Some(t) = self.ticker {
            if !t.stop(ctx.settings.promote_timeout()) {
                warn!(
                    session_id = %ctx.id,
                    "Headless tick loop did not stop in time, continuing promotion"
                );
            }
        }
        if ctx.is_closed() || ctx.is_headless() {
            return;
        }
        if let Some(target) = target {
            ctx.with_tree(|tree| tree.bind_render_target(Some(target.clone())));
        }
    }
}

fn run_headless_loop(ctx: &Arc<SessionContext>, cancel: &CancellationToken) {
    let _binding = binding::bind(Arc::clone(ctx));
    let period = ctx.settings.tick_period();
    let mut last_tick = Instant::now();
    let mut next_tick = last_tick + period;
    debug!(session_id = %ctx.id, ?period, "Headless tick loop started");

    'ticking: while !cancel.is_cancelled() && ctx.is_headless() && ctx.is_connected() {
        {
            let mut tree = tree::lock(&ctx.tree);
            // A promotion may have completed while this thread waited for the lock.
            if cancel.is_cancelled() || !ctx.is_headless() {
                break;
            }
            let now = Instant::now();
            ctx.handle.keepalive();
            if let Err(e) = tree.tick(now - last_tick) {
                debug!(session_id = %ctx.id, "Headless tick failed: {e:#}");
            }
            last_tick = now;
        }
        ctx.touch();

        loop {
            if cancel.is_cancelled() {
                break 'ticking;
            }
            let now = Instant::now();
            if now >= next_tick {
                break;
            }
            thread::park_timeout(next_tick - now);
        }
        next_tick += period;
        let now = Instant::now();
        if now > next_tick + period {
            // Fell behind (e.g. a long tree lock); do not burst to catch up.
            next_tick = now + period;
        }
    }
    debug!(session_id = %ctx.id, "Headless tick loop exited");
}
