//! Registry of all session contexts and the single active one.
//!
//! Every operation does its bookkeeping under one registry lock and collects
//! follow-up effects (listener events, contexts to tear down, background
//! pumps to start, promotions to finish) that run after the lock is
//! released. No state tree is locked while the registry is held: a thread
//! inside a tree may call back into the manager.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use super::context::Promotion;
use super::{binding, SessionContext, SessionId};
use crate::config::SessionSettings;
use crate::net::SessionHandle;
use crate::pump;
use crate::tree::{CameraState, RenderTarget, SharedTree};

/// Observer of registry changes. Called after the registry is consistent,
/// never with the registry lock held, so callbacks may call back into the
/// manager.
pub trait SessionListener: Send + Sync {
    fn on_active_session_changed(
        &self,
        _old: Option<&Arc<SessionContext>>,
        _new: Option<&Arc<SessionContext>>,
    ) {
    }

    fn on_session_added(&self, _ctx: &Arc<SessionContext>) {}

    fn on_session_removed(&self, _ctx: &Arc<SessionContext>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Cloneable handle to the shared registry.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Mutex<Registry>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn SessionListener>)>>,
    next_listener_id: AtomicU64,
    settings: SessionSettings,
}

#[derive(Default)]
struct Registry {
    /// Registration order.
    order: Vec<Arc<SessionContext>>,
    active: Option<Arc<SessionContext>>,
    pending_switch: Option<Arc<SessionContext>>,
    pending_close: Option<SessionId>,
    pending_camera: Option<CameraState>,
    render_target: Option<RenderTarget>,
}

impl Registry {
    fn position(&self, id: SessionId) -> Option<usize> {
        self.order.iter().position(|c| c.id() == id)
    }

    fn is_active(&self, id: SessionId) -> bool {
        self.active.as_ref().is_some_and(|a| a.id() == id)
    }

    fn active_position(&self) -> Option<usize> {
        self.active.as_ref().and_then(|a| self.position(a.id()))
    }

    fn is_pending_switch(&self, ctx: &Arc<SessionContext>) -> bool {
        self.pending_switch
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, ctx))
    }
}

enum Event {
    ActiveChanged {
        old: Option<Arc<SessionContext>>,
        new: Option<Arc<SessionContext>>,
    },
    Added(Arc<SessionContext>),
    Removed(Arc<SessionContext>),
}

impl Event {
    fn dispatch(&self, listener: &dyn SessionListener) {
        match self {
            Event::ActiveChanged { old, new } => {
                listener.on_active_session_changed(old.as_ref(), new.as_ref())
            }
            Event::Added(ctx) => listener.on_session_added(ctx),
            Event::Removed(ctx) => listener.on_session_removed(ctx),
        }
    }
}

/// Work deferred until the registry lock is released.
#[derive(Default)]
struct Effects {
    events: Vec<Event>,
    close: Vec<Arc<SessionContext>>,
    background: Vec<Arc<SessionContext>>,
    promotions: Vec<(Arc<SessionContext>, Promotion)>,
    render_target: Option<RenderTarget>,
}

impl Effects {
    fn promote(&mut self, reg: &Registry, ctx: &Arc<SessionContext>) {
        if let Some(promotion) = ctx.begin_promotion() {
            self.render_target = reg.render_target.clone();
            self.promotions.push((Arc::clone(ctx), promotion));
        }
    }
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed));
        lock_unpoisoned(&self.shared.listeners).push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock_unpoisoned(&self.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Register a session. Becomes active when nothing is active (and is
    /// queued for the foreground loop to resume); otherwise starts headless
    /// with its own background pump.
    pub fn add_session(&self, handle: SessionHandle, tree: SharedTree) -> Arc<SessionContext> {
        let ctx = SessionContext::new(handle, tree, self.shared.settings.clone());
        let mut fx = Effects::default();
        {
            let mut reg = self.lock();
            reg.order.push(Arc::clone(&ctx));
            fx.events.push(Event::Added(Arc::clone(&ctx)));
            if reg.active.is_none() {
                reg.active = Some(Arc::clone(&ctx));
                reg.pending_switch = Some(Arc::clone(&ctx));
                fx.events.push(Event::ActiveChanged {
                    old: None,
                    new: Some(Arc::clone(&ctx)),
                });
            } else {
                ctx.demote_to_headless();
                fx.background.push(Arc::clone(&ctx));
            }
        }
        info!(session_id = %ctx.id(), mode = %ctx.mode(), "Session added");
        self.apply(fx);
        ctx
    }

    /// Register a fresh login that takes over the foreground. The previous
    /// active context is demoted. The caller pumps the new context itself.
    pub fn add_session_as_active(
        &self,
        handle: SessionHandle,
        tree: SharedTree,
    ) -> Arc<SessionContext> {
        let ctx = SessionContext::new(handle, tree, self.shared.settings.clone());
        let mut fx = Effects::default();
        {
            let mut reg = self.lock();
            let old = reg.active.take();
            if let Some(old) = &old {
                Self::demote_locked(&mut reg, old, &mut fx);
            }
            reg.order.push(Arc::clone(&ctx));
            reg.active = Some(Arc::clone(&ctx));
            fx.events.push(Event::Added(Arc::clone(&ctx)));
            fx.events.push(Event::ActiveChanged {
                old,
                new: Some(Arc::clone(&ctx)),
            });
        }
        info!(session_id = %ctx.id(), "Session added as active");
        self.apply(fx);
        ctx
    }

    /// Register a login, first dropping a stale context of the same account.
    ///
    /// The server has already terminated the stale connection, so it is
    /// discarded without close teardown.
    pub fn register_login(&self, handle: SessionHandle, tree: SharedTree) -> Arc<SessionContext> {
        if let Some(username) = handle.username() {
            if let Some(stale) = self.find_by_username(username) {
                warn!(
                    session_id = %stale.id(),
                    username,
                    "Duplicate login, discarding stale session"
                );
                self.remove_session_silently(stale.id());
            }
        }
        self.add_session_as_active(handle, tree)
    }

    /// Make `id` the active session. No-op when it is unknown or already
    /// active. The target is promoted here and queued for the foreground
    /// loop; the old active context is demoted.
    pub fn switch_to_session(&self, id: SessionId) -> bool {
        let camera = self.capture_active_camera();
        let mut fx = Effects::default();
        {
            let mut reg = self.lock();
            let Some(pos) = reg.position(id) else {
                debug!(session_id = %id, "Switch to unknown session ignored");
                return false;
            };
            if reg.is_active(id) {
                return false;
            }
            let target = Arc::clone(&reg.order[pos]);
            let old = reg.active.take();

            if let Some(old) = &old {
                if let Some((from, camera)) = camera {
                    if from == old.id() {
                        reg.pending_camera = camera;
                    }
                }
                Self::demote_locked(&mut reg, old, &mut fx);
            }

            reg.pending_switch = Some(Arc::clone(&target));
            fx.promote(&reg, &target);
            reg.active = Some(Arc::clone(&target));
            info!(
                from = ?old.as_ref().map(|c| c.id().short()),
                to = %target.id().short(),
                "Switched active session"
            );
            fx.events.push(Event::ActiveChanged {
                old,
                new: Some(target),
            });
        }
        self.apply(fx);
        true
    }

    pub fn switch_to_next(&self) -> bool {
        self.switch_relative(1)
    }

    pub fn switch_to_previous(&self) -> bool {
        self.switch_relative(-1)
    }

    /// Switch to the session at `index` in registration order.
    pub fn switch_by_index(&self, index: usize) -> bool {
        let target = self.lock().order.get(index).map(|c| c.id());
        match target {
            Some(id) => self.switch_to_session(id),
            None => false,
        }
    }

    fn switch_relative(&self, step: isize) -> bool {
        let target = {
            let reg = self.lock();
            let len = reg.order.len();
            if len == 0 {
                return false;
            }
            let next = match reg.active_position() {
                Some(pos) => (pos as isize + step).rem_euclid(len as isize) as usize,
                None if step < 0 => len - 1,
                None => 0,
            };
            reg.order[next].id()
        };
        self.switch_to_session(target)
    }

    /// Remove `id` and close its resources. When it was active, the next
    /// session in order (if any) becomes active.
    pub fn remove_session(&self, id: SessionId) -> Option<Arc<SessionContext>> {
        let camera = self.capture_active_camera();
        let mut fx = Effects::default();
        let removed = {
            let mut reg = self.lock();
            let pos = reg.position(id)?;
            let ctx = reg.order.remove(pos);
            if reg.is_pending_switch(&ctx) {
                reg.pending_switch = None;
            }
            if reg.pending_close == Some(id) {
                reg.pending_close = None;
            }

            if reg.is_active(id) {
                reg.active = None;
                if let Some((from, camera)) = camera {
                    if from == id {
                        reg.pending_camera = camera;
                    }
                }
                let successor = reg.order.get(pos).or_else(|| reg.order.last()).cloned();
                if let Some(next) = &successor {
                    fx.promote(&reg, next);
                    reg.active = Some(Arc::clone(next));
                    reg.pending_switch = Some(Arc::clone(next));
                }
                fx.events.push(Event::ActiveChanged {
                    old: Some(Arc::clone(&ctx)),
                    new: successor,
                });
            }
            fx.events.push(Event::Removed(Arc::clone(&ctx)));
            fx.close.push(Arc::clone(&ctx));
            ctx
        };
        info!(session_id = %id, "Session removed");
        self.apply(fx);
        Some(removed)
    }

    /// Drop `id` from the registry without closing it. Used for connections
    /// the server already terminated.
    pub fn remove_session_silently(&self, id: SessionId) -> Option<Arc<SessionContext>> {
        let mut fx = Effects::default();
        let removed = {
            let mut reg = self.lock();
            let pos = reg.position(id)?;
            let ctx = reg.order.remove(pos);
            if reg.is_pending_switch(&ctx) {
                reg.pending_switch = None;
            }
            if reg.pending_close == Some(id) {
                reg.pending_close = None;
            }
            if reg.is_active(id) {
                reg.active = None;
                fx.events.push(Event::ActiveChanged {
                    old: Some(Arc::clone(&ctx)),
                    new: None,
                });
            }
            fx.events.push(Event::Removed(Arc::clone(&ctx)));
            ctx
        };
        removed.mark_disconnected();
        debug!(session_id = %id, "Session removed without teardown");
        self.apply(fx);
        Some(removed)
    }

    /// Close `id`. Closing the active session while others exist switches
    /// away first and defers the close to [`process_pending_close`](Self::process_pending_close).
    pub fn request_close_session(&self, id: SessionId) {
        let successor = {
            let mut reg = self.lock();
            match reg.position(id) {
                Some(pos) if reg.is_active(id) && reg.order.len() > 1 => {
                    reg.pending_close = Some(id);
                    let next = (pos + 1) % reg.order.len();
                    Some(reg.order[next].id())
                }
                Some(_) => None,
                None => return,
            }
        };

        match successor {
            Some(next) => {
                debug!(session_id = %id, "Deferring close until switch completes");
                self.switch_to_session(next);
            }
            None => {
                self.remove_session(id);
            }
        }
    }

    /// Complete a deferred close. Called by the foreground loop once the
    /// switch away from the closing session has taken effect.
    pub fn process_pending_close(&self) -> Option<Arc<SessionContext>> {
        let id = self.lock().pending_close.take()?;
        self.remove_session(id)
    }

    pub fn has_pending_close(&self) -> bool {
        self.lock().pending_close.is_some()
    }

    /// Read and clear the pending switch target.
    pub fn consume_pending_switch_to(&self) -> Option<Arc<SessionContext>> {
        self.lock().pending_switch.take()
    }

    pub fn has_pending_switch(&self) -> bool {
        self.lock().pending_switch.is_some()
    }

    /// Demote `id` without choosing a successor, leaving nothing active so
    /// the foreground loop falls back to login.
    pub fn demote_session(&self, id: SessionId) -> bool {
        let mut fx = Effects::default();
        let demoted = {
            let mut reg = self.lock();
            let Some(pos) = reg.position(id) else {
                return false;
            };
            let ctx = Arc::clone(&reg.order[pos]);
            if reg.is_active(id) {
                reg.active = None;
                fx.events.push(Event::ActiveChanged {
                    old: Some(Arc::clone(&ctx)),
                    new: None,
                });
            }
            Self::demote_locked(&mut reg, &ctx, &mut fx)
        };
        self.apply(fx);
        demoted
    }

    /// Carry the camera captured at the last switch over to `ctx`.
    pub fn apply_pending_camera(&self, ctx: &SessionContext) -> bool {
        if !self.shared.settings.sync_camera {
            return false;
        }
        let Some(camera) = self.lock().pending_camera.take() else {
            return false;
        };
        ctx.with_tree(|t| t.apply_camera(&camera));
        true
    }

    pub fn set_render_target(&self, target: Option<RenderTarget>) {
        self.lock().render_target = target;
    }

    pub fn render_target(&self) -> Option<RenderTarget> {
        self.lock().render_target.clone()
    }

    /// Called by a pump that saw end-of-stream. The first caller removes
    /// and closes the session; later callers only mark it disconnected.
    pub fn end_session(&self, ctx: &Arc<SessionContext>) {
        if ctx.is_closed() {
            return;
        }
        if self.contains(ctx.id()) {
            ctx.with_tree(|t| t.notify("Connection lost"));
            self.remove_session(ctx.id());
        } else {
            ctx.mark_disconnected();
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionContext>> {
        let reg = self.lock();
        reg.position(id).map(|pos| Arc::clone(&reg.order[pos]))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().position(id).is_some()
    }

    /// Snapshot in registration order.
    pub fn sessions(&self) -> Vec<Arc<SessionContext>> {
        self.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    pub fn index_of(&self, id: SessionId) -> Option<usize> {
        self.lock().position(id)
    }

    pub fn find_by_username(&self, username: &str) -> Option<Arc<SessionContext>> {
        self.lock()
            .order
            .iter()
            .find(|c| c.username().as_deref() == Some(username))
            .cloned()
    }

    pub fn find_by_connection(&self, handle: &SessionHandle) -> Option<Arc<SessionContext>> {
        self.lock()
            .order
            .iter()
            .find(|c| c.handle().same_connection(handle))
            .cloned()
    }

    pub fn active(&self) -> Option<Arc<SessionContext>> {
        self.lock().active.clone()
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.lock().active.as_ref().map(|c| c.id())
    }

    pub fn active_tree(&self) -> Option<SharedTree> {
        self.lock().active.as_ref().map(|c| Arc::clone(c.tree()))
    }

    /// The session the calling thread works on: its binding if it has one,
    /// otherwise the active session.
    pub fn current(&self) -> Option<Arc<SessionContext>> {
        binding::current().or_else(|| self.active())
    }

    /// Number of registered contexts in visual mode. Always equals
    /// `active().is_some() as usize` between operations.
    pub fn visual_count(&self) -> usize {
        self.lock()
            .order
            .iter()
            .filter(|c| !c.is_headless())
            .count()
    }

    /// Remove and close every session.
    pub fn close_all(&self) {
        let mut fx = Effects::default();
        {
            let mut reg = self.lock();
            let old = reg.active.take();
            reg.pending_switch = None;
            reg.pending_close = None;
            reg.pending_camera = None;
            if old.is_some() {
                fx.events.push(Event::ActiveChanged { old, new: None });
            }
            for ctx in reg.order.drain(..) {
                fx.events.push(Event::Removed(Arc::clone(&ctx)));
                fx.close.push(ctx);
            }
        }
        if !fx.close.is_empty() {
            info!(count = fx.close.len(), "Closing all sessions");
        }
        self.apply(fx);
    }

    /// Demote a context that is leaving the foreground. When it was queued
    /// for the foreground loop but never resumed, no foreground pump will
    /// see its `Detach`, so a background pump takes over instead.
    fn demote_locked(reg: &mut Registry, ctx: &Arc<SessionContext>, fx: &mut Effects) -> bool {
        let demoted = ctx.demote_to_headless();
        if demoted && reg.is_pending_switch(ctx) {
            reg.pending_switch = None;
            fx.background.push(Arc::clone(ctx));
        }
        demoted
    }

    /// Camera of the active session, read before the registry is locked.
    fn capture_active_camera(&self) -> Option<(SessionId, Option<CameraState>)> {
        if !self.shared.settings.sync_camera {
            return None;
        }
        let active = self.active()?;
        let camera = active.with_tree(|t| t.capture_camera());
        Some((active.id(), camera))
    }

    fn apply(&self, fx: Effects) {
        for (ctx, promotion) in fx.promotions {
            promotion.finish(&ctx, fx.render_target.as_ref());
        }
        for ctx in fx.background {
            if let Err(e) = pump::spawn_background(self, &ctx) {
                error!(session_id = %ctx.id(), "Failed to start background pump: {e:#}");
            }
        }
        for ctx in &fx.close {
            ctx.close();
        }
        self.notify(fx.events);
    }

    fn notify(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn SessionListener>> = lock_unpoisoned(&self.shared.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for event in &events {
            for listener in &listeners {
                let result = panic::catch_unwind(AssertUnwindSafe(|| event.dispatch(&**listener)));
                if result.is_err() {
                    warn!("Session listener panicked");
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        lock_unpoisoned(&self.shared.registry)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionMode;
    use crate::sim::SimTree;
    use std::time::Duration;

    fn settings() -> SessionSettings {
        SessionSettings {
            tick_rate_hz: 200.0,
            promote_timeout_ms: 500,
            sync_camera: true,
        }
    }

    fn add(manager: &SessionManager, name: &str) -> Arc<SessionContext> {
        manager.add_session(
            SessionHandle::new(Some(name.to_string())),
            SimTree::shared(name).1,
        )
    }

    fn assert_invariant(manager: &SessionManager) {
        let expected = usize::from(manager.active().is_some());
        assert_eq!(manager.visual_count(), expected);
        if let Some(active) = manager.active() {
            assert_eq!(active.mode(), SessionMode::Visual);
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl SessionListener for Recorder {
        fn on_active_session_changed(
            &self,
            old: Option<&Arc<SessionContext>>,
            new: Option<&Arc<SessionContext>>,
        ) {
            let name = |c: Option<&Arc<SessionContext>>| {
                c.map(|c| c.display_name()).unwrap_or_else(|| "-".into())
            };
            self.events
                .lock()
                .unwrap()
                .push(format!("active {} -> {}", name(old), name(new)));
        }

        fn on_session_added(&self, ctx: &Arc<SessionContext>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("added {}", ctx.display_name()));
        }

        fn on_session_removed(&self, ctx: &Arc<SessionContext>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("removed {}", ctx.display_name()));
        }
    }

    #[test]
    fn first_session_is_active_rest_headless() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        assert_eq!(manager.active_id(), Some(a.id()));
        assert_eq!(a.mode(), SessionMode::Visual);
        assert_eq!(b.mode(), SessionMode::Headless);
        assert!(b.has_tick_task());
        assert_eq!(manager.len(), 2);
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn first_session_is_queued_for_foreground() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let pending = manager.consume_pending_switch_to().unwrap();
        assert!(Arc::ptr_eq(&pending, &a));
        assert!(manager.consume_pending_switch_to().is_none());
        manager.close_all();
    }

    #[test]
    fn add_as_active_demotes_previous() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        manager.consume_pending_switch_to();
        let b = manager.add_session_as_active(
            SessionHandle::new(Some("bob".into())),
            SimTree::shared("bob").1,
        );
        assert_eq!(manager.active_id(), Some(b.id()));
        assert_eq!(a.mode(), SessionMode::Headless);
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn switch_swaps_modes_and_queues_target() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        manager.consume_pending_switch_to();

        assert!(manager.switch_to_session(b.id()));
        assert_eq!(a.mode(), SessionMode::Headless);
        assert!(a.has_tick_task());
        assert_eq!(b.mode(), SessionMode::Visual);
        assert!(!b.has_tick_task());
        assert!(Arc::ptr_eq(&manager.consume_pending_switch_to().unwrap(), &b));
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn switch_to_active_or_unknown_is_noop() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        manager.consume_pending_switch_to();
        assert!(!manager.switch_to_session(a.id()));
        assert!(!manager.switch_to_session(SessionId::default()));
        assert!(!manager.has_pending_switch());
        manager.close_all();
    }

    #[test]
    fn next_previous_and_index_wrap() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        let c = add(&manager, "carol");

        manager.switch_to_next();
        assert_eq!(manager.active_id(), Some(b.id()));
        manager.switch_to_next();
        manager.switch_to_next();
        assert_eq!(manager.active_id(), Some(a.id()));
        manager.switch_to_previous();
        assert_eq!(manager.active_id(), Some(c.id()));
        assert!(manager.switch_by_index(1));
        assert_eq!(manager.active_id(), Some(b.id()));
        assert!(!manager.switch_by_index(7));
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn remove_active_promotes_next() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        manager.consume_pending_switch_to();

        let removed = manager.remove_session(a.id()).unwrap();
        assert!(removed.is_closed());
        assert!(!removed.has_tick_task());
        assert_eq!(manager.active_id(), Some(b.id()));
        assert_eq!(b.mode(), SessionMode::Visual);
        assert!(Arc::ptr_eq(&manager.consume_pending_switch_to().unwrap(), &b));
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn remove_last_session_clears_active() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        manager.remove_session(a.id());
        assert!(manager.active().is_none());
        assert!(manager.is_empty());
        assert!(!manager.has_pending_switch());
        assert!(a.handle().is_closed());
        assert!(manager.remove_session(a.id()).is_none());
    }

    #[test]
    fn request_close_active_switches_then_closes() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        manager.consume_pending_switch_to();

        manager.request_close_session(a.id());
        assert_eq!(manager.active_id(), Some(b.id()));
        assert_eq!(a.mode(), SessionMode::Headless);
        assert!(!a.is_closed());
        assert!(manager.has_pending_close());

        let closed = manager.process_pending_close().unwrap();
        assert!(Arc::ptr_eq(&closed, &a));
        assert!(a.is_closed());
        assert!(!a.has_tick_task());
        assert!(a.handle().is_closed());
        assert_eq!(manager.len(), 1);
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn request_close_headless_closes_immediately() {
        let manager = SessionManager::new(settings());
        let _a = add(&manager, "alice");
        let b = add(&manager, "bob");
        manager.request_close_session(b.id());
        assert!(b.is_closed());
        assert!(!manager.has_pending_close());
        assert_eq!(manager.len(), 1);
        manager.close_all();
    }

    #[test]
    fn register_login_discards_stale_duplicate() {
        let manager = SessionManager::new(settings());
        let stale = add(&manager, "alice");
        let fresh = manager.register_login(
            SessionHandle::new(Some("alice".into())),
            SimTree::shared("alice").1,
        );
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.active_id(), Some(fresh.id()));
        assert!(!stale.is_connected());
        assert!(!stale.is_closed());
        manager.close_all();
    }

    #[test]
    fn demote_session_leaves_nothing_active() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        assert!(manager.demote_session(a.id()));
        assert!(manager.active().is_none());
        assert_eq!(a.mode(), SessionMode::Headless);
        assert!(!manager.has_pending_switch());
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn camera_follows_switch() {
        let manager = SessionManager::new(settings());
        let (sim_a, tree_a) = SimTree::shared("alice");
        let (sim_b, tree_b) = SimTree::shared("bob");
        manager.add_session(SessionHandle::new(Some("alice".into())), tree_a);
        let b = manager.add_session(SessionHandle::new(Some("bob".into())), tree_b);
        let camera = CameraState {
            kind: "free".into(),
            zoom: 2.0,
            rotation: 0.5,
            position: Some([1.0, 2.0, 3.0]),
        };
        sim_a.lock().unwrap().set_camera(camera.clone());

        manager.switch_to_session(b.id());
        assert!(manager.apply_pending_camera(&b));
        assert_eq!(sim_b.lock().unwrap().camera(), Some(&camera));
        assert!(!manager.apply_pending_camera(&b));
        manager.close_all();
    }

    #[test]
    fn listeners_see_consistent_state() {
        let manager = SessionManager::new(settings());
        let recorder = Arc::new(Recorder::default());
        manager.add_listener(recorder.clone());

        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        manager.switch_to_session(b.id());
        manager.remove_session(a.id());
        assert_eq!(
            recorder.take(),
            vec![
                "added alice",
                "active - -> alice",
                "added bob",
                "active alice -> bob",
                "removed alice",
            ]
        );
        manager.close_all();
    }

    #[test]
    fn listener_may_reenter_manager() {
        struct Reentrant(SessionManager);
        impl SessionListener for Reentrant {
            fn on_session_added(&self, _ctx: &Arc<SessionContext>) {
                let _ = self.0.len();
                let _ = self.0.active();
            }
        }
        let manager = SessionManager::new(settings());
        manager.add_listener(Arc::new(Reentrant(manager.clone())));
        add(&manager, "alice");
        assert_eq!(manager.len(), 1);
        manager.close_all();
    }

    #[test]
    fn panicking_listener_does_not_break_registry() {
        struct Boom;
        impl SessionListener for Boom {
            fn on_session_added(&self, _ctx: &Arc<SessionContext>) {
                panic!("listener failure");
            }
        }
        let manager = SessionManager::new(settings());
        let id = manager.add_listener(Arc::new(Boom));
        add(&manager, "alice");
        assert_eq!(manager.len(), 1);
        assert!(manager.remove_listener(id));
        assert!(!manager.remove_listener(id));
        manager.close_all();
    }

    #[test]
    fn lookups() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        assert!(Arc::ptr_eq(&manager.get(b.id()).unwrap(), &b));
        assert!(Arc::ptr_eq(&manager.find_by_username("alice").unwrap(), &a));
        assert!(Arc::ptr_eq(&manager.find_by_connection(b.handle()).unwrap(), &b));
        assert_eq!(manager.index_of(b.id()), Some(1));
        assert!(manager.find_by_username("carol").is_none());
        let ids: Vec<_> = manager.sessions().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
        manager.close_all();
        assert!(manager.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }

    #[test]
    fn current_prefers_thread_binding() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        assert_eq!(manager.current().map(|c| c.id()), Some(a.id()));
        {
            let _guard = binding::bind(Arc::clone(&b));
            assert_eq!(manager.current().map(|c| c.id()), Some(b.id()));
        }
        manager.close_all();
    }

    #[test]
    fn end_session_is_idempotent() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        manager.end_session(&a);
        manager.end_session(&a);
        assert!(a.is_closed());
        assert_eq!(manager.active_id(), Some(b.id()));
        assert_eq!(manager.len(), 1);
        manager.close_all();
    }

    #[test]
    fn headless_session_keeps_ticking_after_add() {
        let manager = SessionManager::new(settings());
        add(&manager, "alice");
        let (sim, tree) = SimTree::shared("bob");
        manager.add_session(SessionHandle::new(Some("bob".into())), tree);
        std::thread::sleep(Duration::from_millis(50));
        assert!(sim.lock().unwrap().ticks() > 0);
        manager.close_all();
    }

    /// Hold `ctx`'s tree on one thread and call back into the manager from
    /// inside it, while `op` runs on another. Fails if `op` cannot finish.
    fn run_while_tree_held(
        manager: &SessionManager,
        ctx: &Arc<SessionContext>,
        op: impl FnOnce(&SessionManager) + Send + 'static,
    ) {
        use std::sync::mpsc;
        use std::thread;

        let (entered_tx, entered) = mpsc::channel();
        let holder = {
            let manager = manager.clone();
            let ctx = Arc::clone(ctx);
            thread::spawn(move || {
                ctx.with_tree(|_| {
                    entered_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(100));
                    manager.len()
                })
            })
        };
        entered.recv().unwrap();

        let (done_tx, done) = mpsc::channel();
        let worker = {
            let manager = manager.clone();
            thread::spawn(move || {
                op(&manager);
                done_tx.send(()).unwrap();
            })
        };
        done.recv_timeout(Duration::from_secs(3))
            .expect("registry operation blocked behind a tree holder");
        assert!(holder.join().unwrap() > 0);
        worker.join().unwrap();
    }

    #[test]
    fn switch_does_not_lock_old_tree_under_registry() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        let target = b.id();
        run_while_tree_held(&manager, &a, move |m| {
            assert!(m.switch_to_session(target));
        });
        assert_eq!(manager.active_id(), Some(b.id()));
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn switch_does_not_wait_on_target_tree_under_registry() {
        let manager = SessionManager::new(settings());
        manager.set_render_target(Some(RenderTarget::new("screen")));
        let a = add(&manager, "alice");
        let (sim_b, tree_b) = SimTree::shared("bob");
        let b = manager.add_session(SessionHandle::new(Some("bob".into())), tree_b);
        let target = b.id();
        run_while_tree_held(&manager, &b, move |m| {
            assert!(m.switch_to_session(target));
        });
        assert_eq!(a.mode(), SessionMode::Headless);
        assert!(!b.has_tick_task());
        assert_eq!(
            sim_b.lock().unwrap().render_target(),
            Some(&RenderTarget::new("screen"))
        );
        assert_invariant(&manager);
        manager.close_all();
    }

    #[test]
    fn remove_does_not_lock_trees_under_registry() {
        let manager = SessionManager::new(settings());
        let a = add(&manager, "alice");
        let b = add(&manager, "bob");
        let removed = a.id();
        run_while_tree_held(&manager, &a, move |m| {
            m.remove_session(removed);
        });
        assert!(a.is_closed());
        assert_eq!(manager.active_id(), Some(b.id()));
        assert_invariant(&manager);
        manager.close_all();
    }
}
