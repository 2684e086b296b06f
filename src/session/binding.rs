//! Per-thread "session this thread works on".
//!
//! Worker threads, background pumps and headless tick loops bind their
//! context here so code that asks for the current session keeps seeing the
//! session the thread was started for, whatever the user switches to in the
//! meantime. Prefer passing the context explicitly; the binding exists for
//! call paths that cannot take one.

use std::cell::RefCell;
use std::sync::Arc;

use super::SessionContext;

thread_local! {
    static BOUND: RefCell<Option<Arc<SessionContext>>> = const { RefCell::new(None) };
}

/// Bind `ctx` to the current thread until the guard drops.
///
/// Guards nest: dropping restores whatever was bound before.
pub fn bind(ctx: Arc<SessionContext>) -> BindingGuard {
    let previous = BOUND.with(|slot| slot.borrow_mut().replace(ctx));
    BindingGuard { previous }
}

/// Context bound to the current thread, if any.
pub fn current() -> Option<Arc<SessionContext>> {
    BOUND.with(|slot| slot.borrow().clone())
}

pub fn is_bound() -> bool {
    BOUND.with(|slot| slot.borrow().is_some())
}

#[must_use = "the binding is removed when the guard is dropped"]
pub struct BindingGuard {
    previous: Option<Arc<SessionContext>>,
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BOUND.with(|slot| *slot.borrow_mut() = previous);
    }
}
