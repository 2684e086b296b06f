//! Foreground loop: resume a switched-to session or log in a new one, then
//! pump it until it is demoted or ends.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::net::SessionHandle;
use crate::pump::{self, PumpExit};
use crate::session::{SessionContext, SessionManager};
use crate::tree::SharedTree;

/// A freshly authenticated connection and the tree it will drive.
pub struct Login {
    pub handle: SessionHandle,
    pub tree: SharedTree,
}

pub enum LoginOutcome {
    LoggedIn(Login),
    /// Login was abandoned, e.g. because a switch became pending.
    Aborted,
    Quit,
}

/// Login/character-selection collaborator of the foreground loop.
pub trait LoginFlow: Send {
    /// Produce the next session to run in the foreground. Implementations
    /// should return [`LoginOutcome::Aborted`] promptly once
    /// [`SessionManager::has_pending_switch`] turns true.
    fn login(&mut self, manager: &SessionManager) -> Result<LoginOutcome>;
}

/// Result of the entry hook.
#[derive(Debug)]
pub enum Entry {
    /// Pump this existing context, skipping login.
    Resume(Arc<SessionContext>),
    Login,
}

/// Pause before asking the login flow again after it failed.
const LOGIN_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct Bootstrap {
    manager: SessionManager,
    shutdown: CancellationToken,
}

impl Bootstrap {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Cancel to make [`run`](Self::run) return after the current session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Entry hook, called each time the foreground loop comes back around.
    pub fn enter(&self) -> Entry {
        if let Some(closed) = self.manager.process_pending_close() {
            debug!(session_id = %closed.id(), "Completed deferred close");
        }
        match self.manager.consume_pending_switch_to() {
            Some(ctx) => {
                let target = self.manager.render_target();
                ctx.promote_to_visual(target.as_ref());
                self.manager.apply_pending_camera(&ctx);
                ctx.update_from_tree();
                Entry::Resume(ctx)
            }
            None => Entry::Login,
        }
    }

    /// Run the foreground loop until `login` quits or shutdown is requested.
    pub fn run(&self, login: &mut dyn LoginFlow) -> Result<()> {
        info!("Foreground loop started");
        while !self.shutdown.is_cancelled() {
            let ctx = match self.enter() {
                Entry::Resume(ctx) => {
                    debug!(session_id = %ctx.id(), "Resuming session in foreground");
                    ctx
                }
                Entry::Login => match login.login(&self.manager) {
                    Ok(LoginOutcome::LoggedIn(Login { handle, tree })) => {
                        let ctx = self.manager.register_login(handle, tree);
                        if let Some(target) = self.manager.render_target() {
                            ctx.with_tree(|t| t.bind_render_target(Some(target)));
                        }
                        ctx
                    }
                    Ok(LoginOutcome::Aborted) => continue,
                    Ok(LoginOutcome::Quit) => break,
                    Err(e) => {
                        warn!("Login failed: {e:#}");
                        thread::sleep(LOGIN_RETRY_DELAY);
                        continue;
                    }
                },
            };

            match pump::run_foreground(&self.manager, &ctx) {
                Ok(PumpExit::Detached) => {}
                Ok(exit) => debug!(session_id = %ctx.id(), ?exit, "Foreground session ended"),
                Err(e) => error!(session_id = %ctx.id(), "Foreground session failed: {e:#}"),
            }
        }
        info!("Foreground loop stopped");
        Ok(())
    }
}
