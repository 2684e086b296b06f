//! Message pumps: drain a session's inbound queue into its state tree.
//!
//! The foreground pump runs on the bootstrap thread for the visual session;
//! a background pump runs on its own thread for each headless session.
//! Ownership of the queue moves between them through the [`ConsumerLease`],
//! so at most one pump drains a session at any time.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, trace, warn};

use crate::net::{ConsumerLease, Envelope, ProtocolMessage};
use crate::session::{binding, SessionContext, SessionManager};
use crate::tree;

/// Why a pump returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Foreground only: the session was demoted and a background pump took over.
    Detached,
    /// Background only: the session was promoted and the foreground resumes it.
    Promoted,
    /// End of stream.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpRole {
    Foreground,
    Background,
}

/// Drain `lease` until a sentinel for `role` or end-of-stream.
///
/// Foreground apply errors are returned; background apply errors are logged
/// and skipped. A sentinel meant for the other role is ignored.
pub fn pump<F>(lease: &ConsumerLease, role: PumpRole, mut apply: F) -> Result<PumpExit>
where
    F: FnMut(&ProtocolMessage) -> Result<()>,
{
    let connection = lease.handle().connection_id();
    while let Some(envelope) = lease.next_message() {
        match envelope {
            Envelope::Protocol(msg) => match role {
                PumpRole::Foreground => {
                    apply(&msg).with_context(|| format!("failed to apply {}", msg.kind()))?
                }
                PumpRole::Background => {
                    if let Err(e) = apply(&msg) {
                        warn!(%connection, kind = msg.kind(), "Dropped message in headless session: {e:#}");
                    }
                }
            },
            Envelope::Detach if role == PumpRole::Foreground => return Ok(PumpExit::Detached),
            Envelope::Promoted if role == PumpRole::Background => return Ok(PumpExit::Promoted),
            stray => trace!(%connection, ?role, ?stray, "Ignoring sentinel"),
        }
    }
    Ok(PumpExit::Closed)
}

/// Pump the visual session on the calling thread.
///
/// Returns [`PumpExit::Detached`] once the session is demoted (a background
/// pump has been started for it) or [`PumpExit::Closed`] at end-of-stream.
/// On an apply error the session is cleaned up and the error returned.
pub fn run_foreground(manager: &SessionManager, ctx: &Arc<SessionContext>) -> Result<PumpExit> {
    let _binding = binding::bind(Arc::clone(ctx));
    let lease = ctx.handle().acquire_consumer();
    debug!(session_id = %ctx.id(), "Foreground pump attached");

    let result = pump(&lease, PumpRole::Foreground, |msg| {
        ctx.with_tree(|t| tree::apply_message(t, msg))
    });
    drop(lease);

    match result {
        Ok(PumpExit::Detached) => {
            debug!(session_id = %ctx.id(), "Foreground pump detached");
            spawn_background(manager, ctx)?;
            Ok(PumpExit::Detached)
        }
        Ok(exit) => {
            debug!(session_id = %ctx.id(), "Session stream ended in foreground");
            manager.end_session(ctx);
            Ok(exit)
        }
        Err(e) => {
            ctx.with_tree(|t| t.notify(&format!("Disconnected: {e:#}")));
            manager.end_session(ctx);
            Err(e.context(format!("session {} disconnected", ctx.display_name())))
        }
    }
}

/// Start a background pump thread for a headless session.
pub fn spawn_background(
    manager: &SessionManager,
    ctx: &Arc<SessionContext>,
) -> Result<JoinHandle<PumpExit>> {
    let manager = manager.clone();
    let ctx = Arc::clone(ctx);
    thread::Builder::new()
        .name(format!("pump-{}", ctx.id().short()))
        .spawn(move || run_background(&manager, &ctx))
        .context("failed to spawn background pump")
}

fn run_background(manager: &SessionManager, ctx: &Arc<SessionContext>) -> PumpExit {
    let _binding = binding::bind(Arc::clone(ctx));
    let lease = ctx.handle().acquire_consumer();
    debug!(session_id = %ctx.id(), "Background pump attached");

    let exit = pump(&lease, PumpRole::Background, |msg| {
        ctx.with_tree(|t| tree::apply_message(t, msg))
    })
    .unwrap_or(PumpExit::Closed);
    drop(lease);

    match exit {
        PumpExit::Closed => {
            debug!(session_id = %ctx.id(), "Session stream ended in background");
            manager.end_session(ctx);
        }
        _ => debug!(session_id = %ctx.id(), "Background pump released session"),
    }
    exit
}
