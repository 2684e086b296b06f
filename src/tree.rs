//! The UI/state tree a session drives.
//!
//! The tree itself (widgets, rendering, game state) lives outside this crate;
//! the session machinery only needs the entry points below. Every call must
//! happen with the owning context's lock held, which [`SharedTree`] makes
//! explicit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::net::{ProtocolMessage, WidgetId};

/// Where a visual session draws. Rebound on every promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub name: String,
}

impl RenderTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Camera placement carried across a session switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    /// Camera implementation name, e.g. `"follow"` or `"free"`.
    pub kind: String,
    pub zoom: f32,
    pub rotation: f32,
    /// Only free cameras carry a position.
    pub position: Option<[f32; 3]>,
}

pub trait StateTree: Send {
    fn new_widget(
        &mut self,
        id: WidgetId,
        kind: &str,
        parent: WidgetId,
        pargs: &[Value],
        cargs: &[Value],
    ) -> Result<()>;

    fn widget_message(&mut self, id: WidgetId, name: &str, args: &[Value]) -> Result<()>;

    fn add_widget(&mut self, id: WidgetId, parent: WidgetId, pargs: &[Value]) -> Result<()>;

    fn destroy_widget(&mut self, id: WidgetId) -> Result<()>;

    fn barrier(&mut self, deps: &[WidgetId], bars: &[WidgetId]) -> Result<()>;

    /// Advance time-based state by `dt`.
    fn tick(&mut self, dt: Duration) -> Result<()>;

    fn bind_render_target(&mut self, _target: Option<RenderTarget>) {}

    /// Show a line of text to whoever looks at this session.
    fn notify(&mut self, _text: &str) {}

    fn character_name(&self) -> Option<String> {
        None
    }

    fn world(&self) -> Option<String> {
        None
    }

    fn in_combat(&self) -> bool {
        false
    }

    fn capture_camera(&self) -> Option<CameraState> {
        None
    }

    fn apply_camera(&mut self, _state: &CameraState) {}

    /// A few lines describing the current state, for the session view.
    fn status_lines(&self) -> Vec<String> {
        Vec::new()
    }

    /// Release everything; the tree is not used afterwards.
    fn teardown(&mut self) {}
}

/// A state tree behind its context's mutual-exclusion boundary.
pub type SharedTree = Arc<Mutex<dyn StateTree>>;

pub fn shared<T: StateTree + 'static>(tree: T) -> SharedTree {
    Arc::new(Mutex::new(tree))
}

/// Lock a tree, recovering from a panic in an earlier holder.
pub fn lock(tree: &SharedTree) -> MutexGuard<'_, dyn StateTree + 'static> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dispatch one protocol message to the matching tree entry point.
pub fn apply_message(tree: &mut dyn StateTree, msg: &ProtocolMessage) -> Result<()> {
    match msg {
        ProtocolMessage::NewWidget {
            id,
            kind,
            parent,
            pargs,
            cargs,
        } => tree.new_widget(*id, kind, *parent, pargs, cargs),
        ProtocolMessage::WidgetMessage { id, name, args } => tree.widget_message(*id, name, args),
        ProtocolMessage::AddWidget { id, parent, pargs } => tree.add_widget(*id, *parent, pargs),
        ProtocolMessage::Destroy { id } => tree.destroy_widget(*id),
        ProtocolMessage::Barrier { deps, bars } => tree.barrier(deps, bars),
    }
}
