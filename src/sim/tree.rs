use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use serde_json::Value;

use crate::net::{WidgetId, ROOT_WIDGET};
use crate::tree::{CameraState, RenderTarget, SharedTree, StateTree};

const MAX_NOTICES: usize = 64;

#[derive(Debug, Clone)]
struct Widget {
    kind: String,
    parent: WidgetId,
}

/// In-memory state tree that keeps just enough to show what a session is
/// doing.
#[derive(Debug, Default)]
pub struct SimTree {
    name: String,
    widgets: BTreeMap<WidgetId, Widget>,
    ticks: u64,
    elapsed: Duration,
    applied: u64,
    notices: VecDeque<String>,
    character: Option<String>,
    world: Option<String>,
    in_combat: bool,
    camera: Option<CameraState>,
    render_target: Option<RenderTarget>,
    torn_down: bool,
}

impl SimTree {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// The tree both as its concrete type (for inspection) and as the
    /// [`SharedTree`] a context drives. Both point at the same mutex.
    pub fn shared(name: &str) -> (Arc<Mutex<SimTree>>, SharedTree) {
        let sim = Arc::new(Mutex::new(Self::new(name)));
        let tree: SharedTree = sim.clone();
        (sim, tree)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Game time advanced by ticks.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Protocol messages applied successfully.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn widget_count(&self) -> usize {
        self.widgets.len()
    }

    pub fn has_widget(&self, id: WidgetId) -> bool {
        self.widgets.contains_key(&id)
    }

    pub fn widget_kind(&self, id: WidgetId) -> Option<&str> {
        self.widgets.get(&id).map(|w| w.kind.as_str())
    }

    pub fn notices(&self) -> &VecDeque<String> {
        &self.notices
    }

    pub fn camera(&self) -> Option<&CameraState> {
        self.camera.as_ref()
    }

    pub fn set_camera(&mut self, camera: CameraState) {
        self.camera = Some(camera);
    }

    pub fn render_target(&self) -> Option<&RenderTarget> {
        self.render_target.as_ref()
    }

    pub fn set_character(&mut self, name: &str) {
        self.character = Some(name.to_string());
    }

    pub fn set_world(&mut self, world: &str) {
        self.world = Some(world.to_string());
    }

    pub fn set_in_combat(&mut self, in_combat: bool) {
        self.in_combat = in_combat;
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    fn push_notice(&mut self, text: String) {
        if self.notices.len() == MAX_NOTICES {
            self.notices.pop_front();
        }
        self.notices.push_back(text);
    }

    fn ensure_live(&self) -> Result<()> {
        ensure!(!self.torn_down, "state tree {} was torn down", self.name);
        Ok(())
    }

    fn ensure_parent(&self, parent: WidgetId) -> Result<()> {
        ensure!(
            parent == ROOT_WIDGET || self.widgets.contains_key(&parent),
            "unknown parent widget {parent}"
        );
        Ok(())
    }
}

fn first_str(args: &[Value]) -> Option<String> {
    args.first().and_then(Value::as_str).map(str::to_string)
}

impl StateTree for SimTree {
    fn new_widget(
        &mut self,
        id: WidgetId,
        kind: &str,
        parent: WidgetId,
        _pargs: &[Value],
        _cargs: &[Value],
    ) -> Result<()> {
        self.ensure_live()?;
        ensure!(!self.widgets.contains_key(&id), "widget {id} already exists");
        self.ensure_parent(parent)?;
        self.widgets.insert(
            id,
            Widget {
                kind: kind.to_string(),
                parent,
            },
        );
        self.applied += 1;
        Ok(())
    }

    fn widget_message(&mut self, id: WidgetId, name: &str, args: &[Value]) -> Result<()> {
        self.ensure_live()?;
        ensure!(
            self.widgets.contains_key(&id),
            "message {name} for unknown widget {id}"
        );
        match name {
            "chr" => self.character = first_str(args),
            "world" => self.world = first_str(args),
            "combat" => self.in_combat = args.first().and_then(Value::as_bool).unwrap_or(false),
            "msg" => {
                if let Some(text) = first_str(args) {
                    self.push_notice(text);
                }
            }
            _ => {}
        }
        self.applied += 1;
        Ok(())
    }

    fn add_widget(&mut self, id: WidgetId, parent: WidgetId, _pargs: &[Value]) -> Result<()> {
        self.ensure_live()?;
        self.ensure_parent(parent)?;
        let Some(widget) = self.widgets.get_mut(&id) else {
            bail!("cannot attach unknown widget {id}");
        };
        widget.parent = parent;
        self.applied += 1;
        Ok(())
    }

    fn destroy_widget(&mut self, id: WidgetId) -> Result<()> {
        self.ensure_live()?;
        ensure!(self.widgets.remove(&id).is_some(), "cannot destroy unknown widget {id}");
        let mut doomed = vec![id];
        while let Some(parent) = doomed.pop() {
            let children: Vec<WidgetId> = self
                .widgets
                .iter()
                .filter(|(_, w)| w.parent == parent)
                .map(|(child, _)| *child)
                .collect();
            for child in children {
                self.widgets.remove(&child);
                doomed.push(child);
            }
        }
        self.applied += 1;
        Ok(())
    }

    fn barrier(&mut self, _deps: &[WidgetId], _bars: &[WidgetId]) -> Result<()> {
        self.ensure_live()?;
        self.applied += 1;
        Ok(())
    }

    fn tick(&mut self, dt: Duration) -> Result<()> {
        self.ensure_live()?;
        self.ticks += 1;
        self.elapsed += dt;
        Ok(())
    }

    fn bind_render_target(&mut self, target: Option<RenderTarget>) {
        self.render_target = target;
    }

    fn notify(&mut self, text: &str) {
        self.push_notice(text.to_string());
    }

    fn character_name(&self) -> Option<String> {
        self.character.clone()
    }

    fn world(&self) -> Option<String> {
        self.world.clone()
    }

    fn in_combat(&self) -> bool {
        self.in_combat
    }

    fn capture_camera(&self) -> Option<CameraState> {
        self.camera.clone()
    }

    fn apply_camera(&mut self, state: &CameraState) {
        self.camera = Some(state.clone());
    }

    fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!(
                "Character: {}   World: {}",
                self.character.as_deref().unwrap_or("-"),
                self.world.as_deref().unwrap_or("-")
            ),
            format!(
                "Widgets: {}   Messages: {}   Headless ticks: {}",
                self.widgets.len(),
                self.applied,
                self.ticks
            ),
        ];
        if self.in_combat {
            lines.push("In combat!".to_string());
        }
        lines.push(String::new());
        lines.extend(self.notices.iter().rev().take(20).cloned());
        lines
    }

    fn teardown(&mut self) {
        self.widgets.clear();
        self.render_target = None;
        self.torn_down = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree_with_ui() -> SimTree {
        let mut tree = SimTree::new("alice");
        tree.new_widget(1, "gameui", ROOT_WIDGET, &[], &[]).unwrap();
        tree
    }

    #[test]
    fn widget_messages_update_metadata() {
        let mut tree = tree_with_ui();
        tree.widget_message(1, "chr", &[json!("Ragnar")]).unwrap();
        tree.widget_message(1, "world", &[json!("hearth-2")]).unwrap();
        tree.widget_message(1, "combat", &[json!(true)]).unwrap();
        tree.widget_message(1, "msg", &[json!("You found a stone.")])
            .unwrap();
        assert_eq!(tree.character_name().as_deref(), Some("Ragnar"));
        assert_eq!(tree.world().as_deref(), Some("hearth-2"));
        assert!(tree.in_combat());
        assert_eq!(tree.notices().back().map(String::as_str), Some("You found a stone."));
        assert_eq!(tree.applied(), 5);
    }

    #[test]
    fn unknown_widgets_are_errors() {
        let mut tree = SimTree::new("alice");
        assert!(tree.widget_message(9, "chr", &[]).is_err());
        assert!(tree.destroy_widget(9).is_err());
        assert!(tree.add_widget(9, ROOT_WIDGET, &[]).is_err());
        assert!(tree.new_widget(2, "inv", 9, &[], &[]).is_err());
        assert_eq!(tree.applied(), 0);
    }

    #[test]
    fn duplicate_widget_is_error() {
        let mut tree = tree_with_ui();
        assert!(tree.new_widget(1, "gameui", ROOT_WIDGET, &[], &[]).is_err());
    }

    #[test]
    fn destroy_removes_descendants() {
        let mut tree = tree_with_ui();
        tree.new_widget(2, "inv", 1, &[], &[]).unwrap();
        tree.new_widget(3, "item", 2, &[], &[]).unwrap();
        tree.new_widget(4, "chat", ROOT_WIDGET, &[], &[]).unwrap();
        tree.destroy_widget(1).unwrap();
        assert_eq!(tree.widget_count(), 1);
        assert_eq!(tree.widget_kind(4), Some("chat"));
    }

    #[test]
    fn tick_accumulates_until_teardown() {
        let mut tree = SimTree::new("alice");
        tree.tick(Duration::from_millis(50)).unwrap();
        tree.tick(Duration::from_millis(50)).unwrap();
        assert_eq!(tree.ticks(), 2);
        assert_eq!(tree.elapsed(), Duration::from_millis(100));
        tree.teardown();
        assert!(tree.tick(Duration::from_millis(50)).is_err());
        assert_eq!(tree.ticks(), 2);
    }

    #[test]
    fn notices_are_bounded() {
        let mut tree = SimTree::new("alice");
        for i in 0..(MAX_NOTICES + 5) {
            tree.notify(&format!("line {i}"));
        }
        assert_eq!(tree.notices().len(), MAX_NOTICES);
        assert_eq!(tree.notices().front().map(String::as_str), Some("line 5"));
    }

    #[test]
    fn shared_handles_alias_one_tree() {
        let (sim, tree) = SimTree::shared("alice");
        crate::tree::lock(&tree).notify("hello");
        assert_eq!(sim.lock().unwrap().notices().len(), 1);
    }
}
