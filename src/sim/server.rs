use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::net::{ProtocolMessage, SessionHandle, WidgetId, ROOT_WIDGET};

const GAME_UI: WidgetId = 1;
const WORLD: &str = "hearth-1";

/// Scripted server side of one connection: builds a small game UI, then
/// streams activity at a fixed interval until stopped or disconnected.
pub struct SimServer {
    handle: SessionHandle,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl SimServer {
    pub fn start(handle: SessionHandle, interval: Duration) -> Result<Self> {
        let cancel = CancellationToken::new();
        let username = handle.username().unwrap_or("guest").to_string();
        let thread = thread::Builder::new()
            .name(format!("sim-server-{username}"))
            .spawn({
                let handle = handle.clone();
                let cancel = cancel.clone();
                move || serve(&handle, &username, interval, &cancel)
            })
            .context("failed to spawn simulated server")?;
        Ok(Self {
            handle,
            cancel,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Drop the connection from the server side: the client drains what was
    /// already sent, then sees end-of-stream.
    pub fn disconnect(&self) {
        self.handle.finish();
        self.stop_streaming();
    }

    fn stop_streaming(&self) {
        self.cancel.cancel();
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.stop_streaming();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// `"alice"` → `"Alice"`.
pub fn character_name(username: &str) -> String {
    let mut chars = username.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Nameless".to_string(),
    }
}

fn serve(handle: &SessionHandle, username: &str, interval: Duration, cancel: &CancellationToken) {
    let character = character_name(username);
    let greeting = [
        ProtocolMessage::NewWidget {
            id: GAME_UI,
            kind: "gameui".to_string(),
            parent: ROOT_WIDGET,
            pargs: vec![],
            cargs: vec![json!(character)],
        },
        ProtocolMessage::WidgetMessage {
            id: GAME_UI,
            name: "chr".to_string(),
            args: vec![json!(character)],
        },
        ProtocolMessage::WidgetMessage {
            id: GAME_UI,
            name: "world".to_string(),
            args: vec![json!(WORLD)],
        },
    ];
    for msg in greeting {
        if !handle.deliver(msg) {
            return;
        }
    }

    let mut round: u32 = 0;
    while !cancel.is_cancelled() {
        thread::park_timeout(interval);
        if cancel.is_cancelled() {
            break;
        }
        round += 1;
        if !script_round(handle, &character, round) {
            break;
        }
    }
    debug!(username, rounds = round, "Simulated server stopped");
}

/// One round of traffic. Returns `false` once the connection is closed.
fn script_round(handle: &SessionHandle, character: &str, round: u32) -> bool {
    let item = 100 + round as WidgetId;
    let mut batch = vec![ProtocolMessage::WidgetMessage {
        id: GAME_UI,
        name: "msg".to_string(),
        args: vec![json!(format!("{character} gathers branches ({round})"))],
    }];
    if round % 5 == 0 {
        batch.push(ProtocolMessage::NewWidget {
            id: item,
            kind: "item".to_string(),
            parent: GAME_UI,
            pargs: vec![json!([round % 8, round % 4])],
            cargs: vec![json!("branch")],
        });
        if round > 5 {
            batch.push(ProtocolMessage::Destroy { id: item - 5 });
        }
    }
    if round % 16 == 8 {
        batch.push(combat(true));
    } else if round % 16 == 12 {
        batch.push(combat(false));
    }
    batch.into_iter().all(|msg| handle.deliver(msg))
}

fn combat(on: bool) -> ProtocolMessage {
    ProtocolMessage::WidgetMessage {
        id: GAME_UI,
        name: "combat".to_string(),
        args: vec![json!(on)],
    }
}
