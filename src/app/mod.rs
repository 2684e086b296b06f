mod key_handlers;

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{KeyCode, KeyModifiers};
use ratatui::Frame;
use tracing::{info, warn};

use crate::session::{SessionContext, SessionListener, SessionManager, SessionMode};
use crate::ui::{layout, session_view, status_bar, tab_bar};
use crate::worker::{SupportTask, WorkerExecutor, WorkerHandle, WorkerOutcome};

const DEMO_WORKER: &str = "woodcutter";
const DEMO_WORKER_STEP: Duration = Duration::from_millis(400);

pub enum AppMessage {
    KeyPress(KeyCode, KeyModifiers),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub text: String,
    pub level: StatusLevel,
}

/// Registry changes forwarded to the UI thread.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEvent {
    Added(String),
    Removed(String),
    ActiveChanged(Option<String>),
}

struct ChannelListener(Sender<SessionEvent>);

impl SessionListener for ChannelListener {
    fn on_active_session_changed(
        &self,
        _old: Option<&Arc<SessionContext>>,
        new: Option<&Arc<SessionContext>>,
    ) {
        let _ = self
            .0
            .send(SessionEvent::ActiveChanged(new.map(|c| c.display_name())));
    }

    fn on_session_added(&self, ctx: &Arc<SessionContext>) {
        let _ = self.0.send(SessionEvent::Added(ctx.display_name()));
    }

    fn on_session_removed(&self, ctx: &Arc<SessionContext>) {
        let _ = self.0.send(SessionEvent::Removed(ctx.display_name()));
    }
}

pub struct App {
    pub(crate) manager: SessionManager,
    executor: WorkerExecutor,
    login_requests: Sender<String>,
    accounts: Vec<String>,
    guest_counter: usize,
    events: Receiver<SessionEvent>,
    workers: Vec<WorkerHandle>,
    pub(crate) should_quit: bool,
    pub(crate) status_message: Option<StatusMessage>,
    version: String,
}

impl App {
    pub fn new(manager: SessionManager, login_requests: Sender<String>, accounts: Vec<String>) -> Self {
        let (tx, events) = mpsc::channel();
        manager.add_listener(Arc::new(ChannelListener(tx)));
        Self {
            executor: WorkerExecutor::new(manager.clone()),
            manager,
            login_requests,
            accounts,
            guest_counter: 0,
            events,
            workers: Vec::new(),
            should_quit: false,
            status_message: None,
            version: String::new(),
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn update(&mut self, msg: AppMessage) {
        match msg {
            AppMessage::KeyPress(code, mods) => self.handle_key(code, mods),
        }
    }

    /// Drain registry events and collect finished workers.
    pub fn tick(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                SessionEvent::Added(name) => self.set_info(format!("{name} joined")),
                SessionEvent::Removed(name) => self.set_info(format!("{name} left")),
                SessionEvent::ActiveChanged(Some(name)) => {
                    self.set_info(format!("Now playing {name}"))
                }
                SessionEvent::ActiveChanged(None) => {}
            }
        }

        let mut finished = Vec::new();
        self.workers.retain_mut(|handle| match handle.try_outcome() {
            Some(outcome) => {
                finished.push((handle.name().to_string(), outcome));
                false
            }
            None => true,
        });
        for (name, outcome) in finished {
            match outcome {
                WorkerOutcome::Failed(e) => self.set_error(format!("{name} failed: {e:#}")),
                other => self.set_success(format!("{name} {other}")),
            }
        }
    }

    pub fn view(&self, frame: &mut Frame) {
        let areas = layout::compute_layout(frame.area());
        status_bar::render_header(frame, areas.header, &self.version);

        let sessions = self.manager.sessions();
        let active_id = self.manager.active_id();
        let tabs: Vec<tab_bar::TabEntry> = sessions
            .iter()
            .map(|ctx| tab_bar::TabEntry {
                label: ctx.display_name(),
                status: ctx.status(),
                active: Some(ctx.id()) == active_id,
            })
            .collect();
        tab_bar::render_tab_bar(frame, areas.tabs, &tabs);

        match self.manager.active() {
            Some(ctx) => {
                let title = ctx.display_name();
                let info = ctx.info();
                let workers = ctx.running_workers();
                let lines = ctx.with_tree(|t| t.status_lines());
                let view = session_view::SessionView {
                    title: &title,
                    world: info.world.as_deref(),
                    workers: &workers,
                    lines: &lines,
                };
                session_view::render_session_view(frame, areas.session, Some(&view));
            }
            None => session_view::render_session_view(frame, areas.session, None),
        }

        let headless_count = sessions
            .iter()
            .filter(|c| c.mode() == SessionMode::Headless)
            .count();
        let message = self.status_message.as_ref().map(|m| {
            let level = match m.level {
                StatusLevel::Info => status_bar::FooterLevel::Info,
                StatusLevel::Success => status_bar::FooterLevel::Success,
                StatusLevel::Error => status_bar::FooterLevel::Error,
            };
            (m.text.as_str(), level)
        });
        status_bar::render_footer(
            frame,
            areas.footer,
            &status_bar::FooterState {
                session_count: sessions.len(),
                headless_count,
                message,
            },
        );
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    /// Ask the login flow for the first configured account.
    pub fn login_first_account(&mut self) {
        self.add_account();
    }

    /// Stop every worker this app started and wait for them.
    pub fn shutdown(self) {
        for handle in &self.workers {
            handle.stop();
        }
        for handle in self.workers {
            let name = handle.name().to_string();
            if let WorkerOutcome::Failed(e) = handle.join() {
                warn!(worker = %name, "Worker failed during shutdown: {e:#}");
            }
        }
    }

    pub(crate) fn add_account(&mut self) {
        let username = self.next_account();
        if self.login_requests.send(username.clone()).is_err() {
            self.set_error("Login flow is not running");
            return;
        }
        if let Some(active) = self.manager.active_id() {
            self.manager.demote_session(active);
        }
        info!(username, "Requested login");
        self.set_info(format!("Logging in {username}..."));
    }

    /// First configured account without a session, else a fresh guest.
    fn next_account(&mut self) -> String {
        if let Some(account) = self
            .accounts
            .iter()
            .find(|a| self.manager.find_by_username(a).is_none())
        {
            return account.clone();
        }
        self.guest_counter += 1;
        format!("guest{}", self.guest_counter)
    }

    pub(crate) fn close_active(&mut self) {
        match self.manager.active_id() {
            Some(id) => self.manager.request_close_session(id),
            None => self.set_error("No active session to close"),
        }
    }

    /// Start the demo worker on the active session: it keeps chopping on
    /// that session even after the user switches away.
    pub(crate) fn start_demo_worker(&mut self) {
        let started = self.executor.run_with_supports(
            DEMO_WORKER,
            |cx| {
                let name = cx.session().display_name();
                let mut logs = 0u32;
                loop {
                    cx.sleep(DEMO_WORKER_STEP)?;
                    logs += 1;
                    cx.with_tree(|t| t.notify(&format!("{name} chops a tree ({logs})")))?;
                }
            },
            vec![SupportTask::new("eater", |cx| loop {
                cx.sleep(DEMO_WORKER_STEP * 10)?;
                cx.notify("Ate some blueberries");
            })],
            |outcome| info!(worker = DEMO_WORKER, "Demo worker {outcome}"),
        );
        match started {
            Ok(handle) => {
                self.set_success(format!("{DEMO_WORKER} started"));
                self.workers.push(handle);
            }
            Err(e) => self.set_error(format!("{e:#}")),
        }
    }

    pub(crate) fn stop_active_workers(&mut self) {
        match self.manager.active() {
            Some(ctx) => {
                ctx.stop_workers();
                self.set_info(format!("Stopping workers on {}", ctx.display_name()));
            }
            None => self.set_error("No active session"),
        }
    }

    pub(crate) fn set_info(&mut self, text: impl Into<String>) {
        self.status_message = Some(StatusMessage {
            text: text.into(),
            level: StatusLevel::Info,
        });
    }

    pub(crate) fn set_success(&mut self, text: impl Into<String>) {
        self.status_message = Some(StatusMessage {
            text: text.into(),
            level: StatusLevel::Success,
        });
    }

    pub(crate) fn set_error(&mut self, text: impl Into<String>) {
        self.status_message = Some(StatusMessage {
            text: text.into(),
            level: StatusLevel::Error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::net::SessionHandle;
    use crate::sim::SimTree;
    use ratatui::{backend::TestBackend, Terminal};

    pub(super) fn app_with(accounts: &[&str]) -> (App, Receiver<String>) {
        let manager = SessionManager::new(SessionSettings {
            tick_rate_hz: 200.0,
            promote_timeout_ms: 500,
            sync_camera: false,
        });
        let (tx, rx) = mpsc::channel();
        let app = App::new(
            manager,
            tx,
            accounts.iter().map(|a| a.to_string()).collect(),
        );
        (app, rx)
    }

    pub(super) fn add(app: &App, name: &str) -> Arc<SessionContext> {
        app.manager.add_session(
            SessionHandle::new(Some(name.to_string())),
            SimTree::shared(name).1,
        )
    }

    #[test]
    fn add_account_requests_unused_accounts_then_guests() {
        let (mut app, rx) = app_with(&["alice", "bob"]);
        add(&app, "alice");
        app.add_account();
        app.add_account();
        assert_eq!(rx.try_recv().unwrap(), "bob");
        assert_eq!(rx.try_recv().unwrap(), "bob");
        app.manager.add_session(
            SessionHandle::new(Some("bob".into())),
            SimTree::shared("bob").1,
        );
        app.add_account();
        assert_eq!(rx.try_recv().unwrap(), "guest1");
        app.manager.close_all();
    }

    #[test]
    fn add_account_demotes_active_session() {
        let (mut app, _rx) = app_with(&["alice", "bob"]);
        let a = add(&app, "alice");
        app.add_account();
        assert!(app.manager.active().is_none());
        assert_eq!(a.mode(), SessionMode::Headless);
        app.manager.close_all();
    }

    #[test]
    fn add_account_without_login_flow_reports_error() {
        let (mut app, rx) = app_with(&["alice"]);
        drop(rx);
        app.add_account();
        assert_eq!(
            app.status_message.as_ref().map(|m| m.level),
            Some(StatusLevel::Error)
        );
    }

    #[test]
    fn tick_turns_registry_events_into_status() {
        let (mut app, _rx) = app_with(&[]);
        add(&app, "alice");
        app.tick();
        assert_eq!(
            app.status_message.as_ref().map(|m| m.text.as_str()),
            Some("Now playing alice")
        );
        app.manager.close_all();
        app.tick();
        assert_eq!(
            app.status_message.as_ref().map(|m| m.text.as_str()),
            Some("alice left")
        );
    }

    #[test]
    fn demo_worker_stops_and_reports() {
        let (mut app, _rx) = app_with(&[]);
        let a = add(&app, "alice");
        app.start_demo_worker();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !a.is_running_worker() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        app.stop_active_workers();
        while !app.workers.is_empty() && std::time::Instant::now() < deadline {
            app.tick();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(app.workers.is_empty());
        assert_eq!(
            app.status_message.as_ref().map(|m| m.text.as_str()),
            Some("woodcutter STOPPED")
        );
        app.manager.close_all();
    }

    #[test]
    fn view_renders_tabs_and_active_session() {
        let (app, _rx) = app_with(&[]);
        add(&app, "alice");
        add(&app, "bob");
        let mut terminal = Terminal::new(TestBackend::new(100, 12)).unwrap();
        terminal.draw(|frame| app.view(frame)).unwrap();

        let buffer = terminal.backend().buffer();
        let row = |y: u16| -> String {
            (0..buffer.area.width)
                .map(|x| buffer[(x, y)].symbol().to_string())
                .collect()
        };
        assert!(row(0).contains("hearthmux"));
        assert!(row(1).contains("1:◉ alice"));
        assert!(row(1).contains("2:○ bob"));
        assert!(row(2).contains("alice"));
        assert!(row(11).contains("2 session(s), 1 headless"));
        app.manager.close_all();
    }
}
