use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyEventKind};
use ratatui::DefaultTerminal;
use tracing::{error, info};

use hearthmux::app::{App, AppMessage};
use hearthmux::bootstrap::Bootstrap;
use hearthmux::config::Config;
use hearthmux::logging;
use hearthmux::session::SessionManager;
use hearthmux::sim::SimLogin;
use hearthmux::tree::RenderTarget;

const VERSION: &str = env!("HEARTHMUX_VERSION");

/// How long the UI waits for input before redrawing.
const UI_REFRESH: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "hearthmux", version = VERSION, about)]
struct Cli {
    /// Read configuration from this file instead of the XDG location.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let _log_guard = logging::init(&config.logging)?;
    info!(version = VERSION, "Starting hearthmux");

    let manager = SessionManager::new(config.sessions.clone());
    manager.set_render_target(Some(RenderTarget::new("terminal")));

    let bootstrap = Bootstrap::new(manager.clone());
    let shutdown = bootstrap.shutdown_token();
    let (mut login, login_requests) =
        SimLogin::new(config.demo.message_interval(), shutdown.clone());
    let foreground = thread::Builder::new()
        .name("foreground".to_string())
        .spawn(move || bootstrap.run(&mut login))
        .context("failed to start foreground loop")?;

    let mut app = App::new(manager.clone(), login_requests, config.demo.accounts.clone())
        .with_version(VERSION);
    app.login_first_account();

    let mut terminal = ratatui::init();
    let res = run_app(&mut terminal, &mut app);
    ratatui::restore();

    app.shutdown();
    shutdown.cancel();
    manager.close_all();
    match foreground.join() {
        Ok(result) => result?,
        Err(_) => error!("Foreground loop panicked"),
    }
    info!("hearthmux stopped");

    res
}

fn run_app(terminal: &mut DefaultTerminal, app: &mut App) -> Result<()> {
    loop {
        app.tick();
        terminal.draw(|frame| app.view(frame))?;
        if app.should_quit() {
            return Ok(());
        }

        if event::poll(UI_REFRESH)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.update(AppMessage::KeyPress(key.code, key.modifiers));
                }
            }
        }
    }
}
