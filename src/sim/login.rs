use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{SimServer, SimTree};
use crate::bootstrap::{Login, LoginFlow, LoginOutcome};
use crate::net::SessionHandle;
use crate::session::SessionManager;

const POLL: Duration = Duration::from_millis(50);

/// Login screen stand-in: waits for account names requested by the
/// front-end and connects each to a fresh [`SimServer`].
pub struct SimLogin {
    requests: Receiver<String>,
    servers: HashMap<String, SimServer>,
    message_interval: Duration,
    shutdown: CancellationToken,
}

impl SimLogin {
    /// Returns the flow and the sender the front-end requests logins with.
    pub fn new(message_interval: Duration, shutdown: CancellationToken) -> (Self, Sender<String>) {
        let (tx, requests) = mpsc::channel();
        let login = Self {
            requests,
            servers: HashMap::new(),
            message_interval,
            shutdown,
        };
        (login, tx)
    }

    fn connect(&mut self, username: String) -> Result<Login> {
        // Like a real server, a second login for an account kills the first.
        if let Some(stale) = self.servers.remove(&username) {
            stale.disconnect();
        }
        let handle = SessionHandle::new(Some(username.clone()));
        let server = SimServer::start(handle.clone(), self.message_interval)?;
        self.servers.insert(username.clone(), server);
        let (_, tree) = SimTree::shared(&username);
        info!(username, "Logged in");
        Ok(Login { handle, tree })
    }
}

impl LoginFlow for SimLogin {
    fn login(&mut self, manager: &SessionManager) -> Result<LoginOutcome> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(LoginOutcome::Quit);
            }
            if manager.has_pending_switch() {
                return Ok(LoginOutcome::Aborted);
            }
            match self.requests.recv_timeout(POLL) {
                Ok(username) => return Ok(LoginOutcome::LoggedIn(self.connect(username)?)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(LoginOutcome::Quit),
            }
        }
    }
}
