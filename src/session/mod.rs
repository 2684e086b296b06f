pub mod binding;
pub mod context;
pub mod manager;

use std::fmt;

use uuid::Uuid;

pub use context::SessionContext;
pub use manager::{SessionListener, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl Default for SessionId {
    fn default() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SessionId {
    /// First eight hex digits, for compact display.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

/// Whether a context is rendered or running unattended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Visual,
    Headless,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Visual => write!(f, "Visual"),
            Self::Headless => write!(f, "Headless"),
        }
    }
}

/// Tab bar status, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Combat,
    Bot,
    Active,
    Idle,
}

impl SessionStatus {
    pub fn icon(self) -> &'static str {
        match self {
            Self::Disconnected => "✗",
            Self::Combat => "⚔",
            Self::Bot => "●",
            Self::Active => "◉",
            Self::Idle => "○",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Combat => write!(f, "Combat"),
            Self::Bot => write!(f, "Bot"),
            Self::Active => write!(f, "Active"),
            Self::Idle => write!(f, "Idle"),
        }
    }
}

/// Display metadata of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub username: Option<String>,
    pub character_name: Option<String>,
    /// World identifier reported by the game.
    pub world: Option<String>,
}

impl SessionInfo {
    pub fn new(username: Option<String>) -> Self {
        Self {
            username,
            ..Self::default()
        }
    }
}
