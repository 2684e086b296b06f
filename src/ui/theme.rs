use ratatui::style::{Color, Modifier, Style};

use crate::session::SessionStatus;

/// Color and style constants for the hearthmux UI.
pub struct Theme;

impl Theme {
    // ── Accent ──────────────────────────────────────────────────────────────

    pub const ACCENT: Color = Color::Cyan;

    // ── Session status colors ───────────────────────────────────────────────

    pub const STATUS_ACTIVE: Color = Color::Cyan;
    pub const STATUS_BOT: Color = Color::Green;
    pub const STATUS_COMBAT: Color = Color::Yellow;
    pub const STATUS_IDLE: Color = Color::DarkGray;
    pub const STATUS_DISCONNECTED: Color = Color::Red;

    // ── Text hierarchy ──────────────────────────────────────────────────────

    pub const TEXT_PRIMARY: Color = Color::White;
    pub const TEXT_SECONDARY: Color = Color::Gray;
    pub const TEXT_MUTED: Color = Color::DarkGray;

    // ── Borders ─────────────────────────────────────────────────────────────

    pub const BORDER_VISUAL: Color = Color::Cyan;
    pub const BORDER_EMPTY: Color = Color::Gray;

    pub const KEYBIND_HINT: Color = Color::Yellow;
    pub const DANGER: Color = Color::Red;
    pub const SUCCESS: Color = Color::Green;
    pub const INVERTED_FG: Color = Color::Black;

    pub fn status_color(status: SessionStatus) -> Color {
        match status {
            SessionStatus::Active => Self::STATUS_ACTIVE,
            SessionStatus::Bot => Self::STATUS_BOT,
            SessionStatus::Combat => Self::STATUS_COMBAT,
            SessionStatus::Idle => Self::STATUS_IDLE,
            SessionStatus::Disconnected => Self::STATUS_DISCONNECTED,
        }
    }

    // ── Composite styles ────────────────────────────────────────────────────

    /// Bold black on accent: app badge and the selected tab.
    pub fn badge() -> Style {
        Style::default()
            .fg(Self::INVERTED_FG)
            .bg(Self::ACCENT)
            .add_modifier(Modifier::BOLD)
    }

    pub fn label() -> Style {
        Style::default().fg(Self::TEXT_MUTED)
    }

    pub fn keybind() -> Style {
        Style::default().fg(Self::KEYBIND_HINT)
    }

    pub fn keybind_desc() -> Style {
        Style::default().fg(Self::TEXT_MUTED)
    }
}
