use ratatui::{
    layout::Rect,
    style::Style,
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};

use super::theme::Theme;

/// Title line; `version` is shown as `v<version>` when non-empty.
pub fn render_header(frame: &mut Frame, area: Rect, version: &str) {
    let mut title = " Multi-session game client".to_string();
    if !version.is_empty() {
        title.push_str(&format!(" v{version}"));
    }
    let header = Paragraph::new(Line::from(vec![
        Span::styled(" hearthmux ", Theme::badge()),
        Span::styled(title, Style::default().fg(Theme::TEXT_SECONDARY)),
    ]));
    frame.render_widget(header, area);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FooterLevel {
    Info,
    Success,
    Error,
}

pub struct FooterState<'a> {
    pub session_count: usize,
    pub headless_count: usize,
    pub message: Option<(&'a str, FooterLevel)>,
}

const KEY_HINTS: &[(&str, &str)] = &[
    ("Alt+1..0", "Switch"),
    ("Alt+[ ]", "Prev/Next"),
    ("^N", "Add"),
    ("^W", "Close"),
    ("^B", "Bot"),
    ("^X", "Stop"),
    ("^Q", "Quit"),
];

pub fn render_footer(frame: &mut Frame, area: Rect, state: &FooterState<'_>) {
    let counts = Span::styled(
        format!(
            " {} session(s), {} headless ",
            state.session_count, state.headless_count
        ),
        Style::default().fg(Theme::TEXT_SECONDARY),
    );

    let line = match state.message {
        Some((text, FooterLevel::Error)) => Line::from(vec![
            counts,
            Span::styled(
                " ERROR ",
                Style::default().fg(Theme::TEXT_PRIMARY).bg(Theme::DANGER),
            ),
            Span::styled(format!(" {text}"), Style::default().fg(Theme::DANGER)),
        ]),
        Some((text, level)) => {
            let color = if level == FooterLevel::Success {
                Theme::SUCCESS
            } else {
                Theme::TEXT_PRIMARY
            };
            Line::from(vec![
                counts,
                Span::styled(format!(" {text}"), Style::default().fg(color)),
            ])
        }
        None => {
            let mut spans = vec![counts];
            for (key, desc) in KEY_HINTS {
                spans.push(Span::styled(format!(" {key}"), Theme::keybind()));
                spans.push(Span::styled(format!(" {desc}"), Theme::keybind_desc()));
            }
            Line::from(spans)
        }
    };

    frame.render_widget(Paragraph::new(line), area);
}
