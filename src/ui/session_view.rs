use ratatui::{
    layout::Rect,
    style::Style,
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Paragraph, Wrap},
    Frame,
};

use super::theme::Theme;

/// What the main panel shows for the visual session.
pub struct SessionView<'a> {
    pub title: &'a str,
    pub world: Option<&'a str>,
    pub workers: &'a [String],
    pub lines: &'a [String],
}

pub fn render_session_view(frame: &mut Frame, area: Rect, view: Option<&SessionView<'_>>) {
    let Some(view) = view else {
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Theme::BORDER_EMPTY));
        let text = Paragraph::new(Line::from(Span::styled(
            "No active session. Press Ctrl+N to log in an account.",
            Theme::label(),
        )))
        .block(block);
        frame.render_widget(text, area);
        return;
    };

    let mut title = format!(" {} ", view.title);
    if let Some(world) = view.world {
        title.push_str(&format!("@ {world} "));
    }
    if !view.workers.is_empty() {
        title.push_str(&format!("[{}] ", view.workers.join(", ")));
    }

    let block = Block::default()
        .title(Line::from(Span::styled(title, Theme::badge())))
        .borders(Borders::ALL)
        .border_type(BorderType::Thick)
        .border_style(Style::default().fg(Theme::BORDER_VISUAL));

    let lines: Vec<Line> = view
        .lines
        .iter()
        .map(|l| Line::from(Span::styled(l.as_str(), Style::default().fg(Theme::TEXT_PRIMARY))))
        .collect();

    frame.render_widget(
        Paragraph::new(lines)
            .block(block)
            .wrap(Wrap { trim: false }),
        area,
    );
}
