use ratatui::{
    layout::Rect,
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};

use super::theme::Theme;
use crate::session::SessionStatus;

/// One session as shown in the tab bar.
pub struct TabEntry {
    pub label: String,
    pub status: SessionStatus,
    pub active: bool,
}

/// Alt+digit shortcut shown on the tab at `index`, for the first ten tabs.
pub fn shortcut(index: usize) -> Option<char> {
    match index {
        0..=8 => char::from_digit(index as u32 + 1, 10),
        9 => Some('0'),
        _ => None,
    }
}

pub fn render_tab_bar(frame: &mut Frame, area: Rect, tabs: &[TabEntry]) {
    if tabs.is_empty() {
        let hint = Line::from(Span::styled(
            " no sessions, press ^N to log in ",
            Theme::label(),
        ));
        frame.render_widget(Paragraph::new(hint), area);
        return;
    }

    let mut spans = Vec::with_capacity(tabs.len() * 2);
    for (i, tab) in tabs.iter().enumerate() {
        let key = shortcut(i).map(|c| format!("{c}:")).unwrap_or_default();
        let text = format!(" {key}{} {} ", tab.status.icon(), tab.label);
        let style = if tab.active {
            Theme::badge()
        } else {
            Style::default()
                .fg(Theme::status_color(tab.status))
                .add_modifier(if tab.status == SessionStatus::Combat {
                    Modifier::BOLD
                } else {
                    Modifier::empty()
                })
        };
        spans.push(Span::styled(text, style));
        spans.push(Span::raw(" "));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::{backend::TestBackend, Terminal};

    fn row_text(terminal: &Terminal<TestBackend>, y: u16) -> String {
        let buffer = terminal.backend().buffer();
        (0..buffer.area.width)
            .map(|x| buffer[(x, y)].symbol().to_string())
            .collect()
    }

    fn tab(label: &str, status: SessionStatus, active: bool) -> TabEntry {
        TabEntry {
            label: label.to_string(),
            status,
            active,
        }
    }

    #[test]
    fn shortcuts_cover_first_ten_tabs() {
        assert_eq!(shortcut(0), Some('1'));
        assert_eq!(shortcut(8), Some('9'));
        assert_eq!(shortcut(9), Some('0'));
        assert_eq!(shortcut(10), None);
    }

    #[test]
    fn renders_tabs_in_order_with_icons() {
        let mut terminal = Terminal::new(TestBackend::new(60, 1)).unwrap();
        let tabs = [
            tab("Alice", SessionStatus::Active, true),
            tab("Bob", SessionStatus::Bot, false),
        ];
        terminal
            .draw(|frame| render_tab_bar(frame, frame.area(), &tabs))
            .unwrap();
        let text = row_text(&terminal, 0);
        let alice = text.find("1:◉ Alice").unwrap();
        let bob = text.find("2:● Bob").unwrap();
        assert!(alice < bob);
    }

    #[test]
    fn active_tab_uses_badge_style() {
        let mut terminal = Terminal::new(TestBackend::new(30, 1)).unwrap();
        let tabs = [tab("Alice", SessionStatus::Active, true)];
        terminal
            .draw(|frame| render_tab_bar(frame, frame.area(), &tabs))
            .unwrap();
        let cell = &terminal.backend().buffer()[(2, 0)];
        assert_eq!(cell.bg, Theme::ACCENT);
    }

    #[test]
    fn empty_bar_shows_login_hint() {
        let mut terminal = Terminal::new(TestBackend::new(40, 1)).unwrap();
        terminal
            .draw(|frame| render_tab_bar(frame, frame.area(), &[]))
            .unwrap();
        assert!(row_text(&terminal, 0).contains("^N to log in"));
    }
}
