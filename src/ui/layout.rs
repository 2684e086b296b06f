use ratatui::layout::{Constraint, Direction, Layout, Rect};

pub struct PanelAreas {
    pub header: Rect,
    pub tabs: Rect,
    pub session: Rect,
    pub footer: Rect,
}

/// Split the screen: header | session tabs | active session | footer.
pub fn compute_layout(area: Rect) -> PanelAreas {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Min(1),
            Constraint::Length(1),
        ])
        .split(area);

    PanelAreas {
        header: vertical[0],
        tabs: vertical[1],
        session: vertical[2],
        footer: vertical[3],
    }
}
