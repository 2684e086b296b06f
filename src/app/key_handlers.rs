//! Global key bindings of the session tab bar.

use super::App;
use crossterm::event::{KeyCode, KeyModifiers};

/// Tab index for Alt+digit: `1`..`9` are tabs 0..8, `0` is tab 9.
fn digit_tab(c: char) -> Option<usize> {
    match c.to_digit(10)? {
        0 => Some(9),
        d => Some(d as usize - 1),
    }
}

impl App {
    pub(crate) fn handle_key(&mut self, code: KeyCode, mods: KeyModifiers) {
        if mods.contains(KeyModifiers::ALT) {
            match code {
                KeyCode::Char(c) if c.is_ascii_digit() => {
                    if let Some(index) = digit_tab(c) {
                        if !self.manager.switch_by_index(index) && index >= self.manager.len() {
                            self.set_error(format!("No session {}", index + 1));
                        }
                    }
                }
                KeyCode::Char(']') => {
                    self.manager.switch_to_next();
                }
                KeyCode::Char('[') => {
                    self.manager.switch_to_previous();
                }
                _ => {}
            }
            return;
        }

        if mods.contains(KeyModifiers::CONTROL) {
            match code {
                KeyCode::Char('q') => self.should_quit = true,
                KeyCode::Char('n') => self.add_account(),
                KeyCode::Char('w') => self.close_active(),
                KeyCode::Char('b') => self.start_demo_worker(),
                KeyCode::Char('x') => self.stop_active_workers(),
                _ => {}
            }
        }
    }
}
