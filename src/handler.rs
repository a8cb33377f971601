use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crate::app::{App, FocusPane, InputMode};
use crate::message::ChatMode;
use crate::tui::AppEvent;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub fn handle_event(app: &mut App, event: AppEvent) -> Result<()> {
    match event {
        AppEvent::Key(key) => handle_key(app, key)?,
        AppEvent::Resize(_, _) => {}
        AppEvent::Tick => {
            app.tick_animation();
        }
    }
    Ok(())
}

fn handle_key(app: &mut App, key: KeyEvent) -> Result<()> {
    // Global keys that work in any mode
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return Ok(());
    }

    match app.input_mode {
        InputMode::Normal => handle_normal_mode(app, key),
        InputMode::Editing => handle_editing_mode(app, key),
    }

    Ok(())
}

fn handle_normal_mode(app: &mut App, key: KeyEvent) {
    // Sidebar takes over navigation keys while it is focused.
    if app.show_sidebar && app.focus == FocusPane::Sidebar {
        match key.code {
            KeyCode::Esc | KeyCode::Char('h') => {
                app.toggle_sidebar();
            }
            KeyCode::Char('j') | KeyCode::Down => app.sidebar_nav_down(),
            KeyCode::Char('k') | KeyCode::Up => app.sidebar_nav_up(),
            KeyCode::Enter => app.open_selected_chat(),
            KeyCode::Char('q') => app.should_quit = true,
            _ => {}
        }
        return;
    }

    match key.code {
        // Quit
        KeyCode::Char('q') => app.should_quit = true,

        // Cancel an in-flight turn
        KeyCode::Esc => {
            if app.session_mut().cancel_current() {
                app.input_mode = InputMode::Editing;
            }
        }

        // Enter the input box
        KeyCode::Char('i') | KeyCode::Char('/') => {
            app.input_mode = InputMode::Editing;
            let session = app.session_mut();
            session.cursor = session.input.chars().count();
        }

        // Thread scrolling
        KeyCode::Char('j') | KeyCode::Down => app.scroll_down(),
        KeyCode::Char('k') | KeyCode::Up => app.scroll_up(),
        KeyCode::Char('g') => app.scroll_to_top(),
        KeyCode::Char('G') => app.scroll_to_bottom(),

        // Screen switching
        KeyCode::Char('a') => app.switch_mode(ChatMode::AskBuddy),
        KeyCode::Char('m') => app.switch_mode(ChatMode::MarketTransaction),

        // Conversation actions
        KeyCode::Char('n') => app.request_new_chat(),
        KeyCode::Char('r') => app.resume_last_chat(),
        KeyCode::Char('h') => app.toggle_sidebar(),

        // Suggested questions while the thread is empty
        KeyCode::Char(c @ '1'..='4') => {
            let index = (c as usize) - ('1' as usize);
            app.send_suggested(index);
        }

        _ => {}
    }
}

fn handle_editing_mode(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            // While a turn is in flight Esc cancels it; otherwise it just
            // leaves the input box.
            if !app.session_mut().cancel_current() {
                app.input_mode = InputMode::Normal;
            }
        }
        KeyCode::Enter => {
            let session = app.session_mut();
            if !session.input.trim().is_empty() && !session.is_loading() {
                session.send_current_input();
                app.stick_to_bottom = true;
            }
        }
        KeyCode::Backspace => {
            let session = app.session_mut();
            if session.cursor > 0 {
                session.cursor -= 1;
                let byte_pos = char_to_byte_index(&session.input, session.cursor);
                session.input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            let session = app.session_mut();
            let char_count = session.input.chars().count();
            if session.cursor < char_count {
                let byte_pos = char_to_byte_index(&session.input, session.cursor);
                session.input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            let session = app.session_mut();
            session.cursor = session.cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let session = app.session_mut();
            let char_count = session.input.chars().count();
            session.cursor = (session.cursor + 1).min(char_count);
        }
        KeyCode::Home => {
            app.session_mut().cursor = 0;
        }
        KeyCode::End => {
            let session = app.session_mut();
            session.cursor = session.input.chars().count();
        }
        KeyCode::Char(c) => {
            let session = app.session_mut();
            let byte_pos = char_to_byte_index(&session.input, session.cursor);
            session.input.insert(byte_pos, c);
            session.cursor += 1;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_to_byte_index_handles_multibyte() {
        let s = "héllo";
        assert_eq!(char_to_byte_index(s, 0), 0);
        assert_eq!(char_to_byte_index(s, 1), 1);
        assert_eq!(char_to_byte_index(s, 2), 3);
        assert_eq!(char_to_byte_index(s, 99), s.len());
    }
}
