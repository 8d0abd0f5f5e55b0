//! Key handling for the chat view.
//!
//! Handlers mutate the view and, on Enter, hand the draft to the session.
//! They never block; the streamed reply arrives through the event loop.

use ratatui::crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::debug;

use crate::core::error::MimicError;
use crate::core::session::ChatSession;
use crate::ui::chat_loop::ChatView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLoopAction {
    Continue,
    Break,
}

pub fn handle_key(session: &mut ChatSession, view: &mut ChatView, key: KeyEvent) -> KeyLoopAction {
    if key.kind != KeyEventKind::Press {
        return KeyLoopAction::Continue;
    }

    match key.code {
        KeyCode::Esc => return KeyLoopAction::Break,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            return KeyLoopAction::Break
        }
        KeyCode::Enter => submit(session, view),
        KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
            view.input.push(c);
            view.notice = None;
        }
        KeyCode::Backspace => {
            view.input.pop();
        }
        KeyCode::Up => view.scroll_up(1),
        KeyCode::Down => view.scroll_down(1),
        KeyCode::PageUp => view.scroll_up(view.page_height()),
        KeyCode::PageDown => view.scroll_down(view.page_height()),
        KeyCode::End => view.scroll_to_bottom(),
        _ => {}
    }
    KeyLoopAction::Continue
}

/// Pasted text joins the draft on a single line.
pub fn handle_paste(view: &mut ChatView, text: &str) {
    view.input.extend(
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n')
            .map(|c| if c == '\n' { ' ' } else { c }),
    );
}

fn submit(session: &mut ChatSession, view: &mut ChatView) {
    match session.send_message(&view.input) {
        Ok(turn) => {
            debug!(turn = ?turn, "message submitted");
            view.input.clear();
            view.notice = None;
            view.scroll_to_bottom();
        }
        Err(MimicError::TurnInFlight) => {
            view.notice = Some(format!(
                "{} is still replying, wait for it to finish",
                session.bot().name
            ));
        }
        Err(e) => view.notice = Some(e.to_string()),
    }
}
