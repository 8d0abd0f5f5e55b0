//! Main chat event loop
//!
//! Terminal input and turn updates from the session are awaited together.
//! The session notifies a dirty flag on every change and the loop redraws
//! when it is set, so streamed text appears as it arrives.

mod keybindings;
mod lifecycle;

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ratatui::crossterm::event::{self, Event};
use tokio::sync::mpsc;
use tracing::debug;

use self::keybindings::{handle_key, handle_paste, KeyLoopAction};
use self::lifecycle::{restore_terminal, setup_terminal};
use crate::core::session::ChatSession;
use crate::ui::renderer::ui;

#[derive(Debug)]
pub enum UiEvent {
    Crossterm(Event),
}

/// Everything on screen that is not part of the session.
#[derive(Debug, Default)]
pub struct ChatView {
    pub input: String,
    /// Shown in place of the input box title until the next keystroke.
    pub notice: Option<String>,
    scroll_offset: u16,
    /// Scrolled away from the bottom by the user.
    pinned: bool,
    max_scroll: u16,
    viewport_height: u16,
}

impl ChatView {
    /// Record the transcript size from the last layout and return the row
    /// to scroll to. Follows the bottom unless the user scrolled up.
    pub fn sync_scroll(&mut self, total_lines: u16, viewport_height: u16) -> u16 {
        self.viewport_height = viewport_height;
        self.max_scroll = total_lines.saturating_sub(viewport_height);
        if !self.pinned || self.scroll_offset >= self.max_scroll {
            self.pinned = false;
            self.scroll_offset = self.max_scroll;
        }
        self.scroll_offset
    }

    pub fn scroll_up(&mut self, rows: u16) {
        self.scroll_offset = self.scroll_offset.min(self.max_scroll).saturating_sub(rows);
        self.pinned = self.scroll_offset < self.max_scroll;
    }

    pub fn scroll_down(&mut self, rows: u16) {
        self.scroll_offset = self.scroll_offset.saturating_add(rows).min(self.max_scroll);
        self.pinned = self.scroll_offset < self.max_scroll;
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_offset = self.max_scroll;
        self.pinned = false;
    }

    pub fn page_height(&self) -> u16 {
        self.viewport_height.saturating_sub(1).max(1)
    }
}

fn spawn_event_reader(event_tx: mpsc::UnboundedSender<UiEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Ok(true) = event::poll(Duration::from_millis(10)) {
                match event::read() {
                    Ok(ev) => {
                        if event_tx.send(UiEvent::Crossterm(ev)).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        continue;
                    }
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
    })
}

/// Run the full-screen chat until the user quits. The session is dropped
/// before returning, which releases its persistence handle.
pub async fn run_chat(mut session: ChatSession) -> Result<(), Box<dyn Error>> {
    let dirty = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&dirty);
    let subscription = session.subscribe(move |_| flag.store(true, Ordering::Relaxed));

    let mut terminal = setup_terminal()?;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<UiEvent>();
    let event_reader_handle = spawn_event_reader(event_tx);
    let mut view = ChatView::default();

    let result: Result<(), Box<dyn Error>> = loop {
        if dirty.swap(false, Ordering::Relaxed) {
            if let Err(e) = terminal.draw(|f| ui(f, &session, &mut view)) {
                break Err(e.into());
            }
        }

        tokio::select! {
            Some(update) = session.next_update() => session.apply_update(update),
            event = event_rx.recv() => {
                let Some(UiEvent::Crossterm(event)) = event else {
                    break Ok(());
                };
                let action = match event {
                    Event::Key(key) => handle_key(&mut session, &mut view, key),
                    Event::Paste(text) => {
                        handle_paste(&mut view, &text);
                        KeyLoopAction::Continue
                    }
                    _ => KeyLoopAction::Continue,
                };
                if action == KeyLoopAction::Break {
                    break Ok(());
                }
                dirty.store(true, Ordering::Relaxed);
            }
        }
    };

    event_reader_handle.abort();
    session.unsubscribe(subscription);
    debug!(conversation = %session.conversation_id(), "leaving chat");
    drop(session);
    restore_terminal(&mut terminal)?;
    result
}
