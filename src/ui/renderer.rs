use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Paragraph},
    Frame,
};
use unicode_width::UnicodeWidthStr;

use crate::core::message::{Message, Role};
use crate::core::session::ChatSession;
use crate::ui::chat_loop::ChatView;
use crate::ui::wrap::{visible_tail, wrap_text};

const ASSISTANT_COLOR: Color = Color::Green;
const USER_COLOR: Color = Color::Magenta;
const ERROR_COLOR: Color = Color::Red;

pub fn ui(f: &mut Frame, session: &ChatSession, view: &mut ChatView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(f.area());

    let user_label = if session.user_name().is_empty() {
        "You"
    } else {
        session.user_name()
    };
    let lines = build_display_lines(
        session.messages(),
        &session.bot().name,
        user_label,
        chunks[0].width,
    );

    // One row is taken by the title.
    let available_height = chunks[0].height.saturating_sub(1);
    let total_lines = u16::try_from(lines.len()).unwrap_or(u16::MAX);
    let scroll_offset = view.sync_scroll(total_lines, available_height);

    let title = format!("Mimic • {}", session.bot().name);
    let messages = Paragraph::new(lines)
        .block(Block::default().title(Span::styled(
            title,
            Style::default().add_modifier(Modifier::BOLD),
        )))
        .scroll((scroll_offset, 0));
    f.render_widget(messages, chunks[0]);

    let input_title = match (&view.notice, session.is_streaming()) {
        (Some(notice), _) => notice.clone(),
        (None, true) => format!("{} is typing… (Esc to quit)", session.bot().name),
        (None, false) => "Type your message (Enter to send, Esc to quit)".to_string(),
    };
    let input_width = usize::from(chunks[1].width.saturating_sub(3));
    let (visible, cursor_col) = visible_tail(&view.input, input_width);
    let input = Paragraph::new(visible).style(Style::default().fg(Color::Cyan)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .title(input_title),
    );
    f.render_widget(input, chunks[1]);

    let cursor_x = chunks[1].x + 1 + u16::try_from(cursor_col).unwrap_or(0);
    f.set_cursor_position((cursor_x, chunks[1].y + 1));
}

/// Draw each message as a rounded box `width` columns wide.
///
/// The reply still streaming ends in `...`. An error is shown in red under
/// the message text.
pub fn build_display_lines(
    messages: &[Message],
    bot_name: &str,
    user_name: &str,
    width: u16,
) -> Vec<Line<'static>> {
    let width = usize::from(width).max(8);
    let inner = width - 4;
    let mut lines = Vec::new();

    for message in messages {
        let (color, label) = match message.role {
            Role::Assistant => (ASSISTANT_COLOR, format!("🤖 {bot_name}")),
            Role::User => (USER_COLOR, format!("💬 {user_name}")),
        };
        let border = Style::default().fg(color);

        lines.push(top_border(&label, width, border));

        let text = if message.is_loading() {
            format!("{}...", message.text)
        } else {
            message.text.clone()
        };
        for row in wrap_text(&text, inner) {
            lines.push(boxed_row(row, inner, border, Style::default()));
        }
        if let Some(error) = message.error.as_deref().filter(|e| !e.is_empty()) {
            let style = Style::default().fg(ERROR_COLOR);
            for row in wrap_text(&format!("⚠ {error}"), inner) {
                lines.push(boxed_row(row, inner, border, style));
            }
        }

        lines.push(Line::from(Span::styled(
            format!("╰{}╯", "─".repeat(width - 2)),
            border,
        )));
        lines.push(Line::from(""));
    }

    lines
}

fn top_border(label: &str, width: usize, style: Style) -> Line<'static> {
    let label_width = UnicodeWidthStr::width(label);
    // "╭─ " + label + " " + fill + "╮"
    let fill = width.saturating_sub(label_width + 5);
    Line::from(vec![
        Span::styled("╭─ ".to_string(), style),
        Span::styled(label.to_string(), style.add_modifier(Modifier::BOLD)),
        Span::styled(format!(" {}╮", "─".repeat(fill)), style),
    ])
}

fn boxed_row(text: String, inner: usize, border: Style, content: Style) -> Line<'static> {
    let pad = inner.saturating_sub(UnicodeWidthStr::width(text.as_str()));
    Line::from(vec![
        Span::styled("│ ".to_string(), border),
        Span::styled(text, content),
        Span::raw(" ".repeat(pad)),
        Span::styled(" │".to_string(), border),
    ])
}
