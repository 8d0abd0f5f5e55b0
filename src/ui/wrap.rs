//! Word wrapping by terminal display width.
//!
//! Message boxes are drawn line by line, so the text inside them is wrapped
//! here rather than by ratatui. Wide characters count as two columns and
//! words longer than a line are broken mid-word.

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Wrap `text` to at most `width` columns per line. Hard newlines are kept;
/// a single space at a soft break is dropped.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        wrap_paragraph(paragraph.trim_end_matches('\r'), width, &mut lines);
    }
    lines
}

fn wrap_paragraph(paragraph: &str, width: usize, out: &mut Vec<String>) {
    let mut line = String::new();
    let mut col = 0;

    for word in paragraph.split(' ') {
        let word_width = UnicodeWidthStr::width(word);
        let gap = usize::from(col > 0);

        if col + gap + word_width <= width {
            if gap == 1 {
                line.push(' ');
            }
            line.push_str(word);
            col += gap + word_width;
            continue;
        }

        if col > 0 {
            out.push(std::mem::take(&mut line));
            col = 0;
        }
        if word_width <= width {
            line.push_str(word);
            col = word_width;
            continue;
        }

        for ch in word.chars() {
            let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
            if col + ch_width > width && col > 0 {
                out.push(std::mem::take(&mut line));
                col = 0;
            }
            line.push(ch);
            col += ch_width;
        }
    }
    out.push(line);
}

/// The widest suffix of `text` that fits in `width` columns, with its width.
pub fn visible_tail(text: &str, width: usize) -> (&str, usize) {
    let mut used = 0;
    let mut start = text.len();
    for (idx, ch) in text.char_indices().rev() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + ch_width > width {
            break;
        }
        used += ch_width;
        start = idx;
    }
    (&text[start..], used)
}
