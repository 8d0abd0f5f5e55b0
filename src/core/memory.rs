use std::sync::LazyLock;

use regex::Regex;

use crate::core::message::Memory;

static REMEMBER_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<remember>([^>]+)</remember>").expect("remember pattern compiles")
});

/// Pull every `<remember>...</remember>` annotation out of a finished reply.
///
/// Matching is case-insensitive and the enclosed text may not contain `>`.
/// One memory per annotation, in order of appearance.
pub fn extract_memories(text: &str, conversation_id: &str) -> Vec<Memory> {
    REMEMBER_TAG
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|content| Memory::new(conversation_id, content.as_str()))
        .collect()
}
