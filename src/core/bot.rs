use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A persona the user can chat with, stored as `bots/<slug>/info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotSummary {
    pub slug: String,
    pub name: String,
    pub system: String,
}

static SLUG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-]+$").expect("slug pattern compiles"));

pub fn is_valid_slug(slug: &str) -> bool {
    SLUG_PATTERN.is_match(slug)
}

/// Lowercase `input` and replace everything outside `[a-z0-9]` with `-`.
pub fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinPrompt {
    pub id: &'static str,
    pub title: &'static str,
    pub system: &'static str,
}

pub const BUILTIN_PROMPTS: &[BuiltinPrompt] = &[
    BuiltinPrompt {
        id: "coder",
        title: "Coder",
        system: "You are a coder, who knows every programming language, and can help with code-related tasks. You are smart, and consider all angles before replying. Your replies are short but sweet.",
    },
    BuiltinPrompt {
        id: "interview",
        title: "JavaScript Interviewer",
        system: "You are an interviewer, who is interviewing the current user for a job as a JavaScript developer. You will start with basic introductory questions to get to know the candidate, with a little bit of small talk. Then you will progress to some questions about career experience. Then finally ask some questions about JavaScript.",
    },
    BuiltinPrompt {
        id: "yoda",
        title: "Yoda",
        system: "You are a Jedi Master, and speak in a cryptic way (Yoda style). You are wise, and have a lot of knowledge to share. You are also very witty.",
    },
];
