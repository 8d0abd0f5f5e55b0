use chrono::{DateTime, Datelike, TimeZone};

/// Assemble the system prompt sent at the head of every turn.
///
/// Each clause becomes a period-terminated sentence on its own line. The
/// clock is passed in so the prompt is a pure function of its inputs.
pub fn build_system_prompt<Tz>(
    bot_name: &str,
    bot_system: &str,
    user_name: &str,
    now: &DateTime<Tz>,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let parts = [
        format!("You are {bot_name}"),
        bot_system.to_string(),
        format!(
            "You are aware of the date and time — it is currently {}, at {}",
            date_clause(now),
            now.format("%-I:%M%P")
        ),
        format!("The user's name is {user_name}"),
    ];
    format!("{}.", parts.join(".\n"))
}

fn date_clause<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let day = now.day();
    format!(
        "{}, {}{} {}",
        now.format("%A"),
        day,
        ordinal_suffix(day),
        now.format("%B")
    )
}

fn ordinal_suffix(day: u32) -> &'static str {
    match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    }
}
