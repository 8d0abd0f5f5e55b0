use std::error::Error;

use console::style;

use crate::core::bot::BotSummary;
use crate::core::storage::Store;

const SLUG_COLUMN: usize = 20;

pub fn list_bots(store: &Store) -> Result<(), Box<dyn Error>> {
    let bots = store.list_bots()?;
    if bots.is_empty() {
        println!("No bots have been created yet.");
        println!("\n💡 Create one with:");
        println!("   mimic create");
        return Ok(());
    }

    for bot in &bots {
        println!("{}", format_bot_line(bot));
    }
    println!("\n💡 Start chatting with:");
    println!("   mimic chat <slug>");
    Ok(())
}

fn format_bot_line(bot: &BotSummary) -> String {
    format!(
        "{} {}",
        style(format!("{:<width$}", bot.slug, width = SLUG_COLUMN)).bold(),
        style(&bot.name).dim()
    )
}

pub fn kill_bot(store: &Store, slug: &str) -> Result<(), Box<dyn Error>> {
    store.remove_bot(slug)?;
    println!("RIP");
    Ok(())
}
