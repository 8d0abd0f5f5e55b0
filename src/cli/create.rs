use std::error::Error;

use console::style;
use dialoguer::{Input, Select};

use crate::core::bot::{is_valid_slug, slugify, BotSummary, BUILTIN_PROMPTS};
use crate::core::storage::Store;

/// Interactive wizard: name, slug, prompt type, then the system prompt.
pub fn create_bot(store: &Store) -> Result<(), Box<dyn Error>> {
    let name = Input::<String>::new()
        .with_prompt("Name for your new bot")
        .validate_with(|input: &String| validate_name(input))
        .interact_text()?;

    let slug = Input::<String>::new()
        .with_prompt("Slug for your new bot")
        .default(slugify(&name))
        .validate_with(|input: &String| validate_slug(store, input))
        .interact_text()?;

    let mut choices = vec!["Custom..."];
    choices.extend(BUILTIN_PROMPTS.iter().map(|prompt| prompt.title));
    let picked = Select::new()
        .with_prompt("Choose a prompt type")
        .items(&choices)
        .default(0)
        .interact()?;
    let preset = picked
        .checked_sub(1)
        .and_then(|index| BUILTIN_PROMPTS.get(index))
        .map(|prompt| prompt.system);

    let mut system = Input::<String>::new()
        .with_prompt("System prompt for your bot")
        .validate_with(|input: &String| validate_system(input));
    if let Some(text) = preset {
        system = system.default(text.to_string());
    }
    let system = system.interact_text()?;

    store.create_bot(&BotSummary {
        slug: slug.clone(),
        name: name.clone(),
        system,
    })?;

    println!();
    println!("{}", style(format!("Successfully initialized {name}!")).green());
    println!(
        "Type: {} to say hello",
        style(format!("mimic chat {slug}")).magenta()
    );
    Ok(())
}

fn validate_name(input: &str) -> Result<(), String> {
    if input.trim().chars().count() > 1 {
        Ok(())
    } else {
        Err("Name must be at least two characters".to_string())
    }
}

fn validate_slug(store: &Store, input: &str) -> Result<(), String> {
    if !is_valid_slug(input) {
        return Err("Bot slug must be lowercase, with no spaces or special characters.".into());
    }
    if store.bot_exists(input) {
        return Err("A bot with that name already exists".into());
    }
    Ok(())
}

fn validate_system(input: &str) -> Result<(), String> {
    if input.trim().chars().count() > 5 {
        Ok(())
    } else {
        Err("System prompt must be longer than five characters".to_string())
    }
}
