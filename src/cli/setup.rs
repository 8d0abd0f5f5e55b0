use std::error::Error;

use console::style;
use dialoguer::Input;

use crate::cli::print_storage_hint;
use crate::core::config::Config;
use crate::core::storage::Store;

/// Ask for the API token and display name, offering the stored values as
/// defaults. Any other stored settings are kept.
pub fn run_setup(store: &Store) -> Result<(), Box<dyn Error>> {
    let existing = store.load_config()?.unwrap_or_default();

    let mut token = Input::<String>::new().with_prompt("OpenAI API token");
    if !existing.openai_token.is_empty() {
        token = token.default(existing.openai_token.clone());
    }
    let openai_token = token.interact_text()?;

    let mut name = Input::<String>::new().with_prompt("What is your name?");
    if !existing.username.is_empty() {
        name = name.default(existing.username.clone());
    }
    let username = name.interact_text()?;

    store.save_config(&merge_answers(existing, openai_token, username))?;

    println!("{}", style("✅ Setup complete").green());
    print_storage_hint(store.base_dir());
    Ok(())
}

fn merge_answers(existing: Config, openai_token: String, username: String) -> Config {
    Config {
        openai_token: openai_token.trim().to_string(),
        username: username.trim().to_string(),
        ..existing
    }
}
