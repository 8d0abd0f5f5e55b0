//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments and runs the matching command.

pub mod bot_list;
pub mod create;
pub mod setup;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::debug;

use crate::cli::bot_list::{kill_bot, list_bots};
use crate::cli::create::create_bot;
use crate::cli::setup::run_setup;
use crate::core::config::resolve_base_dir;
use crate::core::error::Result as MimicResult;
use crate::core::message::Conversation;
use crate::core::persistence::PersistenceQueue;
use crate::core::session::ChatSession;
use crate::core::storage::Store;
use crate::core::transport::{OpenAiTransport, RetryPolicy};
use crate::ui::chat_loop::run_chat;
use crate::utils::logging::{init_logging, LogSink};

#[derive(Parser)]
#[command(name = "mimic")]
#[command(about = "Chat with AI personas in your terminal")]
#[command(
    long_about = "Mimic is a full-screen terminal chat client for talking to named AI personas. \
Each bot has its own system prompt and its own saved conversations.\n\n\
Getting started:\n\
  mimic setup       Store your OpenAI token and your name\n\
  mimic create      Create a bot\n\
  mimic chat <bot>  Start chatting\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    Overrides the stored OpenAI token\n\
  MIMIC_HOME        Storage directory (defaults to ~/.mimic)\n\
  MIMIC_LOG         Log filter, e.g. debug or mimic=trace\n\n\
Controls:\n\
  Enter             Send the message\n\
  Up/Down/PgUp/PgDn Scroll through the conversation\n\
  Esc, Ctrl+C       Quit"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Storage directory (overrides MIMIC_HOME)
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Append diagnostic logs to this file
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store your OpenAI token and display name
    Setup,
    /// List your bots
    List,
    /// Chat with a bot
    Chat {
        /// Slug of the bot to talk to
        name: String,
        /// Resume the conversation with this ID
        #[arg(long, value_name = "ID", conflicts_with = "continue_last")]
        resume: Option<String>,
        /// Resume the most recent conversation
        #[arg(short = 'c', long = "continue")]
        continue_last: bool,
    },
    /// Delete a bot and all of its conversations
    Kill {
        /// Slug of the bot to delete
        name: String,
    },
    /// Create a new bot
    Create,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let sink = match (&args.command, args.log.as_deref()) {
        (_, Some(path)) => LogSink::File(path),
        (Commands::Chat { .. }, None) => LogSink::Discard,
        _ => LogSink::Stderr,
    };
    init_logging(sink)?;

    let store = Store::new(resolve_base_dir(args.home.as_deref())?);
    debug!(base = %store.base_dir().display(), "using storage directory");

    match args.command {
        Commands::Setup => run_setup(&store),
        Commands::List => list_bots(&store),
        Commands::Kill { name } => kill_bot(&store, &name),
        Commands::Create => create_bot(&store),
        Commands::Chat {
            name,
            resume,
            continue_last,
        } => chat(&store, &name, resume.as_deref(), continue_last).await,
    }
}

/// Which saved conversation a chat starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationChoice<'a> {
    New,
    Resume(&'a str),
    Latest,
}

impl<'a> ConversationChoice<'a> {
    pub fn from_flags(resume: Option<&'a str>, continue_last: bool) -> Self {
        match (resume, continue_last) {
            (Some(id), _) => ConversationChoice::Resume(id),
            (None, true) => ConversationChoice::Latest,
            (None, false) => ConversationChoice::New,
        }
    }
}

/// Load the conversation to restore, if any. `Latest` with nothing saved
/// starts fresh.
pub fn select_conversation(
    store: &Store,
    slug: &str,
    choice: ConversationChoice<'_>,
) -> MimicResult<Option<Conversation>> {
    match choice {
        ConversationChoice::New => Ok(None),
        ConversationChoice::Resume(id) => store.load_conversation(slug, id).map(Some),
        ConversationChoice::Latest => store.latest_conversation(slug),
    }
}

async fn chat(
    store: &Store,
    name: &str,
    resume: Option<&str>,
    continue_last: bool,
) -> Result<(), Box<dyn Error>> {
    let config = store.require_config()?;
    let bot = store.bot_info(name)?;
    let restored = select_conversation(
        store,
        &bot.slug,
        ConversationChoice::from_flags(resume, continue_last),
    )?;

    let queue = PersistenceQueue::spawn(store.clone(), RetryPolicy::default());
    let transport = Arc::new(OpenAiTransport::new(config.base_url()));
    let mut session = ChatSession::new(bot, transport)
        .with_model(config.model())
        .with_persistence(queue.handle());
    session.initialize(config.credential(), &config.username)?;
    if let Some(conversation) = restored {
        session.restore_conversation(conversation);
    }

    // The session holds a queue handle; it must be gone before shutdown can finish.
    let result = run_chat(session).await;
    queue.shutdown().await;
    result
}

pub(crate) fn print_storage_hint(base_dir: &Path) {
    println!(
        "{}",
        console::style(format!("Data lives in {}", base_dir.display())).dim()
    );
}
