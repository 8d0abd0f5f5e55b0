//! File-backed store for the global config, the bot registry, and
//! conversation transcripts.
//!
//! Layout under the base directory:
//!
//! ```text
//! config
//! bots/<slug>/info.json
//! bots/<slug>/convos/<conversation-id>.json
//! ```
//!
//! Every write goes through a temp file in the target directory followed by
//! a rename, so readers never observe a half-written document.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::core::bot::{is_valid_slug, BotSummary};
use crate::core::config::Config;
use crate::core::error::{MimicError, Result};
use crate::core::message::Conversation;

#[derive(Debug, Clone)]
pub struct Store {
    base_dir: PathBuf,
}

impl Store {
    /// The base directory is fixed for the lifetime of the store.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    fn bots_dir(&self) -> PathBuf {
        self.base_dir.join("bots")
    }

    fn bot_dir(&self, slug: &str) -> PathBuf {
        self.bots_dir().join(slug)
    }

    fn bot_info_path(&self, slug: &str) -> PathBuf {
        self.bot_dir(slug).join("info.json")
    }

    fn convos_dir(&self, slug: &str) -> PathBuf {
        self.bot_dir(slug).join("convos")
    }

    pub fn conversation_path(&self, slug: &str, conversation_id: &str) -> PathBuf {
        self.convos_dir(slug).join(format!("{conversation_id}.json"))
    }

    /// Load the global config, or `None` when setup has not been run.
    pub fn load_config(&self) -> Result<Option<Config>> {
        read_json_if_exists(&self.config_path())
    }

    /// Load the global config, failing with a configuration error when
    /// setup has not been run.
    pub fn require_config(&self) -> Result<Config> {
        self.load_config()?.ok_or_else(|| {
            MimicError::Configuration("Please run `mimic setup` first.".to_string())
        })
    }

    pub fn save_config(&self, config: &Config) -> Result<()> {
        fs::create_dir_all(self.bots_dir())
            .map_err(|e| MimicError::storage("failed to create", self.bots_dir(), e))?;
        write_json(&self.config_path(), config)
    }

    /// Every bot with a readable `info.json`, sorted by slug.
    pub fn list_bots(&self) -> Result<Vec<BotSummary>> {
        let bots_dir = self.bots_dir();
        let entries = match fs::read_dir(&bots_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MimicError::storage("failed to list", bots_dir, e)),
        };

        let mut bots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MimicError::storage("failed to list", &bots_dir, e))?;
            if !entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                continue;
            }
            let Some(slug) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match read_json_if_exists::<BotSummary>(&self.bot_info_path(&slug)) {
                // The directory name is authoritative.
                Ok(Some(bot)) => bots.push(BotSummary { slug, ..bot }),
                Ok(None) => {}
                Err(e) => warn!(slug = %slug, error = %e, "skipping unreadable bot"),
            }
        }
        bots.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(bots)
    }

    pub fn bot_exists(&self, slug: &str) -> bool {
        is_valid_slug(slug) && self.bot_info_path(slug).is_file()
    }

    pub fn create_bot(&self, bot: &BotSummary) -> Result<()> {
        if !is_valid_slug(&bot.slug) {
            return Err(MimicError::InvalidBot(
                "Bot slug must be lowercase, with no spaces or special characters.".to_string(),
            ));
        }
        if self.bot_exists(&bot.slug) {
            return Err(MimicError::InvalidBot(
                "A bot with that name already exists".to_string(),
            ));
        }
        write_json(&self.bot_info_path(&bot.slug), bot)
    }

    /// Delete a bot and all of its transcripts. A missing bot is not an error.
    pub fn remove_bot(&self, slug: &str) -> Result<()> {
        if !is_valid_slug(slug) {
            return Err(MimicError::InvalidBot(format!("Invalid bot slug: {slug}")));
        }
        let dir = self.bot_dir(slug);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MimicError::storage("failed to remove", dir, e)),
        }
    }

    pub fn bot_info(&self, slug: &str) -> Result<BotSummary> {
        if !is_valid_slug(slug) {
            return Err(MimicError::InvalidBot(format!("Invalid bot slug: {slug}")));
        }
        read_json_if_exists::<BotSummary>(&self.bot_info_path(slug))?
            .ok_or_else(|| MimicError::InvalidBot(format!("No bot named '{slug}'")))
    }

    pub fn save_conversation(&self, slug: &str, conversation: &Conversation) -> Result<()> {
        write_json(&self.conversation_path(slug, &conversation.id), conversation)
    }

    pub fn load_conversation(&self, slug: &str, conversation_id: &str) -> Result<Conversation> {
        if !is_valid_slug(slug) || !is_valid_conversation_id(conversation_id) {
            return Err(MimicError::InvalidBot(format!(
                "Invalid conversation reference: {slug}/{conversation_id}"
            )));
        }
        let path = self.conversation_path(slug, conversation_id);
        read_json_if_exists(&path)?.ok_or_else(|| {
            MimicError::storage(
                "failed to read",
                path,
                std::io::Error::new(ErrorKind::NotFound, "no such conversation"),
            )
        })
    }

    /// The most recently written transcript for a bot, if any.
    pub fn latest_conversation(&self, slug: &str) -> Result<Option<Conversation>> {
        let dir = self.convos_dir(slug);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MimicError::storage("failed to list", dir, e)),
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().is_none_or(|(best, _)| modified > *best) {
                newest = Some((modified, path));
            }
        }

        match newest {
            Some((_, path)) => read_json_if_exists(&path),
            None => Ok(None),
        }
    }
}

fn is_valid_conversation_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MimicError::storage("failed to read", path, e)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| MimicError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| MimicError::storage("failed to create", dir, e))?;

    let contents = serde_json::to_string_pretty(value).map_err(|source| MimicError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let write = || -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new_in(dir)?;
        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file.persist(path).map_err(|err| err.error)?;
        Ok(())
    };
    write().map_err(|e| MimicError::storage("failed to write", path, e))?;

    debug!(path = %path.display(), "wrote document");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("temp dir");
        let store = Store::new(dir.path());
        (dir, store)
    }

    fn bot(slug: &str, name: &str) -> BotSummary {
        BotSummary {
            slug: slug.into(),
            name: name.into(),
            system: "Be helpful".into(),
        }
    }

    #[test]
    fn config_round_trips_and_is_absent_before_setup() {
        let (_dir, store) = store();
        assert!(store.load_config().unwrap().is_none());
        assert!(matches!(
            store.require_config(),
            Err(MimicError::Configuration(_))
        ));

        let config = Config {
            openai_token: "sk-test".into(),
            username: "Ann".into(),
            ..Config::default()
        };
        store.save_config(&config).unwrap();
        assert_eq!(store.load_config().unwrap(), Some(config));
        assert!(store.base_dir().join("bots").is_dir());
    }

    #[test]
    fn config_is_pretty_printed_json() {
        let (_dir, store) = store();
        store
            .save_config(&Config {
                openai_token: "sk".into(),
                username: "Ann".into(),
                ..Config::default()
            })
            .unwrap();
        let raw = fs::read_to_string(store.config_path()).unwrap();
        assert_eq!(raw, "{\n  \"openai_token\": \"sk\",\n  \"username\": \"Ann\"\n}");
    }

    #[test]
    fn bots_are_listed_sorted_and_removed() {
        let (_dir, store) = store();
        assert!(store.list_bots().unwrap().is_empty());

        store.create_bot(&bot("yoda", "Yoda")).unwrap();
        store.create_bot(&bot("coder", "Coder")).unwrap();

        let slugs: Vec<String> = store.list_bots().unwrap().into_iter().map(|b| b.slug).collect();
        assert_eq!(slugs, vec!["coder", "yoda"]);
        assert!(store.bot_exists("yoda"));
        assert_eq!(store.bot_info("yoda").unwrap().name, "Yoda");

        store.remove_bot("yoda").unwrap();
        assert!(!store.bot_exists("yoda"));
        store.remove_bot("yoda").unwrap();
    }

    #[test]
    fn duplicate_and_invalid_slugs_are_rejected() {
        let (_dir, store) = store();
        store.create_bot(&bot("yoda", "Yoda")).unwrap();
        assert!(matches!(
            store.create_bot(&bot("yoda", "Other")),
            Err(MimicError::InvalidBot(_))
        ));
        assert!(matches!(
            store.create_bot(&bot("Bad Slug", "Bad")),
            Err(MimicError::InvalidBot(_))
        ));
        assert!(store.bot_info("../etc").is_err());
    }

    #[test]
    fn stray_entries_in_bots_dir_are_skipped() {
        let (_dir, store) = store();
        store.create_bot(&bot("yoda", "Yoda")).unwrap();
        fs::write(store.base_dir().join("bots").join("notes.txt"), "hi").unwrap();
        fs::create_dir_all(store.base_dir().join("bots").join("empty")).unwrap();
        let broken = store.base_dir().join("bots").join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("info.json"), "{not json").unwrap();

        let slugs: Vec<String> = store.list_bots().unwrap().into_iter().map(|b| b.slug).collect();
        assert_eq!(slugs, vec!["yoda"]);
    }

    #[test]
    fn missing_bot_is_reported() {
        let (_dir, store) = store();
        let err = store.bot_info("ghost").unwrap_err();
        assert_eq!(err.to_string(), "No bot named 'ghost'");
    }

    #[test]
    fn conversations_are_keyed_by_slug_and_id() {
        let (_dir, store) = store();
        store.create_bot(&bot("yoda", "Yoda")).unwrap();

        let mut convo = Conversation::new();
        convo.messages.push(Message::user("hello"));
        store.save_conversation("yoda", &convo).unwrap();

        assert!(store.conversation_path("yoda", &convo.id).is_file());
        assert_eq!(store.load_conversation("yoda", &convo.id).unwrap(), convo);
        assert!(store.load_conversation("yoda", "missing").is_err());
        assert!(matches!(
            store.load_conversation("yoda", "../info"),
            Err(MimicError::InvalidBot(_))
        ));
    }

    #[test]
    fn latest_conversation_picks_newest_file() {
        let (_dir, store) = store();
        assert!(store.latest_conversation("yoda").unwrap().is_none());

        let first = Conversation::new();
        store.save_conversation("yoda", &first).unwrap();
        let second = Conversation::new();
        store.save_conversation("yoda", &second).unwrap();

        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000);
        let file = fs::File::options()
            .write(true)
            .open(store.conversation_path("yoda", &first.id))
            .unwrap();
        file.set_modified(old).unwrap();

        let latest = store.latest_conversation("yoda").unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }
}
