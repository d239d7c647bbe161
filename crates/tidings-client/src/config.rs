//! Dispatcher configuration loaded from environment variables.
//!
//! Every setting has a default, so an embedding application can start the
//! dispatcher with `DispatcherConfig::default()`.

use std::path::PathBuf;
use std::time::Duration;

use tidings_shared::constants::{DEFAULT_COMMAND_CAPACITY, DEFAULT_EVENT_CAPACITY, SAVE_DEBOUNCE_MS};
use tidings_shared::types::ContentHashType;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Location of the favourite chatrooms document.
    /// Env: `TIDINGS_CHATROOMS_FILE`
    /// Default: `None` (platform config dir).
    pub chatrooms_path: Option<PathBuf>,

    /// Delay between the first chatroom mutation and the coalesced save.
    /// Env: `TIDINGS_SAVE_DEBOUNCE_MS`
    /// Default: 4000 ms
    pub save_debounce: Duration,

    /// Capacity of the event broadcast. Slow subscribers lag past this.
    /// Env: `TIDINGS_EVENT_CAPACITY`
    /// Default: 256
    pub event_capacity: usize,

    /// Capacity of the command queue feeding the dispatcher task.
    pub command_capacity: usize,

    /// Hash computed for outgoing files.
    /// Env: `TIDINGS_OUTGOING_HASH` (none, md5, sha256, blake3)
    /// Default: `md5`
    pub outgoing_hash: ContentHashType,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            chatrooms_path: None,
            save_debounce: Duration::from_millis(SAVE_DEBOUNCE_MS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            outgoing_hash: ContentHashType::Md5,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TIDINGS_CHATROOMS_FILE") {
            if !path.is_empty() {
                config.chatrooms_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(val) = std::env::var("TIDINGS_SAVE_DEBOUNCE_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.save_debounce = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid TIDINGS_SAVE_DEBOUNCE_MS, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("TIDINGS_EVENT_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.event_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid TIDINGS_EVENT_CAPACITY, using default"),
            }
        }

        if let Ok(val) = std::env::var("TIDINGS_OUTGOING_HASH") {
            match parse_hash_type(&val) {
                Some(kind) => config.outgoing_hash = kind,
                None => tracing::warn!(value = %val, "Invalid TIDINGS_OUTGOING_HASH, using default"),
            }
        }

        config
    }
}

fn parse_hash_type(value: &str) -> Option<ContentHashType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" | "" => Some(ContentHashType::None),
        "md5" => Some(ContentHashType::Md5),
        "sha256" => Some(ContentHashType::Sha256),
        "blake3" => Some(ContentHashType::Blake3),
        _ => None,
    }
}
