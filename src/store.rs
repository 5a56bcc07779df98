//! Message history store
//!
//! Append-only, arrival-ordered log of delivered messages. The whole log is
//! written to a JSON file on shutdown and read back on startup, dropping
//! anything older than the configured TTL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::{info, warn};

use crate::error::AppError;
use crate::message::Message;
use crate::types::Timestamp;

/// Arrival-ordered message history
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with restored history
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Up to `n` most recent messages matching `predicate`, oldest first
    pub fn last_n(&self, n: usize, predicate: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut recent: Vec<Message> = self
            .messages
            .iter()
            .rev()
            .filter(|&m| predicate(m))
            .take(n)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Every message created in `(after, until]` matching `predicate`, in store order
    pub fn since(
        &self,
        after: Timestamp,
        until: Timestamp,
        predicate: impl Fn(&Message) -> bool,
    ) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|&m| m.created_at > after && m.created_at <= until && predicate(m))
            .cloned()
            .collect()
    }

    /// Write the whole store to `path`
    ///
    /// The JSON is written to a sibling temp file first and renamed into
    /// place, so a failed write never truncates the previous backup.
    pub async fn backup(&self, path: &Path) -> Result<(), AppError> {
        let json = serde_json::to_vec_pretty(&self.messages)?;
        let tmp = temp_path(path);

        fs::write(&tmp, &json)
            .await
            .map_err(|e| AppError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| AppError::Persistence(format!("rename to {}: {}", path.display(), e)))?;

        info!("Saved {} messages to {}", self.messages.len(), path.display());
        Ok(())
    }

    /// Read history from `path`, keeping messages younger than `ttl` at `now`
    ///
    /// A missing or unreadable file is logged and yields empty history.
    pub async fn restore(path: &Path, ttl: Duration, now: Timestamp) -> Vec<Message> {
        match read_backup(path).await {
            Ok(messages) => {
                let total = messages.len();
                let kept: Vec<Message> = messages
                    .into_iter()
                    .filter(|m| m.created_at.elapsed_until(now) < ttl)
                    .collect();
                info!(
                    "Restored {} of {} messages from {}",
                    kept.len(),
                    total,
                    path.display()
                );
                kept
            }
            Err(e) => {
                warn!("Starting with empty history: {}", e);
                Vec::new()
            }
        }
    }
}

async fn read_backup(path: &Path) -> Result<Vec<Message>, AppError> {
    let data = fs::read(path)
        .await
        .map_err(|e| AppError::Persistence(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&data)
        .map_err(|e| AppError::Persistence(format!("parse {}: {}", path.display(), e)))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
