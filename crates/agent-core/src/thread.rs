//! Thread State
//!
//! Conversation history keyed by a caller-chosen thread id. The agent loop
//! loads the transcript at the start of an invocation and saves it back in
//! one call at the end.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};
use crate::message::Message;

/// Caller-chosen conversation identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new("default")
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Persisted transcript of one thread
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadState {
    pub id: ThreadId,

    /// Ordered transcript
    pub messages: Vec<Message>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ThreadState {
    pub fn new(id: ThreadId, messages: Vec<Message>) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the transcript, keeping the creation time
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.updated_at = Utc::now();
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Thread store trait for persistence
///
/// Implementations must give read-your-writes consistency per thread id and
/// must never expose a partially written transcript.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Load a transcript (empty when the thread is unseen)
    async fn load(&self, id: &ThreadId) -> Result<Vec<Message>>;

    /// Replace a transcript
    async fn save(&self, id: &ThreadId, messages: Vec<Message>) -> Result<()>;

    /// Delete a thread, returning whether it existed
    async fn delete(&self, id: &ThreadId) -> Result<bool>;

    /// Most recently updated threads first
    async fn list(&self, limit: usize) -> Result<Vec<ThreadState>>;
}

/// In-memory thread store (process lifetime only)
#[derive(Default)]
pub struct MemoryThreadStore {
    threads: RwLock<HashMap<ThreadId, ThreadState>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn load(&self, id: &ThreadId) -> Result<Vec<Message>> {
        let threads = self.threads.read().await;
        Ok(threads.get(id).map(|t| t.messages.clone()).unwrap_or_default())
    }

    async fn save(&self, id: &ThreadId, messages: Vec<Message>) -> Result<()> {
        let mut threads = self.threads.write().await;
        match threads.get_mut(id) {
            Some(state) => state.replace(messages),
            None => {
                threads.insert(id.clone(), ThreadState::new(id.clone(), messages));
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &ThreadId) -> Result<bool> {
        let mut threads = self.threads.write().await;
        Ok(threads.remove(id).is_some())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ThreadState>> {
        let threads = self.threads.read().await;
        let mut result: Vec<_> = threads.values().cloned().collect();
        sort_recent_first(&mut result, limit);
        Ok(result)
    }
}

/// One JSON file per thread under a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// reader sees either the old or the new transcript.
pub struct FileThreadStore {
    dir: PathBuf,
}

impl FileThreadStore {
    /// Open (and create if needed) a store directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &ThreadId) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(id.as_str())))
    }

    async fn read_state(path: &Path) -> Result<Option<ThreadState>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let state = serde_json::from_str(&content).map_err(|e| {
                    AgentError::Store(format!("corrupt thread file {}: {}", path.display(), e))
                })?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ThreadStore for FileThreadStore {
    async fn load(&self, id: &ThreadId) -> Result<Vec<Message>> {
        let state = Self::read_state(&self.path_for(id)).await?;
        Ok(state.map(|s| s.messages).unwrap_or_default())
    }

    async fn save(&self, id: &ThreadId, messages: Vec<Message>) -> Result<()> {
        let path = self.path_for(id);
        let state = match Self::read_state(&path).await? {
            Some(mut existing) => {
                existing.replace(messages);
                existing
            }
            None => ThreadState::new(id.clone(), messages),
        };

        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let content = serde_json::to_string_pretty(&state)?;
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(thread = %id, messages = state.messages.len(), "Saved thread");
        Ok(())
    }

    async fn delete(&self, id: &ThreadId) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<ThreadState>> {
        let mut result = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_state(&path).await {
                Ok(Some(state)) => result.push(state),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), "Skipping thread file: {}", e),
            }
        }

        sort_recent_first(&mut result, limit);
        Ok(result)
    }
}

fn sort_recent_first(threads: &mut Vec<ThreadState>, limit: usize) {
    threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    threads.truncate(limit);
}
