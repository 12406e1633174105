//! Durable session metadata index plus one append-only JSONL log per
//! conversation, safe to share between independent processes.
//!
//! Index mutations are read-modify-write cycles under an advisory lock (a
//! marker directory beside the index). Log appends happen outside the lock:
//! a single `write` of one line in append mode does not interleave, so logs
//! are safe under concurrent append regardless of lock state.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use soagent_core::ids::SessionId;
use soagent_core::messages::StoredMessage;

use crate::error::StoreError;

const LOCK_STALE: Duration = Duration::from_secs(30);
const LOCK_MAX_RETRIES: u32 = 5;
const LOCK_BACKOFF: Duration = Duration::from_millis(50);
const MAX_ID_LEN: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub message_count: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: SessionId,
    pub workspace_dir: String,
    pub title: String,
    pub created_at: String,
    pub last_active_at: String,
    #[serde(default)]
    pub stats: SessionStats,
}

pub struct SessionStore {
    sessions_dir: PathBuf,
    index_path: PathBuf,
    lock_path: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let sessions_dir = root.join("sessions");
        fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            sessions_dir,
            index_path: root.join("sessions.json"),
            lock_path: root.join("sessions.lock"),
        })
    }

    #[instrument(skip(self))]
    pub fn create_session(
        &self,
        workspace_dir: &str,
        title: &str,
    ) -> Result<SessionMetadata, StoreError> {
        let now = Utc::now().to_rfc3339();
        let session = SessionMetadata {
            id: SessionId::new(),
            workspace_dir: workspace_dir.to_string(),
            title: if title.is_empty() { "New Session".into() } else { title.into() },
            created_at: now.clone(),
            last_active_at: now,
            stats: SessionStats::default(),
        };

        let created = session.clone();
        self.with_lock(|store| {
            let mut sessions = store.read_index();
            sessions.push(session);
            store.write_index(&sessions)
        })?;
        Ok(created)
    }

    /// Append one message and fold its stats into the index.
    #[instrument(skip(self, msg), fields(session_id = %id))]
    pub fn save_message(&self, id: &SessionId, msg: &StoredMessage) -> Result<(), StoreError> {
        let path = self.log_path(id)?;
        let line = serde_json::to_string(msg)? + "\n";
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        // One write call per line keeps concurrent appends from interleaving.
        file.write_all(line.as_bytes())?;

        let usage = msg.usage.unwrap_or_default();
        self.with_lock(|store| {
            let mut sessions = store.read_index();
            if let Some(session) = sessions.iter_mut().find(|s| &s.id == id) {
                session.stats.message_count += 1;
                session.stats.total_input_tokens += usage.input_tokens;
                session.stats.total_output_tokens += usage.output_tokens;
                session.last_active_at = Utc::now().to_rfc3339();
                store.write_index(&sessions)?;
            }
            Ok(())
        })
    }

    /// Read a conversation log. A missing file is an empty conversation;
    /// unparseable lines are skipped, not fatal.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn messages(&self, id: &SessionId) -> Result<Vec<StoredMessage>, StoreError> {
        let path = self.log_path(id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "skipping corrupt log line");
                }
            }
        }
        Ok(messages)
    }

    /// All sessions, most recently active first.
    pub fn list(&self) -> Vec<SessionMetadata> {
        let mut sessions = self.read_index();
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        sessions
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionMetadata> {
        self.read_index().into_iter().find(|s| &s.id == id)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        validate_id(id)?;
        self.with_lock(|store| {
            let mut sessions = store.read_index();
            if let Some(session) = sessions.iter_mut().find(|s| &s.id == id) {
                session.last_active_at = Utc::now().to_rfc3339();
                store.write_index(&sessions)?;
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn rename(&self, id: &SessionId, title: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        let title = title.to_string();
        self.with_lock(|store| {
            let mut sessions = store.read_index();
            if let Some(session) = sessions.iter_mut().find(|s| &s.id == id) {
                session.title = title;
                session.last_active_at = Utc::now().to_rfc3339();
                store.write_index(&sessions)?;
            }
            Ok(())
        })
    }

    /// Remove the conversation's log and its index entry.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        let path = self.log_path(id)?;
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session_id = %id, error = %e, "failed to remove session log");
            }
        }
        self.with_lock(|store| {
            let mut sessions = store.read_index();
            sessions.retain(|s| &s.id != id);
            store.write_index(&sessions)
        })
    }

    pub(crate) fn log_path(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.sessions_dir.join(format!("{id}.jsonl")))
    }

    pub(crate) fn read_index(&self) -> Vec<SessionMetadata> {
        match fs::read_to_string(&self.index_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn write_index(&self, sessions: &[SessionMetadata]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(sessions)?;
        fs::write(&self.index_path, json)?;
        Ok(())
    }

    /// Run an index mutation under the advisory lock. Once the retries are
    /// exhausted the mutation runs unlocked: availability wins over strict
    /// exclusion for metadata, and the append-only logs are unaffected.
    fn with_lock<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        for attempt in 0..LOCK_MAX_RETRIES {
            if self.acquire_lock() {
                let result = f(self);
                self.release_lock();
                return result;
            }
            if attempt + 1 < LOCK_MAX_RETRIES {
                std::thread::sleep(LOCK_BACKOFF);
            }
        }
        tracing::warn!(path = %self.lock_path.display(), "lock contention persisted, proceeding unlocked");
        f(self)
    }

    fn acquire_lock(&self) -> bool {
        if let Ok(meta) = fs::metadata(&self.lock_path) {
            let abandoned = meta
                .modified()
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .is_some_and(|age| age > LOCK_STALE);
            if abandoned {
                tracing::warn!(path = %self.lock_path.display(), "removing abandoned lock marker");
                let _ = fs::remove_dir(&self.lock_path);
            } else {
                return false;
            }
        }
        // create_dir is atomic: exactly one contender wins.
        fs::create_dir(&self.lock_path).is_ok()
    }

    fn release_lock(&self) {
        let _ = fs::remove_dir(&self.lock_path);
    }
}

/// Ids become file names; reject anything that could escape the sessions
/// directory.
fn validate_id(id: &SessionId) -> Result<(), StoreError> {
    let s = id.as_str();
    let ok = !s.is_empty()
        && s.len() < MAX_ID_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(s.to_string()))
    }
}
