//! Session and bridge-correlation storage
//!
//! A small key-value store with two maps: registered sessions (keyed by
//! username) and ephemeral call-to-bridge correlation entries (keyed by
//! call id, with per-entry expiry). The [`SessionStore`] trait keeps the
//! backing implementation swappable; [`FileBackedStore`] keeps everything
//! in memory and snapshots to a JSON file so sessions survive restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::Session;

/// The first leg's entry only needs to outlive bridge setup.
pub const SHORT_CORRELATION_TTL: Duration = Duration::from_secs(15 * 60);

/// The second leg may answer slowly and hang up last, so its entry covers
/// a full day of call time.
pub const LONG_CORRELATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Correlation and session state shared by all webhook invocations.
///
/// The store holds this data without interpreting it; the call router owns
/// the correlation lifecycle.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, username: &str) -> Result<Option<Session>, StoreError>;

    async fn put_session(&self, session: Session) -> Result<(), StoreError>;

    /// Bridge id correlated with `call_id`, if a live entry exists.
    async fn get_bridge(&self, call_id: &str) -> Result<Option<String>, StoreError>;

    async fn put_bridge(
        &self,
        call_id: &str,
        bridge_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Atomically remove and return the correlation entry for `call_id`.
    /// Exactly one of several concurrent callers observes `Some`.
    async fn take_bridge(&self, call_id: &str) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorrelationEntry {
    bridge_id: String,
    expires_at: DateTime<Utc>,
}

impl CorrelationEntry {
    fn is_live(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    sessions: HashMap<String, Session>,
    bridges: HashMap<String, CorrelationEntry>,
}

/// In-memory store snapshotted to a JSON file after every mutation.
pub struct FileBackedStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl FileBackedStore {
    /// Load the snapshot at `path`, or start empty if none exists yet.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    async fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(data)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileBackedStore {
    async fn get_session(&self, username: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.data.read().await.sessions.get(username).cloned())
    }

    async fn put_session(&self, session: Session) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        data.sessions.insert(session.username.clone(), session);
        self.persist(&data).await
    }

    async fn get_bridge(&self, call_id: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .bridges
            .get(call_id)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.bridge_id.clone()))
    }

    async fn put_bridge(
        &self,
        call_id: &str,
        bridge_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        // Expired entries are swept opportunistically on write.
        data.bridges.retain(|_, entry| entry.is_live());
        data.bridges.insert(
            call_id.to_string(),
            CorrelationEntry {
                bridge_id: bridge_id.to_string(),
                expires_at: Utc::now() + ttl,
            },
        );
        self.persist(&data).await
    }

    async fn take_bridge(&self, call_id: &str) -> Result<Option<String>, StoreError> {
        let mut data = self.data.write().await;
        let removed = data.bridges.remove(call_id);
        let live = removed
            .filter(|entry| entry.is_live())
            .map(|entry| entry.bridge_id);
        if live.is_some() {
            self.persist(&data).await?;
        }
        Ok(live)
    }
}
