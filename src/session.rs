//! Export checkpoints and resume decisions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::settings::SettingsFingerprint;

/// Key prefix for persisted export sessions.
const SESSION_KEY_PREFIX: &str = "cardsheet:export:session";

/// Session TTL in seconds (7 days).
const SESSION_TTL_SECONDS: u64 = 7 * 86400;

/// Persisted progress of an interrupted export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSession {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Serialized chunk documents, in chunk order.
    #[serde(with = "base64_chunks")]
    pub completed_chunks: Vec<Vec<u8>>,
    pub total_chunks: usize,
    pub last_completed_chunk_index: Option<usize>,
    pub fingerprint: SettingsFingerprint,
}

impl ExportSession {
    pub fn new(
        id: String,
        completed_chunks: Vec<Vec<u8>>,
        total_chunks: usize,
        fingerprint: SettingsFingerprint,
    ) -> Self {
        let last_completed_chunk_index = completed_chunks.len().checked_sub(1);
        Self {
            id,
            timestamp: Utc::now(),
            completed_chunks,
            total_chunks,
            last_completed_chunk_index,
            fingerprint,
        }
    }

    /// First chunk a resumed run has to render.
    pub fn next_chunk_index(&self) -> usize {
        self.last_completed_chunk_index.map_or(0, |index| index + 1)
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Where a run starts: reused chunk documents and the session to update.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub session_id: String,
    pub completed_chunks: Vec<Vec<u8>>,
}

impl ResumePoint {
    pub fn fresh() -> Self {
        Self::fresh_as(new_session_id())
    }

    /// A fresh start that checkpoints under `session_id`.
    pub fn fresh_as(session_id: String) -> Self {
        Self {
            session_id,
            completed_chunks: Vec::new(),
        }
    }

    pub fn start_chunk(&self) -> usize {
        self.completed_chunks.len()
    }

    pub fn is_resumed(&self) -> bool {
        !self.completed_chunks.is_empty()
    }
}

/// Why a stored session cannot be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeRejection {
    FingerprintMismatch,
    /// The record claims more completed chunks than the current plan has,
    /// or its cursor disagrees with the stored chunk list.
    Inconsistent,
}

/// Decides whether `session` can seed a run with `fingerprint` and `total_chunks`.
pub fn plan_resume(
    session: ExportSession,
    fingerprint: &SettingsFingerprint,
    total_chunks: usize,
) -> Result<ResumePoint, ResumeRejection> {
    if session.fingerprint != *fingerprint {
        return Err(ResumeRejection::FingerprintMismatch);
    }
    let completed = session.completed_chunks.len();
    if session.next_chunk_index() != completed || completed > total_chunks {
        return Err(ResumeRejection::Inconsistent);
    }
    Ok(ResumePoint {
        session_id: session.id,
        completed_chunks: session.completed_chunks,
    })
}

/// Storage for export checkpoints, keyed by session id.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &str) -> impl Future<Output = Result<Option<ExportSession>>> + Send;

    fn save(&self, session: &ExportSession) -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Loads the session `id` and turns it into a resume point.
///
/// A missing session, a fingerprint mismatch or an inconsistent record
/// falls back to a fresh run; unusable records are deleted.
pub async fn resolve_resume<S: SessionStore>(
    store: &S,
    id: Option<&str>,
    fingerprint: &SettingsFingerprint,
    total_chunks: usize,
) -> ResumePoint {
    let Some(id) = id else {
        return ResumePoint::fresh();
    };

    let session = match store.load(id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            info!(session_id = %id, "No stored session to resume, starting fresh");
            return ResumePoint::fresh();
        }
        Err(e) => {
            warn!(session_id = %id, error = %format!("{:#}", e), "Failed to load session, starting fresh");
            return ResumePoint::fresh();
        }
    };

    match plan_resume(session, fingerprint, total_chunks) {
        Ok(point) => {
            info!(
                session_id = %point.session_id,
                completed_chunks = point.completed_chunks.len(),
                total_chunks,
                "Resuming export session"
            );
            point
        }
        Err(reason) => {
            warn!(
                session_id = %id,
                reason = ?reason,
                "Stored session does not match current export, discarding"
            );
            if let Err(e) = store.delete(id).await {
                warn!(session_id = %id, error = %format!("{:#}", e), "Failed to discard session");
            }
            ResumePoint::fresh()
        }
    }
}

/// In-process session store.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, ExportSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<ExportSession>> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn save(&self, session: &ExportSession) -> Result<()> {
        self.sessions
            .lock()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.lock().await.remove(id);
        Ok(())
    }
}

/// Redis-backed session store; sessions are JSON values with a TTL.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(id: &str) -> String {
        format!("{}:{}", SESSION_KEY_PREFIX, id)
    }
}

impl SessionStore for RedisSessionStore {
    async fn load(&self, id: &str) -> Result<Option<ExportSession>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(Self::key(id))
            .await
            .context("Failed to get export session")?;

        match json {
            Some(json) => {
                let session = serde_json::from_str(&json)
                    .context("Failed to deserialize export session")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session: &ExportSession) -> Result<()> {
        let json = serde_json::to_string(session).context("Failed to serialize export session")?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::key(&session.id), json, SESSION_TTL_SECONDS)
            .await
            .context("Failed to store export session")?;

        debug!(
            session_id = %session.id,
            completed_chunks = session.completed_chunks.len(),
            "Stored export session"
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(id))
            .await
            .context("Failed to delete export session")?;
        Ok(())
    }
}

mod base64_chunks {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chunks: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(chunks.iter().map(|chunk| STANDARD.encode(chunk)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|chunk| STANDARD.decode(chunk).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ExportSettings;
    use pretty_assertions::assert_eq;

    fn session(chunks: usize, settings: &ExportSettings) -> ExportSession {
        ExportSession::new(
            "session-1".to_string(),
            (0..chunks).map(|i| vec![i as u8; 3]).collect(),
            4,
            settings.fingerprint(),
        )
    }

    #[test]
    fn test_serde_round_trip_encodes_chunks() {
        let original = session(2, &ExportSettings::default());
        let json = serde_json::to_string(&original).unwrap();

        assert!(json.contains("\"AAAA\""));
        let decoded: ExportSession = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_plan_resume_match() {
        let settings = ExportSettings::default();
        let stored = session(2, &settings);
        assert_eq!(stored.last_completed_chunk_index, Some(1));

        let point = plan_resume(stored, &settings.fingerprint(), 4).unwrap();
        assert_eq!(point.session_id, "session-1");
        assert_eq!(point.start_chunk(), 2);
        assert_eq!(point.completed_chunks, vec![vec![0; 3], vec![1; 3]]);
    }

    #[test]
    fn test_plan_resume_mismatch() {
        let settings = ExportSettings::default();
        let stored = session(2, &settings);
        let changed = ExportSettings {
            dpi: 600,
            ..settings
        };

        assert_eq!(
            plan_resume(stored, &changed.fingerprint(), 4),
            Err(ResumeRejection::FingerprintMismatch)
        );
    }

    #[test]
    fn test_plan_resume_inconsistent() {
        let settings = ExportSettings::default();
        let mut stored = session(2, &settings);
        stored.last_completed_chunk_index = Some(5);
        assert_eq!(
            plan_resume(stored, &settings.fingerprint(), 4),
            Err(ResumeRejection::Inconsistent)
        );

        let stored = session(3, &settings);
        assert_eq!(
            plan_resume(stored, &settings.fingerprint(), 2),
            Err(ResumeRejection::Inconsistent)
        );
    }

    #[tokio::test]
    async fn test_resolve_resume_discards_mismatched_session() {
        let store = MemorySessionStore::new();
        let settings = ExportSettings::default();
        store.save(&session(1, &settings)).await.unwrap();

        let changed = ExportSettings {
            bleed_mm: 2.0,
            ..settings
        };
        let point = resolve_resume(&store, Some("session-1"), &changed.fingerprint(), 4).await;

        assert!(!point.is_resumed());
        assert_ne!(point.session_id, "session-1");
        assert!(store.load("session-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_resume_missing_session() {
        let store = MemorySessionStore::new();
        let settings = ExportSettings::default();

        let point = resolve_resume(&store, Some("gone"), &settings.fingerprint(), 4).await;
        assert_eq!(point.start_chunk(), 0);

        let point = resolve_resume(&store, None, &settings.fingerprint(), 4).await;
        assert_eq!(point.start_chunk(), 0);
    }

    // Requires a running Redis instance.
    // Run with: docker run -d -p 6379:6379 redis:7-alpine
    #[tokio::test]
    #[ignore]
    async fn test_redis_session_store() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let store = RedisSessionStore::new(conn);
        let stored = ExportSession {
            id: new_session_id(),
            ..session(1, &ExportSettings::default())
        };

        store.save(&stored).await.unwrap();
        assert_eq!(store.load(&stored.id).await.unwrap(), Some(stored.clone()));

        store.delete(&stored.id).await.unwrap();
        assert!(store.load(&stored.id).await.unwrap().is_none());
    }
}
