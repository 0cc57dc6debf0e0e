//! Conversation sessions.
//!
//! A session's history is append-only and causally ordered. Each session sits
//! behind its own async mutex; the pipeline holds it for a whole turn, so two
//! queries on one conversation are serialized while different conversations
//! run in parallel. Retention of messages is the assembler's job, not the
//! session's; the registry only bounds how many sessions stay alive.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use campuskb_core::{Error, Message, Result, SessionConfig};

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>, user_id: Option<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            user_id,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message. Timestamps never go backwards.
    pub fn append(&mut self, mut message: Message) {
        if let Some(last) = self.messages.last() {
            message.timestamp = message.timestamp.max(last.timestamp);
        }
        self.updated_at = self.updated_at.max(message.timestamp);
        self.messages.push(message);
    }

    /// Adopt client-supplied history; only a session with no history of its own accepts it.
    pub fn seed(&mut self, history: &[Message]) -> bool {
        if !self.messages.is_empty() || history.is_empty() {
            return false;
        }
        for message in history {
            self.append(message.clone());
        }
        true
    }

    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A session plus its immutable owner, so ownership checks need no lock.
pub struct SessionHandle {
    id: String,
    user_id: Option<String>,
    last_used: parking_lot::Mutex<Instant>,
    session: Mutex<ConversationSession>,
}

impl SessionHandle {
    fn new(session: ConversationSession, now: Instant) -> Self {
        Self {
            id: session.id.clone(),
            user_id: session.user_id.clone(),
            last_used: parking_lot::Mutex::new(now),
            session: Mutex::new(session),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Exclusive access for one conversation turn.
    pub async fn lock(&self) -> MutexGuard<'_, ConversationSession> {
        self.session.lock().await
    }

    fn touch(&self, now: Instant) {
        let mut last = self.last_used.lock();
        *last = (*last).max(now);
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    fn authorize(&self, user_id: Option<&str>) -> Result<()> {
        if self.user_id.is_some() && self.user_id() != user_id {
            return Err(Error::InvalidRequest(format!(
                "conversation {} belongs to another user",
                self.id
            )));
        }
        Ok(())
    }
}

/// Live conversations, bounded by an idle ttl and a capacity.
///
/// A handle held outside the registry (a turn in flight) is never evicted.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    limits: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_limits(SessionConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_limits(limits: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
            clock,
        }
    }

    /// Get or create a session. A new id is generated when none is given.
    ///
    /// A session owned by one user cannot be opened by another.
    pub fn open(&self, id: Option<&str>, user_id: Option<&str>) -> Result<Arc<SessionHandle>> {
        let id = match id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let now = self.clock.now();
        let mut created = false;
        let handle = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(SessionHandle::new(
                    ConversationSession::new(id.clone(), user_id.map(str::to_string)),
                    now,
                ))
            })
            .clone();

        handle.authorize(user_id)?;
        handle.touch(now);
        if created {
            self.evict();
        }
        Ok(handle)
    }

    /// An existing session, if `user_id` may read it.
    pub fn lookup(&self, id: &str, user_id: Option<&str>) -> Result<Arc<SessionHandle>> {
        let handle = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))?;
        handle.authorize(user_id)?;
        Ok(handle)
    }

    /// Fails if `id` names a live session that `user_id` does not own.
    /// Creates nothing.
    pub fn check_owner(&self, id: &str, user_id: Option<&str>) -> Result<()> {
        match self.get(id) {
            Some(handle) => handle.authorize(user_id),
            None => Ok(()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|h| h.clone())
    }

    /// Give back a handle whose turn produced no reply. A session that is
    /// still empty and that nobody else holds is dropped again.
    pub fn release(&self, handle: Arc<SessionHandle>) {
        let removed = self.sessions.remove_if(&handle.id, |_, registered| {
            Arc::ptr_eq(registered, &handle)
                && Arc::strong_count(registered) == 2
                && handle
                    .session
                    .try_lock()
                    .map(|s| s.is_empty())
                    .unwrap_or(false)
        });
        if removed.is_some() {
            debug!("Dropped unused conversation {}", handle.id);
        }
    }

    /// Drop idle sessions, then the least recently used ones above capacity.
    pub fn evict(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.limits.idle_ttl;
        let before = self.sessions.len();

        self.sessions.retain(|_, handle| {
            Arc::strong_count(handle) > 1 || now.saturating_duration_since(handle.last_used()) < ttl
        });

        let excess = self.sessions.len().saturating_sub(self.limits.max_sessions);
        if excess > 0 {
            let mut idle: Vec<(Instant, String)> = self
                .sessions
                .iter()
                .filter(|e| Arc::strong_count(e.value()) == 1)
                .map(|e| (e.value().last_used(), e.key().clone()))
                .collect();
            idle.sort();
            for (_, id) in idle.into_iter().take(excess) {
                self.sessions
                    .remove_if(&id, |_, handle| Arc::strong_count(handle) == 1);
            }
        }

        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!("Evicted {} conversations, {} live", evicted, self.sessions.len());
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copy of every non-empty session, waiting for in-flight turns to finish.
    pub async fn snapshot(&self) -> Vec<ConversationSession> {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = handle.lock().await;
            if !session.is_empty() {
                sessions.push(session.clone());
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Write the snapshot to a sibling temp file, then rename it into place.
    pub async fn save(&self, path: &Path) -> Result<usize> {
        self.evict();
        let sessions = self.snapshot().await;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&sessions)?)?;
        std::fs::rename(&tmp, path)?;
        info!("Saved {} conversations to {}", sessions.len(), path.display());
        Ok(sessions.len())
    }

    /// Load a snapshot. A missing file yields an empty registry; an
    /// unreadable one is moved aside and also yields an empty registry.
    pub fn load(path: &Path, limits: SessionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = Self::with_limits(limits, clock);
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(registry),
            Err(e) => return Err(e.into()),
        };
        let sessions: Vec<ConversationSession> = match serde_json::from_str(&data) {
            Ok(sessions) => sessions,
            Err(e) => {
                let aside = path.with_extension("json.corrupt");
                warn!(
                    "Ignoring unreadable conversation snapshot {} ({}); moved to {}",
                    path.display(),
                    e,
                    aside.display()
                );
                if let Err(e) = std::fs::rename(path, &aside) {
                    warn!("Could not move {} aside: {}", path.display(), e);
                }
                return Ok(registry);
            }
        };
        let now = registry.clock.now();
        for session in sessions {
            registry
                .sessions
                .insert(session.id.clone(), Arc::new(SessionHandle::new(session, now)));
        }
        registry.evict();
        info!("Loaded {} conversations from {}", registry.len(), path.display());
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::clock::ManualClock;

    #[test]
    fn test_append_keeps_causal_order() {
        let mut session = ConversationSession::new("c1", None);
        let mut first = Message::user("first");
        first.timestamp = 2_000;
        let mut second = Message::assistant("second");
        second.timestamp = 1_000;
        session.append(first);
        session.append(second);
        assert_eq!(session.messages[1].timestamp, 2_000);
        assert_eq!(session.messages[1].content, "second");
    }

    #[test]
    fn test_seed_only_when_empty() {
        let mut session = ConversationSession::new("c1", None);
        assert!(session.seed(&[Message::user("hi"), Message::assistant("hello")]));
        assert!(!session.seed(&[Message::user("other")]));
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn test_open_creates_and_enforces_owner() {
        let registry = SessionRegistry::new();
        let generated = registry.open(None, None).unwrap();
        assert!(!generated.id().is_empty());

        let owned = registry.open(Some("c1"), Some("alice")).unwrap();
        assert_eq!(owned.user_id(), Some("alice"));
        assert!(registry.open(Some("c1"), Some("alice")).is_ok());
        assert!(matches!(
            registry.open(Some("c1"), Some("bob")),
            Err(Error::InvalidRequest(_))
        ));
        assert!(registry.open(Some("c1"), None).is_err());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_turns_on_one_session_are_serialized() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..10 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let handle = registry.open(Some("shared"), None).unwrap();
                let mut session = handle.lock().await;
                session.append(Message::user(format!("q{}", i)));
                tokio::task::yield_now().await;
                session.append(Message::assistant(format!("a{}", i)));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let handle = registry.get("shared").unwrap();
        let session = handle.lock().await;
        assert_eq!(session.len(), 20);
        for pair in session.messages.chunks(2) {
            assert_eq!(pair[0].content[1..], pair[1].content[1..]);
        }
    }

    fn limited(max_sessions: usize) -> (SessionRegistry, ManualClock) {
        let clock = ManualClock::new();
        let limits = SessionConfig {
            idle_ttl: Duration::from_secs(60),
            max_sessions,
        };
        (SessionRegistry::with_limits(limits, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_idle_sessions_expire() {
        let (registry, clock) = limited(100);
        drop(registry.open(Some("old"), None).unwrap());
        clock.advance(Duration::from_secs(45));
        drop(registry.open(Some("recent"), None).unwrap());
        clock.advance(Duration::from_secs(20));

        assert_eq!(registry.evict(), 1);
        assert!(registry.get("old").is_none());
        assert!(registry.get("recent").is_some());
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let (registry, clock) = limited(2);
        for id in ["a", "b"] {
            drop(registry.open(Some(id), None).unwrap());
            clock.advance(Duration::from_secs(1));
        }
        // Touching "a" makes "b" the oldest.
        drop(registry.open(Some("a"), None).unwrap());
        clock.advance(Duration::from_secs(1));
        drop(registry.open(Some("c"), None).unwrap());

        assert_eq!(registry.len(), 2);
        assert!(registry.get("b").is_none());
        assert!(registry.get("a").is_some());
    }

    #[test]
    fn test_sessions_in_use_survive_eviction() {
        let (registry, clock) = limited(1);
        let held = registry.open(Some("held"), None).unwrap();
        clock.advance(Duration::from_secs(120));
        let _other = registry.open(Some("other"), None).unwrap();

        assert_eq!(registry.evict(), 0);
        assert!(registry.get(held.id()).is_some());
    }

    #[tokio::test]
    async fn test_release_drops_only_unused_empty_sessions() {
        let registry = SessionRegistry::new();
        let fresh = registry.open(Some("fresh"), None).unwrap();
        registry.release(fresh);
        assert!(registry.get("fresh").is_none());

        let used = registry.open(Some("used"), None).unwrap();
        used.lock().await.append(Message::user("hi"));
        registry.release(used);
        assert!(registry.get("used").is_some());

        let first = registry.open(Some("shared"), None).unwrap();
        let second = registry.open(Some("shared"), None).unwrap();
        registry.release(first);
        assert!(registry.get("shared").is_some());
        drop(second);
    }

    #[test]
    fn test_lookup_checks_owner() {
        let registry = SessionRegistry::new();
        registry.open(Some("c1"), Some("alice")).unwrap();
        assert!(registry.lookup("c1", Some("alice")).is_ok());
        assert!(matches!(
            registry.lookup("c1", Some("bob")),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(registry.lookup("c1", None), Err(Error::InvalidRequest(_))));
        assert!(matches!(registry.lookup("nope", None), Err(Error::NotFound(_))));

        assert!(registry.check_owner("c1", Some("alice")).is_ok());
        assert!(registry.check_owner("c1", Some("bob")).is_err());
        assert!(registry.check_owner("nope", Some("bob")).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");

        let registry = SessionRegistry::new();
        let handle = registry.open(Some("c1"), Some("alice")).unwrap();
        handle.lock().await.append(Message::user("when do labs start"));
        drop(registry.open(Some("empty"), None).unwrap());
        assert_eq!(registry.save(&path).await.unwrap(), 1);
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = SessionRegistry::load(&path, SessionConfig::default(), Arc::new(SystemClock))
            .unwrap();
        let handle = loaded.get("c1").unwrap();
        assert_eq!(handle.user_id(), Some("alice"));
        assert_eq!(handle.lock().await.history()[0].content, "when do labs start");
        assert!(loaded.get("empty").is_none());

        let empty = SessionRegistry::load(
            &dir.path().join("absent.json"),
            SessionConfig::default(),
            Arc::new(SystemClock),
        )
        .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");
        std::fs::write(&path, "[{\"id\": \"c1\", \"messa").unwrap();

        let registry =
            SessionRegistry::load(&path, SessionConfig::default(), Arc::new(SystemClock)).unwrap();
        assert!(registry.is_empty());
        assert!(!path.exists());
        assert!(path.with_extension("json.corrupt").exists());
    }
}
