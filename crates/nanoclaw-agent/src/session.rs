//! Session store: keyed transcripts, one override pointer per channel identity
//!
//! Lock order is always `overrides` before a session slot. Appends take only
//! the slot, so different sessions never contend and appends to one session
//! are serialized by its mutex. Creation is serialized by its own lock and
//! writes the new file before the session becomes visible.

use crate::persist::JsonlStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nanoclaw_core::{
    ChannelIdentity, Error, NewSession, Result, SessionKey, SessionSummary, Turn, TurnRole,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TITLE_MAX_CHARS: usize = 60;

#[derive(Clone, Debug)]
pub struct Session {
    pub key: SessionKey,
    pub identity: ChannelIdentity,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transcript: Vec<Turn>,
    /// Only meaningful on snapshots handed out by the store.
    pub is_active_override: bool,
}

impl Session {
    pub fn new(key: SessionKey, identity: ChannelIdentity, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            identity,
            title,
            created_at: now,
            updated_at: now,
            transcript: Vec::new(),
            is_active_override: false,
        }
    }

    /// Explicit title, else the first user message, else the creation time.
    pub fn display_title(&self) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }
        self.transcript
            .iter()
            .filter(|t| t.role == TurnRole::User)
            .find_map(|t| t.as_text().and_then(title_from_text))
            .unwrap_or_else(|| format!("Session {}", self.created_at.format("%Y-%m-%d %H:%M")))
    }

    pub fn summary(&self, active: bool) -> SessionSummary {
        SessionSummary {
            key: self.key.clone(),
            title: self.display_title(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            turns: self.transcript.len(),
            active,
        }
    }
}

type Slot = Arc<Mutex<Session>>;

pub struct SessionStore {
    sessions: DashMap<SessionKey, Slot>,
    overrides: Mutex<HashMap<ChannelIdentity, SessionKey>>,
    creating: Mutex<()>,
    disk: Option<JsonlStore>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self {
            sessions: DashMap::new(),
            overrides: Mutex::new(HashMap::new()),
            creating: Mutex::new(()),
            disk: None,
        }
    }

    /// Open a store backed by JSONL files in `dir`, loading what is already there.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let disk = JsonlStore::open(dir)?;
        let sessions = DashMap::new();
        for session in disk.load_all() {
            sessions.insert(session.key.clone(), Arc::new(Mutex::new(session)));
        }

        let mut overrides = disk.load_overrides();
        let before = overrides.len();
        overrides.retain(|identity, key| identity.owns(key) && sessions.contains_key(key));
        if overrides.len() != before {
            warn!(
                "dropped {} dangling session overrides",
                before - overrides.len()
            );
            disk.save_overrides(&overrides)?;
        }

        info!(
            "session store opened at {} ({} sessions, {} overrides)",
            disk.dir().display(),
            sessions.len(),
            overrides.len()
        );
        Ok(Self {
            sessions,
            overrides: Mutex::new(overrides),
            creating: Mutex::new(()),
            disk: Some(disk),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn slot(&self, key: &SessionKey) -> Option<Slot> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    fn persist_overrides(&self, overrides: &HashMap<ChannelIdentity, SessionKey>) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.save_overrides(overrides),
            None => Ok(()),
        }
    }

    /// Insert `session` under its key unless the key is taken. Persisted
    /// before it becomes visible; the file is written on the blocking pool
    /// with no map lock held.
    async fn insert_vacant(&self, session: Session) -> Result<std::result::Result<Slot, Slot>> {
        let key = session.key.clone();
        let _creating = self.creating.lock().await;
        if let Some(existing) = self.slot(&key) {
            return Ok(Err(existing));
        }
        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            let snapshot = session.clone();
            tokio::task::spawn_blocking(move || disk.write(&snapshot))
                .await
                .map_err(|e| Error::Internal(format!("session write task failed: {}", e)))??;
        }
        let slot = Arc::new(Mutex::new(session));
        self.sessions.insert(key, slot.clone());
        Ok(Ok(slot))
    }

    /// Create a session under `identity`. Never touches the override.
    pub async fn create(
        &self,
        identity: &ChannelIdentity,
        params: NewSession,
    ) -> Result<SessionSummary> {
        let title = params
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .or_else(|| params.seed.as_deref().and_then(title_from_text));

        let requested = params.key.as_deref().map(str::trim).filter(|k| !k.is_empty());
        let slot = match requested {
            Some(raw) => {
                let key = requested_key(identity, raw)?;
                let session = Session::new(key.clone(), identity.clone(), title);
                match self.insert_vacant(session).await? {
                    Ok(slot) => {
                        info!(session = %key, identity = %identity, "session created");
                        slot
                    }
                    Err(existing) if params.allow_existing => {
                        debug!(session = %key, "reusing existing session");
                        existing
                    }
                    Err(_) => return Err(Error::DuplicateName(key.to_string())),
                }
            }
            None => self.create_generated(identity, title).await?,
        };

        let summary = slot.lock().await.summary(false);
        let active = self.overrides.lock().await.get(identity) == Some(&summary.key);
        Ok(SessionSummary { active, ..summary })
    }

    /// `channel:chat:YYYYMMDD-HHMMSS`, suffixed `-2`, `-3`, ... on collision.
    async fn create_generated(
        &self,
        identity: &ChannelIdentity,
        title: Option<String>,
    ) -> Result<Slot> {
        let base = format!("{}:{}", identity, Utc::now().format("%Y%m%d-%H%M%S"));
        let mut n = 1usize;
        loop {
            let key = if n == 1 {
                SessionKey::new(base.clone())
            } else {
                SessionKey::new(format!("{}-{}", base, n))
            };
            let session = Session::new(key.clone(), identity.clone(), title.clone());
            if let Ok(slot) = self.insert_vacant(session).await? {
                info!(session = %key, identity = %identity, "session created");
                return Ok(slot);
            }
            n += 1;
        }
    }

    /// Resolve a full key or bare name to an existing session owned by `identity`.
    fn lookup(&self, identity: &ChannelIdentity, raw: &str) -> Result<SessionKey> {
        let raw = raw.trim();
        let key = if raw.contains(':') {
            SessionKey::new(raw)
        } else {
            SessionKey::new(format!("{}:{}", identity, slugify(raw)))
        };
        if identity.owns(&key) && self.sessions.contains_key(&key) {
            Ok(key)
        } else {
            Err(Error::session_not_found(raw))
        }
    }

    /// Point `identity` at an existing session. Replaces any previous override.
    pub async fn switch(&self, identity: &ChannelIdentity, raw: &str) -> Result<SessionSummary> {
        let mut overrides = self.overrides.lock().await;
        let key = self.lookup(identity, raw)?;
        let slot = self
            .slot(&key)
            .ok_or_else(|| Error::session_not_found(raw))?;

        let previous = overrides.insert(identity.clone(), key.clone());
        if let Err(e) = self.persist_overrides(&overrides) {
            match previous {
                Some(prev) => overrides.insert(identity.clone(), prev),
                None => overrides.remove(identity),
            };
            return Err(e);
        }
        drop(overrides);

        info!(identity = %identity, session = %key, "active session switched");
        let summary = slot.lock().await.summary(true);
        Ok(summary)
    }

    /// Clear the override for `identity`. Clearing nothing is fine.
    pub async fn reset(&self, identity: &ChannelIdentity) -> Result<()> {
        let mut overrides = self.overrides.lock().await;
        let previous = match overrides.remove(identity) {
            Some(prev) => prev,
            None => return Ok(()),
        };
        if let Err(e) = self.persist_overrides(&overrides) {
            overrides.insert(identity.clone(), previous);
            return Err(e);
        }
        info!(identity = %identity, "active session reset to default");
        Ok(())
    }

    /// Key of the session new turns from `identity` go to. Creates the
    /// default session on first use.
    pub async fn resolve_active_key(&self, identity: &ChannelIdentity) -> Result<SessionKey> {
        {
            let overrides = self.overrides.lock().await;
            if let Some(key) = overrides.get(identity) {
                if self.sessions.contains_key(key) {
                    return Ok(key.clone());
                }
                warn!(identity = %identity, session = %key, "override points at a missing session");
            }
        }

        let key = identity.default_session_key();
        let session = Session::new(key.clone(), identity.clone(), None);
        if self.insert_vacant(session).await?.is_ok() {
            info!(session = %key, "default session created");
        }
        Ok(key)
    }

    pub async fn resolve_active(&self, identity: &ChannelIdentity) -> Result<Session> {
        let key = self.resolve_active_key(identity).await?;
        self.get(&key)
            .await
            .ok_or_else(|| Error::session_not_found(key.as_str()))
    }

    /// The overriding session for `identity`, if any.
    pub async fn current(&self, identity: &ChannelIdentity) -> Option<SessionSummary> {
        let key = self.overrides.lock().await.get(identity).cloned()?;
        let slot = self.slot(&key)?;
        let summary = slot.lock().await.summary(true);
        Some(summary)
    }

    /// Sessions owned by `identity`, newest activity first.
    pub async fn list(&self, identity: &ChannelIdentity) -> Vec<SessionSummary> {
        let active = self.overrides.lock().await.get(identity).cloned();
        let slots: Vec<Slot> = self
            .sessions
            .iter()
            .filter(|e| identity.owns(e.key()))
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let session = slot.lock().await;
            out.push(session.summary(active.as_ref() == Some(&session.key)));
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.key.cmp(&b.key)));
        out
    }

    /// Snapshot of a session.
    pub async fn get(&self, key: &SessionKey) -> Option<Session> {
        let slot = self.slot(key)?;
        let mut snapshot = slot.lock().await.clone();
        snapshot.is_active_override =
            self.overrides.lock().await.get(&snapshot.identity) == Some(key);
        Some(snapshot)
    }

    pub async fn transcript(&self, key: &SessionKey) -> Result<Vec<Turn>> {
        let slot = self
            .slot(key)
            .ok_or_else(|| Error::session_not_found(key.as_str()))?;
        let transcript = slot.lock().await.transcript.clone();
        Ok(transcript)
    }

    /// Append one turn. Timestamps never go backwards within a transcript.
    /// If persisting fails the in-memory transcript is left as it was.
    pub async fn append(&self, key: &SessionKey, mut turn: Turn) -> Result<()> {
        let slot = self
            .slot(key)
            .ok_or_else(|| Error::session_not_found(key.as_str()))?;
        let mut session = slot.lock().await;

        if let Some(last) = session.transcript.last() {
            turn.timestamp = turn.timestamp.max(last.timestamp);
        }
        let previous_update = session.updated_at;
        session.updated_at = Utc::now().max(turn.timestamp);
        session.transcript.push(turn);

        if let Some(disk) = &self.disk {
            let result = match session.transcript.last() {
                Some(turn) => disk.append(&session, turn),
                None => Ok(()),
            };
            if let Err(e) = result {
                session.transcript.pop();
                session.updated_at = previous_update;
                warn!(session = %key, "append not persisted: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Empty a session's transcript, keeping its key and title.
    pub async fn clear(&self, key: &SessionKey) -> Result<()> {
        let slot = self
            .slot(key)
            .ok_or_else(|| Error::session_not_found(key.as_str()))?;
        let mut session = slot.lock().await;

        let old = std::mem::take(&mut session.transcript);
        let previous_update = session.updated_at;
        session.updated_at = Utc::now();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.write(&session) {
                session.transcript = old;
                session.updated_at = previous_update;
                return Err(e);
            }
        }
        info!(session = %key, dropped = old.len(), "session transcript cleared");
        Ok(())
    }

    /// Remove a session owned by `identity`, clearing any override pointing at it.
    pub async fn delete(&self, identity: &ChannelIdentity, raw: &str) -> Result<SessionKey> {
        let mut overrides = self.overrides.lock().await;
        let key = self.lookup(identity, raw)?;

        if let Some(disk) = &self.disk {
            disk.remove(&key)?;
        }
        self.sessions.remove(&key);

        if overrides.get(identity) == Some(&key) {
            overrides.remove(identity);
            if let Err(e) = self.persist_overrides(&overrides) {
                warn!(identity = %identity, "override cleared in memory only: {}", e);
            }
        }
        info!(identity = %identity, session = %key, "session deleted");
        Ok(key)
    }
}

/// Key for an explicit create request: full keys are taken verbatim but must
/// belong to `identity`, bare names are slugified under it.
fn requested_key(identity: &ChannelIdentity, raw: &str) -> Result<SessionKey> {
    if raw.contains(':') {
        let key = SessionKey::new(raw);
        if !identity.owns(&key) {
            return Err(Error::invalid_arguments(
                "session_manage",
                Some("session_key".into()),
                format!("key '{}' does not belong to {}", raw, identity),
            ));
        }
        Ok(key)
    } else {
        Ok(SessionKey::new(format!("{}:{}", identity, slugify(raw))))
    }
}

/// Lowercase, `[a-z0-9-]` only, whitespace to dashes, no repeated or edge dashes.
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().to_lowercase().chars() {
        let c = if c.is_whitespace() { '-' } else { c };
        if c == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "session".to_string()
    } else {
        out
    }
}

/// First non-empty line, cut to sixty characters.
fn title_from_text(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() <= TITLE_MAX_CHARS {
        return Some(line.to_string());
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS - 3).collect();
    Some(format!("{}...", cut.trim_end()))
}
