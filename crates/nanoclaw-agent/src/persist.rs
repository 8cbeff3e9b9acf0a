//! JSONL session files and the active-override map
//!
//! One file per session under the sessions directory:
//!
//! ```text
//! {"_type":"metadata","key":"cli:local:research","channel":"cli","chat_id":"local","title":"Research","created_at":"...","updated_at":"..."}
//! {"role":"user","content":{"type":"text","text":"hi"},"timestamp":"..."}
//! {"role":"assistant","content":{"type":"text","text":"hello"},"timestamp":"..."}
//! ```
//!
//! Turns are appended one line at a time. Anything that changes the metadata
//! line rewrites the whole file through a temp file and a rename, so a reader
//! never sees half a rewrite. `_active.json` maps `channel:chat_id` to the
//! overriding session key.

use crate::session::Session;
use chrono::{DateTime, Utc};
use nanoclaw_core::{ChannelIdentity, Error, Result, SessionKey, Turn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const METADATA_TYPE: &str = "metadata";
const ACTIVE_FILE: &str = "_active.json";
const SESSION_EXT: &str = "jsonl";

#[derive(Serialize, Deserialize)]
struct MetadataLine {
    #[serde(rename = "_type")]
    kind: String,
    key: SessionKey,
    channel: String,
    chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MetadataLine {
    fn of(session: &Session) -> Self {
        Self {
            kind: METADATA_TYPE.to_string(),
            key: session.key.clone(),
            channel: session.identity.channel.clone(),
            chat_id: session.identity.chat_id.clone(),
            title: session.title.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for a key. `:` becomes `_`; `_`, `%` and anything else outside
    /// `[A-Za-z0-9.-]` is percent-encoded byte by byte, so distinct keys
    /// never share a file.
    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        let mut safe = String::with_capacity(key.as_str().len());
        for c in key.as_str().chars() {
            if c == ':' {
                safe.push('_');
            } else if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                safe.push(c);
            } else {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    safe.push_str(&format!("%{:02X}", b));
                }
            }
        }
        self.dir.join(format!("{}.{}", safe, SESSION_EXT))
    }

    /// Rewrite a whole session file atomically.
    pub fn write(&self, session: &Session) -> Result<()> {
        let mut out = serde_json::to_string(&MetadataLine::of(session))?;
        out.push('\n');
        for turn in &session.transcript {
            out.push_str(&serde_json::to_string(turn)?);
            out.push('\n');
        }
        write_atomic(&self.path_for(&session.key), out.as_bytes())
    }

    /// Append the last turn of `session`. Falls back to a full rewrite when the
    /// file has gone missing underneath us.
    pub fn append(&self, session: &Session, turn: &Turn) -> Result<()> {
        let path = self.path_for(&session.key);
        let mut line = serde_json::to_string(turn)?;
        line.push('\n');
        match OpenOptions::new().append(true).open(&path) {
            Ok(mut f) => {
                f.write_all(line.as_bytes())?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(session = %session.key, "session file missing, rewriting");
                self.write(session)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, key: &SessionKey) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every session file. Unreadable files are skipped with a warning.
    pub fn load_all(&self) -> Vec<Session> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read sessions dir {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut sessions = Vec::new();
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            if path.extension().map_or(true, |ext| ext != SESSION_EXT) {
                continue;
            }
            match load_file(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("skipping session file {}: {}", path.display(), e),
            }
        }
        debug!("loaded {} sessions from {}", sessions.len(), self.dir.display());
        sessions
    }

    pub fn save_overrides(&self, overrides: &HashMap<ChannelIdentity, SessionKey>) -> Result<()> {
        let map: BTreeMap<String, &str> = overrides
            .iter()
            .map(|(id, key)| (id.to_string(), key.as_str()))
            .collect();
        let body = serde_json::to_vec_pretty(&map)?;
        write_atomic(&self.dir.join(ACTIVE_FILE), &body)
    }

    pub fn load_overrides(&self) -> HashMap<ChannelIdentity, SessionKey> {
        let path = self.dir.join(ACTIVE_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                return HashMap::new();
            }
        };
        let map: BTreeMap<String, String> = match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!("ignoring malformed {}: {}", path.display(), e);
                return HashMap::new();
            }
        };
        map.into_iter()
            .filter_map(|(id, key)| match id.parse::<ChannelIdentity>() {
                Ok(identity) => Some((identity, SessionKey::new(key))),
                Err(e) => {
                    warn!("ignoring override entry: {}", e);
                    None
                }
            })
            .collect()
    }
}

fn load_file(path: &Path) -> Result<Session> {
    let raw = fs::read_to_string(path)?;
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

    let first = lines
        .next()
        .ok_or_else(|| Error::Internal("empty session file".into()))?;
    let meta: MetadataLine = serde_json::from_str(first)?;
    if meta.kind != METADATA_TYPE {
        return Err(Error::Internal(format!(
            "first line is '{}', not metadata",
            meta.kind
        )));
    }

    let mut transcript = Vec::new();
    for (n, line) in lines.enumerate() {
        match serde_json::from_str::<Turn>(line) {
            Ok(turn) => transcript.push(turn),
            // A torn final line from a crash mid-append.
            Err(e) => warn!("{}: dropping line {}: {}", path.display(), n + 2, e),
        }
    }

    // Appends don't touch the metadata line, so the last turn may be newer.
    let updated_at = transcript
        .last()
        .map(|t| t.timestamp.max(meta.updated_at))
        .unwrap_or(meta.updated_at);

    Ok(Session {
        key: meta.key,
        identity: ChannelIdentity::new(meta.channel, meta.chat_id),
        title: meta.title,
        created_at: meta.created_at,
        updated_at,
        transcript,
        is_active_override: false,
    })
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(body)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
