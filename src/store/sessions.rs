use super::validate_id;
use crate::session::{DecisionRecord, Session};
use anyhow::{bail, Result};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::warn;

/// Flat-file session store.
///
/// ```text
/// sessions/<id>/
///   state.yaml       # full Session
///   decisions.jsonl  # DecisionRecord per line, append-only
///   checkpoints/     # owned by CheckpointManager
/// ```
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn open_default() -> Self {
        Self::new(crate::paths::sessions_dir())
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn checkpoints_dir(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("checkpoints")
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        validate_id(&session.id)?;
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("state.yaml"), session.to_yaml()?)?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Session> {
        validate_id(id)?;
        let path = self.session_dir(id).join("state.yaml");
        if !path.exists() {
            bail!("session '{}' not found", id);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Session::from_yaml(&content)?)
    }

    /// All sessions, newest first.
    pub fn list(&self) -> Result<Vec<Session>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let state = entry.path().join("state.yaml");
            if !state.exists() {
                continue;
            }
            let content = fs::read_to_string(&state)?;
            match Session::from_yaml(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping corrupt session at {}: {}", state.display(), e),
            }
        }
        sessions.sort_by(|a, b| b.started_at_unix.cmp(&a.started_at_unix));
        Ok(sessions)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let dir = self.session_dir(id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    // ── Decision log ───────────────────────────────────────────────────

    pub fn append_decisions(&self, id: &str, records: &[DecisionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        validate_id(id)?;
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("decisions.jsonl"))?;
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        Ok(())
    }

    pub fn read_decisions(&self, id: &str) -> Result<Vec<DecisionRecord>> {
        validate_id(id)?;
        let path = self.session_dir(id).join("decisions.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DecisionRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping corrupt decision line: {}", e),
            }
        }
        Ok(records)
    }
}
