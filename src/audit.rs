// Tamper-evident audit log: append-only JSONL, one entry per line.
//
// Each entry carries `prev_hash` (SHA-256 of the previous stored line, or the
// zero hash for the first entry) and `hmac` (HMAC-SHA256 of the entry's
// canonical bytes — every field except the hmac itself — under the key from
// the credential store). Verification replays the file top-to-bottom and
// fails closed at the first discrepancy; once a break is detected all writes
// are refused until the operator acknowledges and the chain is rotated.

use crate::errors::{CoreError, CoreResult};
use anyhow::{Context, Result};
use fs2::FileExt;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Operator,
    Agent,
    Gate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub session_id: String,
    pub event_type: String,
    pub actor: Actor,
    pub details: serde_json::Value,
    pub prev_hash: String,
    pub hmac: String,
}

impl AuditEntry {
    /// Canonical bytes covered by the HMAC: the serialized entry with an
    /// empty hmac field. Field order is fixed by the struct definition.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.hmac = String::new();
        serde_json::to_vec(&unsigned).expect("audit entry serializes")
    }
}

fn hmac_hex(key: &[u8], bytes: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(bytes);
    hex::encode(mac.finalize().into_bytes())
}

fn line_hash(line: &str) -> String {
    hex::encode(Sha256::digest(line.as_bytes()))
}

/// Process-wide audit writer. One instance per process; the underlying file
/// is held under an exclusive advisory lock for the lifetime of the log.
pub struct AuditLog {
    path: PathBuf,
    state: Mutex<WriterState>,
    enabled: bool,
    chain_broken: AtomicBool,
}

struct WriterState {
    file: Option<File>,
    last_line_hash: String,
    key: Vec<u8>,
}

impl AuditLog {
    /// Open (or create) the chain file, take the writer lock, and recover
    /// the hash of the last stored line.
    pub fn open(path: PathBuf, key: Vec<u8>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        file.try_lock_exclusive()
            .context("audit log is locked by another process")?;

        let last_line_hash = last_line(&path)?
            .map(|l| line_hash(&l))
            .unwrap_or_else(|| ZERO_HASH.to_string());

        Ok(Self {
            path,
            state: Mutex::new(WriterState {
                file: Some(file),
                last_line_hash,
                key,
            }),
            enabled: true,
            chain_broken: AtomicBool::new(false),
        })
    }

    /// A no-op log for configurations with auditing disabled.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            state: Mutex::new(WriterState {
                file: None,
                last_line_hash: ZERO_HASH.to_string(),
                key: Vec::new(),
            }),
            enabled: false,
            chain_broken: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Refused with `ChainBreak` once a break has been
    /// detected and not yet acknowledged.
    pub fn append(
        &self,
        session_id: &str,
        event_type: &str,
        actor: Actor,
        details: serde_json::Value,
    ) -> CoreResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.chain_broken.load(Ordering::SeqCst) {
            return Err(CoreError::ChainBreak { entry: 0 });
        }

        let mut state = self.state.lock().expect("audit writer lock");
        let mut entry = AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            actor,
            details,
            prev_hash: state.last_line_hash.clone(),
            hmac: String::new(),
        };
        entry.hmac = hmac_hex(&state.key, &entry.canonical_bytes());

        let line = serde_json::to_string(&entry)?;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| CoreError::InvalidState("audit log not open".to_string()))?;
        writeln!(file, "{}", line).map_err(CoreError::Io)?;
        file.flush().map_err(CoreError::Io)?;
        state.last_line_hash = line_hash(&line);
        Ok(())
    }

    /// Walk the whole chain, recomputing `prev_hash` and `hmac` for every
    /// entry. Returns `(true, entries)` when intact, `(false, n)` with the
    /// count of entries checked before the first mismatch — and latches the
    /// broken flag so subsequent appends are refused.
    pub fn verify_chain(&self) -> Result<(bool, usize)> {
        if !self.enabled {
            return Ok((true, 0));
        }
        let key = self.state.lock().expect("audit writer lock").key.clone();
        let result = verify_chain_file(&self.path, &key)?;
        if !result.0 {
            self.chain_broken.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    /// Stream entries for one session (all sessions when `session_id` is
    /// `None`). Corrupt lines are skipped with a warning — query is a read
    /// surface, verification is `verify_chain`.
    pub fn query(&self, session_id: Option<&str>) -> Result<Vec<AuditEntry>> {
        if !self.enabled || !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => {
                    if session_id.map_or(true, |id| entry.session_id == id) {
                        out.push(entry);
                    }
                }
                Err(e) => warn!("Skipping corrupt audit line: {}", e),
            }
        }
        Ok(out)
    }

    /// Rotate the chain: append a marker entry under the old key, move the
    /// current file aside, and start a fresh chain under `new_key`. Clears
    /// a latched chain break (operator acknowledgement).
    pub fn rotate(&self, new_key: Vec<u8>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        // The marker is best-effort when rotating away from a broken chain.
        self.chain_broken.store(false, Ordering::SeqCst);
        let _ = self.append(
            "-",
            "chain_rotated",
            Actor::Operator,
            serde_json::json!({ "reason": "key_rotation" }),
        );

        let mut state = self.state.lock().expect("audit writer lock");
        // Release the lock on the old file before renaming it.
        state.file = None;
        let archived = self.path.with_file_name(format!(
            "audit-{}.jsonl",
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        ));
        std::fs::rename(&self.path, &archived)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        file.try_lock_exclusive()
            .context("audit log is locked by another process")?;
        state.file = Some(file);
        state.last_line_hash = ZERO_HASH.to_string();
        state.key = new_key;
        Ok(())
    }
}

/// Chain verification over a file, independent of any open writer.
pub fn verify_chain_file(path: &Path, key: &[u8]) -> Result<(bool, usize)> {
    if !path.exists() {
        return Ok((true, 0));
    }
    let file = File::open(path)?;
    let mut expected_prev = ZERO_HASH.to_string();
    let mut checked = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(_) => return Ok((false, checked)),
        };
        if entry.prev_hash != expected_prev {
            return Ok((false, checked));
        }
        let expected_hmac = hmac_hex(key, &entry.canonical_bytes());
        if expected_hmac != entry.hmac {
            return Ok((false, checked));
        }
        expected_prev = line_hash(&line);
        checked += 1;
    }
    Ok((true, checked))
}

fn last_line(path: &Path) -> Result<Option<String>> {
    let file = File::open(path)?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log(dir: &Path) -> AuditLog {
        AuditLog::open(dir.join("audit.jsonl"), b"test-key".to_vec()).unwrap()
    }

    #[test]
    fn append_and_verify() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());
        log.append("s1", "session_started", Actor::Operator, serde_json::json!({}))
            .unwrap();
        log.append("s1", "task_completed", Actor::Agent, serde_json::json!({"task": "t1"}))
            .unwrap();
        log.append("s1", "gate_decision", Actor::Gate, serde_json::json!({"approved": true}))
            .unwrap();
        assert_eq!(log.verify_chain().unwrap(), (true, 3));
    }

    #[test]
    fn first_entry_uses_zero_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());
        log.append("s1", "e", Actor::Agent, serde_json::json!({})).unwrap();
        let entries = log.query(None).unwrap();
        assert_eq!(entries[0].prev_hash, ZERO_HASH);
    }

    #[test]
    fn tampered_details_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        {
            let log = open_log(tmp.path());
            log.append("s1", "a", Actor::Agent, serde_json::json!({"n": 1})).unwrap();
            log.append("s1", "b", Actor::Agent, serde_json::json!({"n": 2})).unwrap();
            log.append("s1", "c", Actor::Agent, serde_json::json!({"n": 3})).unwrap();
        }
        // Tamper with the middle entry.
        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("\"n\":2", "\"n\":99");
        assert_ne!(content, tampered);
        std::fs::write(&path, tampered).unwrap();

        let (ok, checked) = verify_chain_file(&path, b"test-key").unwrap();
        assert!(!ok);
        assert_eq!(checked, 1); // first entry was fine
    }

    #[test]
    fn deleted_entry_breaks_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        {
            let log = open_log(tmp.path());
            for i in 0..3 {
                log.append("s1", "e", Actor::Agent, serde_json::json!({"i": i})).unwrap();
            }
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = content.lines().collect();
        lines.remove(1);
        std::fs::write(&path, lines.join("\n")).unwrap();

        let (ok, _) = verify_chain_file(&path, b"test-key").unwrap();
        assert!(!ok);
    }

    #[test]
    fn wrong_key_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        {
            let log = open_log(tmp.path());
            log.append("s1", "e", Actor::Agent, serde_json::json!({})).unwrap();
        }
        let (ok, checked) = verify_chain_file(&path, b"other-key").unwrap();
        assert!(!ok);
        assert_eq!(checked, 0);
    }

    #[test]
    fn chain_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        {
            let log = open_log(tmp.path());
            log.append("s1", "first", Actor::Agent, serde_json::json!({})).unwrap();
        }
        {
            let log = open_log(tmp.path());
            log.append("s1", "second", Actor::Agent, serde_json::json!({})).unwrap();
        }
        let (ok, checked) = verify_chain_file(&path, b"test-key").unwrap();
        assert!(ok);
        assert_eq!(checked, 2);
    }

    #[test]
    fn query_filters_by_session() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());
        log.append("s1", "e", Actor::Agent, serde_json::json!({})).unwrap();
        log.append("s2", "e", Actor::Agent, serde_json::json!({})).unwrap();
        log.append("s1", "e", Actor::Agent, serde_json::json!({})).unwrap();
        assert_eq!(log.query(Some("s1")).unwrap().len(), 2);
        assert_eq!(log.query(None).unwrap().len(), 3);
    }

    #[test]
    fn broken_chain_refuses_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let log = open_log(tmp.path());
        log.append("s1", "e", Actor::Agent, serde_json::json!({"v": 1})).unwrap();

        // Corrupt behind the writer's back, then verify.
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("\"v\":1", "\"v\":2")).unwrap();
        let (ok, _) = log.verify_chain().unwrap();
        assert!(!ok);

        let err = log
            .append("s1", "after", Actor::Agent, serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, CoreError::ChainBreak { .. }));
    }

    #[test]
    fn rotation_starts_fresh_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());
        log.append("s1", "before", Actor::Agent, serde_json::json!({})).unwrap();
        log.rotate(b"new-key".to_vec()).unwrap();
        log.append("s1", "after", Actor::Agent, serde_json::json!({})).unwrap();

        // New chain verifies under the new key and starts from zero hash.
        let (ok, checked) = verify_chain_file(log.path(), b"new-key").unwrap();
        assert!(ok);
        assert_eq!(checked, 1);
        let entries = log.query(None).unwrap();
        assert_eq!(entries[0].prev_hash, ZERO_HASH);

        // Old chain was archived with its marker entry intact.
        let archived: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("audit-"))
            .collect();
        assert_eq!(archived.len(), 1);
        let (ok, checked) = verify_chain_file(&archived[0].path(), b"test-key").unwrap();
        assert!(ok);
        assert_eq!(checked, 2); // original entry + rotation marker
    }

    #[test]
    fn disabled_log_is_noop() {
        let log = AuditLog::disabled();
        log.append("s1", "e", Actor::Agent, serde_json::json!({})).unwrap();
        assert_eq!(log.verify_chain().unwrap(), (true, 0));
        assert!(log.query(None).unwrap().is_empty());
    }
}
