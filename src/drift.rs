// Drift monitor: detects external modification of the real workspace while a
// session runs against its stale shadow.
//
// A baseline fingerprint (mtime + size, plus a content hash for files under
// the threshold) is captured at session start; periodic re-fingerprints
// classify the delta. MEDIUM drift warns in the decision log; HIGH pauses
// the session. The baseline also feeds promotion conflict detection.

use crate::sandbox::walk_files;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub mtime_unix: u64,
    pub size: u64,
    /// Present for files at or under the hash threshold.
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl DriftReport {
    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    pub fn is_drifted(&self) -> bool {
        self.change_count() > 0
    }

    /// Severity by count and kind: deletions and broad churn are HIGH,
    /// content modifications MEDIUM, a few new files LOW.
    pub fn severity(&self) -> Option<DriftSeverity> {
        if !self.is_drifted() {
            return None;
        }
        if !self.removed.is_empty() || self.change_count() > 5 {
            return Some(DriftSeverity::High);
        }
        if !self.modified.is_empty() || self.change_count() > 2 {
            return Some(DriftSeverity::Medium);
        }
        Some(DriftSeverity::Low)
    }

    /// Paths that changed in any way since the baseline.
    pub fn changed_paths(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftMonitor {
    workspace: PathBuf,
    hash_threshold_bytes: u64,
    baseline: BTreeMap<String, FileFingerprint>,
}

impl DriftMonitor {
    /// Capture the baseline fingerprint of the workspace.
    pub fn baseline(workspace: &Path, hash_threshold_bytes: u64) -> Result<Self> {
        let baseline = fingerprint_tree(workspace, hash_threshold_bytes)?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
            hash_threshold_bytes,
            baseline,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Re-fingerprint and classify what changed since the baseline.
    pub fn check(&self) -> Result<DriftReport> {
        let current = fingerprint_tree(&self.workspace, self.hash_threshold_bytes)?;
        let mut report = DriftReport::default();

        for (path, print) in &current {
            match self.baseline.get(path) {
                None => report.added.push(path.clone()),
                Some(base) => {
                    if fingerprints_differ(base, print) {
                        report.modified.push(path.clone());
                    }
                }
            }
        }
        for path in self.baseline.keys() {
            if !current.contains_key(path) {
                report.removed.push(path.clone());
            }
        }
        Ok(report)
    }

    /// Did this specific workspace path change since the baseline?
    /// Used by the promotion diff for per-file conflict detection.
    pub fn path_changed(&self, rel: &str) -> Result<bool> {
        let full = self.workspace.join(rel);
        let base = self.baseline.get(rel);
        if !full.is_file() {
            // present at baseline, gone now → changed
            return Ok(base.is_some());
        }
        let print = fingerprint_file(&full, self.hash_threshold_bytes)?;
        Ok(match base {
            None => true, // new since baseline
            Some(b) => fingerprints_differ(b, &print),
        })
    }
}

fn fingerprints_differ(a: &FileFingerprint, b: &FileFingerprint) -> bool {
    if a.size != b.size {
        return true;
    }
    match (&a.content_hash, &b.content_hash) {
        // With content hashes available, mtime churn alone is not drift.
        (Some(ha), Some(hb)) => ha != hb,
        _ => a.mtime_unix != b.mtime_unix,
    }
}

fn fingerprint_file(path: &Path, hash_threshold: u64) -> Result<FileFingerprint> {
    let metadata = std::fs::metadata(path)?;
    let mtime_unix = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let size = metadata.len();
    let content_hash = if size <= hash_threshold {
        Some(hex::encode(Sha256::digest(std::fs::read(path)?)))
    } else {
        None
    };
    Ok(FileFingerprint {
        mtime_unix,
        size,
        content_hash,
    })
}

fn fingerprint_tree(root: &Path, hash_threshold: u64) -> Result<BTreeMap<String, FileFingerprint>> {
    let mut map = BTreeMap::new();
    for file in walk_files(root) {
        let rel = file
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| file.to_string_lossy().to_string());
        map.insert(rel, fingerprint_file(&file, hash_threshold)?);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha\n").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "beta\n").unwrap();
        tmp
    }

    #[test]
    fn no_drift_when_untouched() {
        let ws = workspace();
        let monitor = DriftMonitor::baseline(ws.path(), 1024 * 1024).unwrap();
        let report = monitor.check().unwrap();
        assert!(!report.is_drifted());
        assert_eq!(report.severity(), None);
    }

    #[test]
    fn single_added_file_is_low() {
        let ws = workspace();
        let monitor = DriftMonitor::baseline(ws.path(), 1024 * 1024).unwrap();
        std::fs::write(ws.path().join("new.txt"), "hi\n").unwrap();
        let report = monitor.check().unwrap();
        assert_eq!(report.added, vec!["new.txt"]);
        assert_eq!(report.severity(), Some(DriftSeverity::Low));
    }

    #[test]
    fn modification_is_medium() {
        let ws = workspace();
        let monitor = DriftMonitor::baseline(ws.path(), 1024 * 1024).unwrap();
        std::fs::write(ws.path().join("a.txt"), "alpha changed\n").unwrap();
        let report = monitor.check().unwrap();
        assert_eq!(report.modified, vec!["a.txt"]);
        assert_eq!(report.severity(), Some(DriftSeverity::Medium));
    }

    #[test]
    fn deletion_is_high() {
        let ws = workspace();
        let monitor = DriftMonitor::baseline(ws.path(), 1024 * 1024).unwrap();
        std::fs::remove_file(ws.path().join("b.txt")).unwrap();
        let report = monitor.check().unwrap();
        assert_eq!(report.removed, vec!["b.txt"]);
        assert_eq!(report.severity(), Some(DriftSeverity::High));
    }

    #[test]
    fn broad_churn_is_high() {
        let ws = workspace();
        let monitor = DriftMonitor::baseline(ws.path(), 1024 * 1024).unwrap();
        for i in 0..6 {
            std::fs::write(ws.path().join(format!("n{}.txt", i)), "x\n").unwrap();
        }
        let report = monitor.check().unwrap();
        assert_eq!(report.severity(), Some(DriftSeverity::High));
    }

    #[test]
    fn mtime_touch_without_content_change_ignored_for_hashed_files() {
        let ws = workspace();
        let monitor = DriftMonitor::baseline(ws.path(), 1024 * 1024).unwrap();
        // rewrite identical content (mtime bumps, hash identical)
        std::fs::write(ws.path().join("a.txt"), "alpha\n").unwrap();
        let report = monitor.check().unwrap();
        assert!(!report.is_drifted());
    }

    #[test]
    fn path_changed_for_conflict_detection() {
        let ws = workspace();
        let monitor = DriftMonitor::baseline(ws.path(), 1024 * 1024).unwrap();
        assert!(!monitor.path_changed("a.txt").unwrap());
        std::fs::write(ws.path().join("a.txt"), "different\n").unwrap();
        assert!(monitor.path_changed("a.txt").unwrap());
        assert!(monitor.path_changed("brand-new.txt").map(|c| !c).unwrap());
    }
}
