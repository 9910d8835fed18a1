// Write accounting for a running session. The tracker counts files and bytes
// as the executor persists task output; the same ceilings are re-checked from
// the full sandbox inventory at the AEGIS gate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-role write ceilings. Defaults: 1 MB per file, 50 MB per session,
/// 200 files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteLimits {
    #[serde(default = "default_per_file")]
    pub per_file_bytes: u64,
    #[serde(default = "default_per_session")]
    pub per_session_bytes: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_per_file() -> u64 {
    1024 * 1024
}
fn default_per_session() -> u64 {
    50 * 1024 * 1024
}
fn default_max_files() -> usize {
    200
}

impl Default for WriteLimits {
    fn default() -> Self {
        Self {
            per_file_bytes: default_per_file(),
            per_session_bytes: default_per_session(),
            max_files: default_max_files(),
        }
    }
}

/// A single ceiling violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitViolation {
    pub limit: String,
    pub path: Option<String>,
    pub observed: u64,
    pub ceiling: u64,
}

impl std::fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => write!(
                f,
                "{} exceeded for {}: {} > {}",
                self.limit, p, self.observed, self.ceiling
            ),
            None => write!(f, "{} exceeded: {} > {}", self.limit, self.observed, self.ceiling),
        }
    }
}

/// Running counters for one session. Re-writing a path replaces its byte
/// count rather than double-counting.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct WriteTracker {
    bytes_by_path: HashMap<String, u64>,
}

impl WriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a pending write against the limits without recording it.
    pub fn check(&self, path: &str, bytes: u64, limits: &WriteLimits) -> Option<LimitViolation> {
        if bytes > limits.per_file_bytes {
            return Some(LimitViolation {
                limit: "per_file_bytes".to_string(),
                path: Some(path.to_string()),
                observed: bytes,
                ceiling: limits.per_file_bytes,
            });
        }
        let is_new = !self.bytes_by_path.contains_key(path);
        if is_new && self.bytes_by_path.len() + 1 > limits.max_files {
            return Some(LimitViolation {
                limit: "max_files".to_string(),
                path: Some(path.to_string()),
                observed: (self.bytes_by_path.len() + 1) as u64,
                ceiling: limits.max_files as u64,
            });
        }
        let total: u64 = self
            .bytes_by_path
            .iter()
            .filter(|(p, _)| p.as_str() != path)
            .map(|(_, b)| *b)
            .sum::<u64>()
            + bytes;
        if total > limits.per_session_bytes {
            return Some(LimitViolation {
                limit: "per_session_bytes".to_string(),
                path: None,
                observed: total,
                ceiling: limits.per_session_bytes,
            });
        }
        None
    }

    /// Record a committed write.
    pub fn record(&mut self, path: &str, bytes: u64) {
        self.bytes_by_path.insert(path.to_string(), bytes);
    }

    pub fn files_written(&self) -> usize {
        self.bytes_by_path.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_by_path.values().sum()
    }

    /// Validate a full inventory (path, bytes) against the limits, as the
    /// gate does over the sandbox. Returns every violation found.
    pub fn check_inventory(
        inventory: &[(String, u64)],
        limits: &WriteLimits,
    ) -> Vec<LimitViolation> {
        let mut violations = Vec::new();
        let mut total = 0u64;
        for (path, bytes) in inventory {
            total += bytes;
            if *bytes > limits.per_file_bytes {
                violations.push(LimitViolation {
                    limit: "per_file_bytes".to_string(),
                    path: Some(path.clone()),
                    observed: *bytes,
                    ceiling: limits.per_file_bytes,
                });
            }
        }
        if inventory.len() > limits.max_files {
            violations.push(LimitViolation {
                limit: "max_files".to_string(),
                path: None,
                observed: inventory.len() as u64,
                ceiling: limits.max_files as u64,
            });
        }
        if total > limits.per_session_bytes {
            violations.push(LimitViolation {
                limit: "per_session_bytes".to_string(),
                path: None,
                observed: total,
                ceiling: limits.per_session_bytes,
            });
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> WriteLimits {
        WriteLimits {
            per_file_bytes: 100,
            per_session_bytes: 250,
            max_files: 3,
        }
    }

    #[test]
    fn within_limits_passes() {
        let mut t = WriteTracker::new();
        let l = small_limits();
        assert!(t.check("a.txt", 50, &l).is_none());
        t.record("a.txt", 50);
        assert!(t.check("b.txt", 80, &l).is_none());
        t.record("b.txt", 80);
        assert_eq!(t.files_written(), 2);
        assert_eq!(t.total_bytes(), 130);
    }

    #[test]
    fn per_file_ceiling() {
        let t = WriteTracker::new();
        let v = t.check("big.bin", 101, &small_limits()).unwrap();
        assert_eq!(v.limit, "per_file_bytes");
    }

    #[test]
    fn max_files_ceiling() {
        let mut t = WriteTracker::new();
        let l = small_limits();
        for name in ["a", "b", "c"] {
            t.record(name, 10);
        }
        let v = t.check("d", 10, &l).unwrap();
        assert_eq!(v.limit, "max_files");
        // rewriting an existing file is not a new file
        assert!(t.check("a", 10, &l).is_none());
    }

    #[test]
    fn session_bytes_ceiling() {
        let mut t = WriteTracker::new();
        let l = small_limits();
        t.record("a", 100);
        t.record("b", 100);
        let v = t.check("c", 60, &l).unwrap();
        assert_eq!(v.limit, "per_session_bytes");
    }

    #[test]
    fn rewrite_replaces_byte_count() {
        let mut t = WriteTracker::new();
        let l = small_limits();
        t.record("a", 100);
        t.record("a", 20);
        assert_eq!(t.total_bytes(), 20);
        assert!(t.check("a", 90, &l).is_none());
    }

    #[test]
    fn inventory_check_collects_all_violations() {
        let l = small_limits();
        let inv = vec![
            ("a".to_string(), 150u64),
            ("b".to_string(), 150u64),
            ("c".to_string(), 10u64),
            ("d".to_string(), 10u64),
        ];
        let vs = WriteTracker::check_inventory(&inv, &l);
        let limits: Vec<&str> = vs.iter().map(|v| v.limit.as_str()).collect();
        assert!(limits.contains(&"per_file_bytes"));
        assert!(limits.contains(&"max_files"));
        assert!(limits.contains(&"per_session_bytes"));
    }
}
