// Workspace sandbox: a session-scoped shadow of the operator's workspace.
//
// The shadow backend copies the workspace's tracked files into
// `~/.ara/sandboxes/<id>/work/` and gives the executor confined read/write
// over that tree. Snapshots are full copies under `snapshots/<n>/`.
// No sandbox operation touches the real workspace; promotion is the only
// path back, and it goes through the gate.

use crate::confine;
use crate::errors::{CoreError, CoreResult};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub status: DiffStatus,
    pub additions: usize,
    pub deletions: usize,
    pub unified: String,
    /// Set by the promotion diff when the same path also changed in the
    /// workspace since the session baseline.
    #[serde(default)]
    pub conflict: bool,
}

pub struct Sandbox {
    id: String,
    dir: PathBuf,
    snapshot_counter: u64,
}

impl Sandbox {
    /// Create a sandbox seeded with a shadow copy of the workspace.
    /// Hidden and ignored files (VCS internals, build artifacts, local env
    /// files) stay out of the shadow.
    pub fn create(base_dir: &Path, workspace: &Path) -> Result<Self> {
        let id = format!("sbx-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let dir = base_dir.join(&id);
        let work = dir.join("work");
        std::fs::create_dir_all(&work)?;
        std::fs::create_dir_all(dir.join("snapshots"))?;

        let mut copied = 0usize;
        for entry in walk_files(workspace) {
            let rel = entry
                .strip_prefix(workspace)
                .context("walk produced path outside workspace")?;
            let dest = work.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&entry, &dest)?;
            copied += 1;
        }
        info!("Created sandbox {} with {} shadowed files", id, copied);
        let snapshot_counter = next_snapshot_counter(&dir);
        Ok(Self {
            id,
            dir,
            snapshot_counter,
        })
    }

    /// Reattach to an existing sandbox (session recovery, checkpoint
    /// restore).
    pub fn open(base_dir: &Path, id: &str) -> Result<Self> {
        let dir = base_dir.join(id);
        if !dir.join("work").is_dir() {
            bail!("sandbox '{}' not found under {}", id, base_dir.display());
        }
        Ok(Self {
            id: id.to_string(),
            snapshot_counter: next_snapshot_counter(&dir),
            dir,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.join("work")
    }

    // ── Confined I/O ───────────────────────────────────────────────────

    pub fn write(&self, rel: &Path, bytes: &[u8]) -> CoreResult<()> {
        let target = confine::confine(rel, &self.work_dir())?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(CoreError::Io)?;
        }
        std::fs::write(target, bytes).map_err(CoreError::Io)
    }

    pub fn read(&self, rel: &Path) -> CoreResult<Vec<u8>> {
        let target = confine::confine(rel, &self.work_dir())?;
        std::fs::read(target).map_err(CoreError::Io)
    }

    pub fn exists(&self, rel: &Path) -> bool {
        confine::confine(rel, &self.work_dir())
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Recursive inventory of the working tree, sorted by path.
    pub fn list(&self) -> Result<Vec<FileEntry>> {
        let work = self.work_dir();
        let mut entries = Vec::new();
        for path in walk_files(&work) {
            let rel = path.strip_prefix(&work).context("inventory escaped work dir")?;
            entries.push(FileEntry {
                path: rel.to_string_lossy().to_string(),
                size: std::fs::metadata(&path)?.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    // ── Snapshots ──────────────────────────────────────────────────────

    pub fn snapshot(&mut self) -> Result<String> {
        self.snapshot_counter += 1;
        let snapshot_id = format!("snap-{:04}", self.snapshot_counter);
        let dest = self.dir.join("snapshots").join(&snapshot_id);
        copy_tree(&self.work_dir(), &dest)?;
        Ok(snapshot_id)
    }

    pub fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let src = self.dir.join("snapshots").join(snapshot_id);
        if !src.is_dir() {
            bail!("snapshot '{}' not found", snapshot_id);
        }
        let work = self.work_dir();
        std::fs::remove_dir_all(&work)?;
        copy_tree(&src, &work)?;
        Ok(())
    }

    /// File-level diff of the current working tree against a snapshot.
    pub fn diff_against(&self, snapshot_id: &str) -> Result<Vec<FileDiff>> {
        let snap = self.dir.join("snapshots").join(snapshot_id);
        if !snap.is_dir() {
            bail!("snapshot '{}' not found", snapshot_id);
        }
        diff_trees(&snap, &self.work_dir())
    }

    pub fn destroy(self) -> Result<()> {
        if self.dir.is_dir() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        info!("Destroyed sandbox {}", self.id);
        Ok(())
    }
}

// ── Tree helpers ───────────────────────────────────────────────────────

/// All regular files under `root`, skipping hidden and VCS-ignored entries.
pub fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let walker = ignore::WalkBuilder::new(root).follow_links(false).build();
    for entry in walker.flatten() {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    files
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for file in walk_files(src) {
        let rel = file.strip_prefix(src).context("copy walked outside source")?;
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&file, &target)?;
    }
    Ok(())
}

fn next_snapshot_counter(dir: &Path) -> u64 {
    std::fs::read_dir(dir.join("snapshots"))
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| {
                    e.file_name()
                        .to_str()
                        .and_then(|n| n.strip_prefix("snap-").map(String::from))
                })
                .filter_map(|n| n.parse::<u64>().ok())
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

/// Per-file diff from tree `old` to tree `new`: adds, modifications, and
/// deletions with line counts and unified diff text.
pub fn diff_trees(old: &Path, new: &Path) -> Result<Vec<FileDiff>> {
    let mut old_files: BTreeMap<String, PathBuf> = BTreeMap::new();
    for f in walk_files(old) {
        let rel = f.strip_prefix(old)?.to_string_lossy().to_string();
        old_files.insert(rel, f);
    }
    let mut new_files: BTreeMap<String, PathBuf> = BTreeMap::new();
    for f in walk_files(new) {
        let rel = f.strip_prefix(new)?.to_string_lossy().to_string();
        new_files.insert(rel, f);
    }

    let mut diffs = Vec::new();
    for (rel, new_path) in &new_files {
        match old_files.get(rel) {
            None => {
                let content = read_lossy(new_path)?;
                let additions = content.lines().count();
                diffs.push(FileDiff {
                    path: rel.clone(),
                    status: DiffStatus::Added,
                    additions,
                    deletions: 0,
                    unified: unified_diff("", &content, rel),
                    conflict: false,
                });
            }
            Some(old_path) => {
                let old_content = read_lossy(old_path)?;
                let new_content = read_lossy(new_path)?;
                if old_content == new_content {
                    continue;
                }
                let (additions, deletions) = count_changes(&old_content, &new_content);
                diffs.push(FileDiff {
                    path: rel.clone(),
                    status: DiffStatus::Modified,
                    additions,
                    deletions,
                    unified: unified_diff(&old_content, &new_content, rel),
                    conflict: false,
                });
            }
        }
    }
    for (rel, old_path) in &old_files {
        if !new_files.contains_key(rel) {
            let content = read_lossy(old_path)?;
            diffs.push(FileDiff {
                path: rel.clone(),
                status: DiffStatus::Deleted,
                additions: 0,
                deletions: content.lines().count(),
                unified: unified_diff(&content, "", rel),
                conflict: false,
            });
        }
    }
    diffs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(diffs)
}

fn read_lossy(path: &Path) -> Result<String> {
    Ok(String::from_utf8_lossy(&std::fs::read(path)?).to_string())
}

fn count_changes(old: &str, new: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(old, new);
    let mut additions = 0;
    let mut deletions = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => additions += 1,
            similar::ChangeTag::Delete => deletions += 1,
            similar::ChangeTag::Equal => {}
        }
    }
    (additions, deletions)
}

fn unified_diff(old: &str, new: &str, path: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", path), &format!("b/{}", path))
        .to_string()
}
