pub mod scan;

use crate::confine;
use crate::errors::{CoreError, CoreResult};
use anyhow::{bail, Context, Result};
use regex::Regex;
use rust_embed::RustEmbed;
use scan::{ScanReport, ScanSeverity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Skills compiled into the binary. Bundled skills are accepted as
/// `verified` without a scan.
#[derive(RustEmbed)]
#[folder = "src/skills/bundled/"]
pub struct BundledSkills;

// ── Resource ceilings ──────────────────────────────────────────────────

pub const MAX_INSTRUCTION_BYTES: usize = 50 * 1024;
pub const MAX_INSTRUCTION_TOKENS: usize = 4_000;
pub const MAX_SUPPORT_FILES: usize = 20;
pub const MAX_SUPPORT_FILE_BYTES: u64 = 1024 * 1024;
pub const MAX_DIR_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_TAGS: usize = 20;

/// Extensions never accepted as supporting files.
const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "ps1", "bat", "cmd", "msi", "scr", "com", "vbs",
];

/// Extensions accepted silently; anything else passes with a warning.
const ALLOWED_EXTENSIONS: &[&str] = &[
    "md", "txt", "json", "yaml", "yml", "toml", "csv", "xml", "html",
];

const STATE_FILE: &str = "skill-state.json";

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}[a-z0-9]$").expect("name regex"))
}

/// Rough token estimate for injection budgeting (4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

// ── Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillSource {
    Bundled,
    Custom,
    Imported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Verified,
    Trusted,
    Unreviewed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportingFile {
    /// Path relative to the skill directory.
    pub path: String,
    pub size: u64,
    /// Extension outside the allowlist (accepted, but flagged).
    #[serde(default)]
    pub flagged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: SkillSource,
    pub trust_level: TrustLevel,
    /// Instruction body injected into prompts when the skill is selected.
    pub body: String,
    #[serde(default)]
    pub supporting_files: Vec<SupportingFile>,
    /// SHA-256 over the body plus sorted supporting-file contents.
    pub integrity_hash: String,
    pub aegis_approved: bool,
    /// On-disk location; `None` for bundled skills.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct SkillFrontmatter {
    pub name: String,
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Persisted per-skill scan outcome (`skill-state.json` next to SKILL.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SkillState {
    trust_level: TrustLevel,
    integrity_hash: String,
    aegis_approved: bool,
    #[serde(default = "default_state_source")]
    source: SkillSource,
}

fn default_state_source() -> SkillSource {
    SkillSource::Custom
}

// ── Parsing ────────────────────────────────────────────────────────────

/// Split SKILL.md into validated frontmatter and body, enforcing the name
/// pattern and size ceilings.
pub fn parse_skill_text(text: &str) -> Result<(SkillFrontmatter, String)> {
    if !text.starts_with("---") {
        bail!("Skill must start with YAML frontmatter");
    }
    let parts: Vec<&str> = text.splitn(3, "---").collect();
    if parts.len() < 3 {
        bail!("Skill missing closing frontmatter delimiter");
    }
    let frontmatter: SkillFrontmatter =
        serde_yml::from_str(parts[1]).context("invalid skill frontmatter")?;
    let body = parts[2].trim().to_string();

    validate_name(&frontmatter.name)?;
    if frontmatter.description.trim().is_empty() {
        bail!("Skill '{}' has no description", frontmatter.name);
    }
    if frontmatter.tags.len() > MAX_TAGS {
        bail!(
            "Skill '{}' has {} tags (max {})",
            frontmatter.name,
            frontmatter.tags.len(),
            MAX_TAGS
        );
    }
    if body.len() > MAX_INSTRUCTION_BYTES {
        bail!(
            "Skill '{}' instructions are {} bytes (max {})",
            frontmatter.name,
            body.len(),
            MAX_INSTRUCTION_BYTES
        );
    }
    if estimate_tokens(&body) > MAX_INSTRUCTION_TOKENS {
        bail!(
            "Skill '{}' instructions exceed {} tokens",
            frontmatter.name,
            MAX_INSTRUCTION_TOKENS
        );
    }
    Ok((frontmatter, body))
}

pub fn validate_name(name: &str) -> Result<()> {
    if !name_regex().is_match(name) {
        bail!("Skill name '{}' is invalid (lowercase alphanumerics and hyphens, 2-64 chars)", name);
    }
    if name.contains("--") {
        bail!("Skill name '{}' contains consecutive hyphens", name);
    }
    // Reserved device names would break the on-disk layout on Windows.
    let stem = name.split('.').next().unwrap_or(name);
    let is_numbered_device = stem.len() == 4
        && (stem.starts_with("com") || stem.starts_with("lpt"))
        && stem.as_bytes()[3].is_ascii_digit();
    if ["con", "prn", "aux", "nul"].contains(&stem) || is_numbered_device {
        bail!("Skill name '{}' is a reserved device name", name);
    }
    Ok(())
}

/// Inventory supporting files under a skill directory. Symlinks, traversal,
/// and blocklisted extensions are rejected; extensions outside the allowlist
/// are flagged with a warning.
fn inventory_supporting_files(dir: &Path) -> Result<Vec<SupportingFile>> {
    let mut files = Vec::new();
    let mut total_bytes = 0u64;
    let walker = ignore::WalkBuilder::new(dir)
        .follow_links(false)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();

    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        if path == dir {
            continue;
        }
        let file_type = entry
            .file_type()
            .context("unreadable entry in skill directory")?;
        if file_type.is_symlink() {
            bail!("Skill directory contains a symlink: {}", path.display());
        }
        if file_type.is_dir() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name == "SKILL.md" || name == STATE_FILE {
            continue;
        }
        let rel = path
            .strip_prefix(dir)
            .context("supporting file outside skill directory")?;
        if !confine::is_confined(rel, dir) {
            bail!("Supporting file escapes skill directory: {}", rel.display());
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if BLOCKED_EXTENSIONS.contains(&ext.as_str()) {
            bail!("Supporting file has a blocked extension: {}", rel.display());
        }
        let flagged = !ALLOWED_EXTENSIONS.contains(&ext.as_str());
        if flagged {
            warn!("Skill supporting file {} has an unrecognized extension", rel.display());
        }

        let size = entry.metadata()?.len();
        if size > MAX_SUPPORT_FILE_BYTES {
            bail!(
                "Supporting file {} is {} bytes (max {})",
                rel.display(),
                size,
                MAX_SUPPORT_FILE_BYTES
            );
        }
        total_bytes += size;
        files.push(SupportingFile {
            path: rel.to_string_lossy().to_string(),
            size,
            flagged,
        });
    }

    if files.len() > MAX_SUPPORT_FILES {
        bail!("Skill has {} supporting files (max {})", files.len(), MAX_SUPPORT_FILES);
    }
    if total_bytes > MAX_DIR_BYTES {
        bail!("Skill directory totals {} bytes (max {})", total_bytes, MAX_DIR_BYTES);
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// SHA-256 over the body plus sorted supporting-file contents.
pub fn compute_integrity(body: &str, supporting: &[(String, Vec<u8>)]) -> String {
    let mut sorted: Vec<&(String, Vec<u8>)> = supporting.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    for (path, content) in sorted {
        hasher.update(path.as_bytes());
        hasher.update(b"\x00");
        hasher.update(content);
    }
    hex::encode(hasher.finalize())
}

fn read_supporting_contents(dir: &Path, files: &[SupportingFile]) -> Result<Vec<(String, Vec<u8>)>> {
    files
        .iter()
        .map(|f| {
            let content = std::fs::read(dir.join(&f.path))
                .with_context(|| format!("read supporting file {}", f.path))?;
            Ok((f.path.clone(), content))
        })
        .collect()
}

// ── Store ──────────────────────────────────────────────────────────────

/// On-disk skill library (`~/.ara/skills/<name>/`) plus the bundled set.
pub struct SkillStore {
    dir: PathBuf,
}

impl SkillStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn open_default() -> Self {
        Self::new(crate::paths::skills_dir())
    }

    // -- loading -----------------------------------------------------------

    /// Load every available skill: bundled first, then the library. A
    /// library skill shadows a bundled skill of the same name.
    pub fn list(&self) -> Vec<Skill> {
        let mut skills = load_bundled();
        let mut names: HashSet<String> = skills.iter().map(|s| s.name.clone()).collect();

        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                match self.load_dir(&path) {
                    Ok(skill) => {
                        if names.insert(skill.name.clone()) {
                            skills.push(skill);
                        } else {
                            skills.retain(|s| s.name != skill.name);
                            names.insert(skill.name.clone());
                            skills.push(skill);
                        }
                    }
                    Err(e) => warn!("Skipping skill at {}: {}", path.display(), e),
                }
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    pub fn get(&self, name: &str) -> Option<Skill> {
        self.list().into_iter().find(|s| s.name == name)
    }

    /// Load one skill directory, applying the recorded scan state and the
    /// integrity check. A hash mismatch demotes the skill to not-approved
    /// until the operator re-scans.
    fn load_dir(&self, dir: &Path) -> Result<Skill> {
        let text = std::fs::read_to_string(dir.join("SKILL.md"))
            .with_context(|| format!("read {}", dir.join("SKILL.md").display()))?;
        let (frontmatter, body) = parse_skill_text(&text)?;
        let supporting_files = inventory_supporting_files(dir)?;
        let contents = read_supporting_contents(dir, &supporting_files)?;
        let current_hash = compute_integrity(&body, &contents);

        let state_path = dir.join(STATE_FILE);
        let state: Option<SkillState> = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok());

        let (trust_level, recorded_hash, mut aegis_approved, source) = match state {
            Some(s) => (s.trust_level, s.integrity_hash, s.aegis_approved, s.source),
            None => (TrustLevel::Unreviewed, String::new(), false, SkillSource::Imported),
        };

        if aegis_approved && recorded_hash != current_hash {
            warn!(
                "Skill '{}' content changed since last scan; approval revoked until re-scan",
                frontmatter.name
            );
            aegis_approved = false;
        }

        Ok(Skill {
            name: frontmatter.name,
            description: frontmatter.description,
            version: frontmatter.version,
            author: frontmatter.author,
            tags: frontmatter.tags,
            source,
            trust_level,
            body,
            supporting_files,
            integrity_hash: current_hash,
            aegis_approved,
            dir: Some(dir.to_path_buf()),
        })
    }

    // -- lifecycle ---------------------------------------------------------

    /// Create a skill from operator-supplied parts, scan it, and persist it.
    pub fn create(&self, skill_md: &str) -> CoreResult<Skill> {
        let (frontmatter, _body) = parse_skill_text(skill_md)
            .map_err(|e| CoreError::InvalidState(e.to_string()))?;
        let dir = self.dir.join(&frontmatter.name);
        if dir.exists() {
            return Err(CoreError::InvalidState(format!(
                "skill '{}' already exists",
                frontmatter.name
            )));
        }
        std::fs::create_dir_all(&dir).map_err(CoreError::Io)?;
        std::fs::write(dir.join("SKILL.md"), skill_md).map_err(CoreError::Io)?;
        self.scan(&frontmatter.name, SkillSource::Custom)
    }

    /// Import an external skill directory into the library, then scan it.
    pub fn import(&self, source_dir: &Path) -> CoreResult<Skill> {
        let text = std::fs::read_to_string(source_dir.join("SKILL.md"))
            .map_err(|_| CoreError::InvalidState("import source has no SKILL.md".to_string()))?;
        let (frontmatter, _body) = parse_skill_text(&text)
            .map_err(|e| CoreError::InvalidState(e.to_string()))?;
        let dest = self.dir.join(&frontmatter.name);
        if dest.exists() {
            return Err(CoreError::InvalidState(format!(
                "skill '{}' already exists",
                frontmatter.name
            )));
        }
        copy_skill_dir(source_dir, &dest).map_err(|e| CoreError::InvalidState(e.to_string()))?;
        self.scan(&frontmatter.name, SkillSource::Imported)
    }

    /// Run (or re-run) the Skill Guard over a library skill and persist the
    /// outcome. This is also how an operator restores approval after an
    /// integrity demotion.
    pub fn scan(&self, name: &str, source: SkillSource) -> CoreResult<Skill> {
        let dir = self.dir.join(name);
        let text = std::fs::read_to_string(dir.join("SKILL.md"))
            .map_err(|_| CoreError::InvalidState(format!("skill '{}' not found", name)))?;
        let (frontmatter, body) =
            parse_skill_text(&text).map_err(|e| CoreError::InvalidState(e.to_string()))?;
        let supporting_files =
            inventory_supporting_files(&dir).map_err(|e| CoreError::InvalidState(e.to_string()))?;
        let contents = read_supporting_contents(&dir, &supporting_files)
            .map_err(|e| CoreError::InvalidState(e.to_string()))?;

        let texts: Vec<(String, String)> = contents
            .iter()
            .map(|(p, c)| (p.clone(), String::from_utf8_lossy(c).to_string()))
            .collect();
        let report = scan::scan_skill(&body, &texts);
        let (trust_level, aegis_approved) = classify(&report, source);
        let integrity_hash = compute_integrity(&body, &contents);

        let state = SkillState {
            trust_level,
            integrity_hash: integrity_hash.clone(),
            aegis_approved,
            source,
        };
        std::fs::write(
            dir.join(STATE_FILE),
            serde_json::to_string_pretty(&state).map_err(CoreError::Serialization)?,
        )
        .map_err(CoreError::Io)?;

        info!(
            "Scanned skill '{}': trust={:?} approved={} findings={}",
            name,
            trust_level,
            aegis_approved,
            report.findings.len()
        );
        if trust_level == TrustLevel::Blocked {
            return Err(CoreError::SkillScanBlocked(name.to_string()));
        }

        Ok(Skill {
            name: frontmatter.name,
            description: frontmatter.description,
            version: frontmatter.version,
            author: frontmatter.author,
            tags: frontmatter.tags,
            source,
            trust_level,
            body,
            supporting_files,
            integrity_hash,
            aegis_approved,
            dir: Some(dir),
        })
    }

    pub fn delete(&self, name: &str) -> CoreResult<()> {
        validate_name(name).map_err(|e| CoreError::InvalidState(e.to_string()))?;
        let dir = self.dir.join(name);
        if !dir.exists() {
            return Err(CoreError::InvalidState(format!("skill '{}' not found", name)));
        }
        std::fs::remove_dir_all(dir).map_err(CoreError::Io)?;
        Ok(())
    }

    // -- resolution & selection -------------------------------------------

    /// Resolve a role's usable skills: skills reached via assigned groups
    /// first, then individually assigned skills, deduplicated; only
    /// gate-approved skills appear.
    pub fn resolve(&self, role: &crate::roles::RoleProfile) -> Vec<Skill> {
        let all = self.list();
        let mut resolved: Vec<Skill> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for group in &role.assigned_skill_groups {
            for skill in all.iter().filter(|s| s.tags.iter().any(|t| t == group)) {
                if skill.aegis_approved && seen.insert(skill.name.clone()) {
                    resolved.push(skill.clone());
                }
            }
        }
        for name in &role.assigned_skills {
            if let Some(skill) = all.iter().find(|s| &s.name == name) {
                if skill.aegis_approved && seen.insert(skill.name.clone()) {
                    resolved.push(skill.clone());
                }
            }
        }
        resolved
    }
}

/// Trust classification from a scan report.
fn classify(report: &ScanReport, source: SkillSource) -> (TrustLevel, bool) {
    match report.max_severity() {
        Some(ScanSeverity::Blocked) => (TrustLevel::Blocked, false),
        Some(ScanSeverity::Critical) => (TrustLevel::Unreviewed, false),
        Some(ScanSeverity::Warn) | None => match source {
            SkillSource::Bundled => (TrustLevel::Verified, true),
            SkillSource::Custom | SkillSource::Imported => (TrustLevel::Trusted, true),
        },
    }
}

fn copy_skill_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        if ty.is_symlink() {
            bail!("import source contains a symlink: {}", entry.path().display());
        }
        let target = dest.join(entry.file_name());
        if ty.is_dir() {
            copy_skill_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

// ── Bundled skills ─────────────────────────────────────────────────────

/// Load the compiled-in skill set. Bundled content is verified by build
/// provenance; no scan runs.
pub fn load_bundled() -> Vec<Skill> {
    let mut by_dir: std::collections::BTreeMap<String, Vec<(String, Vec<u8>)>> =
        std::collections::BTreeMap::new();
    for file in BundledSkills::iter() {
        let path = file.to_string();
        let Some((dir, rest)) = path.split_once('/') else {
            continue;
        };
        if let Some(content) = BundledSkills::get(&path) {
            by_dir
                .entry(dir.to_string())
                .or_default()
                .push((rest.to_string(), content.data.to_vec()));
        }
    }

    let mut skills = Vec::new();
    for (dir, files) in by_dir {
        let Some((_, skill_md)) = files.iter().find(|(p, _)| p == "SKILL.md") else {
            warn!("Bundled skill '{}' has no SKILL.md", dir);
            continue;
        };
        let text = String::from_utf8_lossy(skill_md).to_string();
        let (frontmatter, body) = match parse_skill_text(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Bundled skill '{}' failed to parse: {}", dir, e);
                continue;
            }
        };
        let supporting: Vec<(String, Vec<u8>)> = files
            .iter()
            .filter(|(p, _)| p != "SKILL.md")
            .cloned()
            .collect();
        let supporting_files = supporting
            .iter()
            .map(|(p, c)| SupportingFile {
                path: p.clone(),
                size: c.len() as u64,
                flagged: false,
            })
            .collect();
        let integrity_hash = compute_integrity(&body, &supporting);
        skills.push(Skill {
            name: frontmatter.name,
            description: frontmatter.description,
            version: frontmatter.version,
            author: frontmatter.author,
            tags: frontmatter.tags,
            source: SkillSource::Bundled,
            trust_level: TrustLevel::Verified,
            body,
            supporting_files,
            integrity_hash,
            aegis_approved: true,
            dir: None,
        });
    }
    skills
}

// ── Selection ──────────────────────────────────────────────────────────

/// Score a skill against a task's text: +1 per description keyword present,
/// +2 per tag present, +5 when the skill name itself appears.
pub fn score_skill(skill: &Skill, task_text: &str) -> u32 {
    let haystack = task_text.to_lowercase();
    let mut score = 0u32;

    let mut counted: HashSet<String> = HashSet::new();
    for word in skill.description.to_lowercase().split_whitespace() {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        if word.len() > 3 && haystack.contains(word) && counted.insert(word.to_string()) {
            score += 1;
        }
    }
    for tag in &skill.tags {
        if haystack.contains(&tag.to_lowercase()) {
            score += 2;
        }
    }
    if haystack.contains(&skill.name.to_lowercase()) {
        score += 5;
    }
    score
}

/// Pick the best-matching skill for a task, if any scores at least 2.
pub fn select_for_task<'a>(skills: &'a [Skill], task_text: &str) -> Option<&'a Skill> {
    skills
        .iter()
        .map(|s| (score_skill(s, task_text), s))
        .filter(|(score, _)| *score >= 2)
        .max_by_key(|(score, _)| *score)
        .map(|(_, s)| s)
}
