// Institutional wisdom: durable outcome notes carried across sessions.
//
// Passages accumulate in `~/.ara/wisdom.jsonl`; the executor retrieves the
// ones whose keyword similarity to its query clears a threshold and injects
// them into task context. Capture happens when sessions complete.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WisdomPassage {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: u64,
}

pub struct WisdomStore {
    file: PathBuf,
}

impl WisdomStore {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    pub fn open_default() -> Self {
        Self::new(crate::paths::wisdom_file())
    }

    pub fn append(&self, text: &str, tags: &[String]) -> Result<WisdomPassage> {
        let passage = WisdomPassage {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            tags: tags.to_vec(),
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)?;
        writeln!(file, "{}", serde_json::to_string(&passage)?)?;
        Ok(passage)
    }

    pub fn all(&self) -> Result<Vec<WisdomPassage>> {
        if !self.file.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.file)?;
        let mut passages = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WisdomPassage>(&line) {
                Ok(p) => passages.push(p),
                Err(e) => warn!("Skipping corrupt wisdom line: {}", e),
            }
        }
        Ok(passages)
    }

    /// Passages whose keyword similarity to `query` is at least `threshold`,
    /// best first, capped at `limit`.
    pub fn retrieve(&self, query: &str, threshold: f64, limit: usize) -> Result<Vec<WisdomPassage>> {
        let query_words = keywords(query);
        if query_words.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(f64, WisdomPassage)> = self
            .all()?
            .into_iter()
            .filter_map(|p| {
                let mut text_words = keywords(&p.text);
                for tag in &p.tags {
                    text_words.insert(tag.to_lowercase());
                }
                let overlap = query_words.intersection(&text_words).count();
                let score = overlap as f64 / query_words.len() as f64;
                (score >= threshold).then_some((score, p))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, p)| p).collect())
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(String::from)
        .collect()
}
