//! Prompt template store.
//!
//! Loads prompt templates from `~/.ara/prompts/` at runtime, falling back to
//! compiled-in defaults from `prompts/` in the source tree.  Templates use
//! `{variable}` placeholders that are substituted via [`PromptStore::render`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Well-known prompt keys
// ---------------------------------------------------------------------------

/// System prompt framing the agent's role identity.
/// Vars: `{role_name}`, `{role_description}`, `{authority_summary}`.
pub const ROLE_SYSTEM: &str = "role-system";
/// Goal decomposition request.  Vars: `{goal}`, `{authority_summary}`,
/// `{memory}`.
pub const DECOMPOSE: &str = "decompose";
/// Extra section appended to the decomposition prompt when re-planning.
/// Vars: `{completed}`, `{remaining_goal}`.
pub const REPLAN_CONTEXT: &str = "replan-context";
/// Generate a file from scratch.  Vars: `{task}`, `{target}`, `{context}`.
pub const GENERATE_FILE: &str = "generate-file";
/// Merge changes into an existing file; must output the complete updated
/// file.  Vars: `{task}`, `{target}`, `{current_content}`, `{context}`.
pub const MERGE_FILE: &str = "merge-file";
/// Read/analyze/validate task producing a text result.  Vars: `{task}`,
/// `{context}`.
pub const ANALYZE: &str = "analyze";

// ---------------------------------------------------------------------------
// Embedded defaults (compile-time)
// ---------------------------------------------------------------------------

const DEFAULTS: &[(&str, &str)] = &[
    (ROLE_SYSTEM, include_str!("../prompts/role-system.md")),
    (DECOMPOSE, include_str!("../prompts/decompose.md")),
    (REPLAN_CONTEXT, include_str!("../prompts/replan-context.md")),
    (GENERATE_FILE, include_str!("../prompts/generate-file.md")),
    (MERGE_FILE, include_str!("../prompts/merge-file.md")),
    (ANALYZE, include_str!("../prompts/analyze.md")),
];

// ---------------------------------------------------------------------------
// PromptStore
// ---------------------------------------------------------------------------

/// Runtime prompt template store.
///
/// On construction it loads embedded defaults, then overlays any `.md` files
/// found in `override_dir` (typically `~/.ara/prompts/`).  This lets
/// operators tune prompts without recompiling.
pub struct PromptStore {
    prompts: HashMap<String, String>,
}

impl PromptStore {
    /// Create a store seeded with compiled-in defaults, optionally overlaid
    /// with files from `override_dir`.
    pub fn load(override_dir: Option<&Path>) -> Self {
        let mut prompts: HashMap<String, String> = DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        if let Some(dir) = override_dir {
            Self::overlay_from_dir(&mut prompts, dir);
        }

        Self { prompts }
    }

    /// Get a raw template by key.  Returns `None` for unknown keys.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.prompts.get(key).map(|s| s.as_str())
    }

    /// Render a template, replacing every `{name}` with the corresponding
    /// value from `vars`.  Unknown keys in the template are left as-is.
    pub fn render(&self, key: &str, vars: &[(&str, &str)]) -> Option<String> {
        self.get(key).map(|tpl| Self::substitute(tpl, vars))
    }

    /// Substitute `{name}` placeholders in `tpl`.
    pub fn substitute(tpl: &str, vars: &[(&str, &str)]) -> String {
        let mut out = tpl.to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{}}}", name), value);
        }
        out
    }

    /// Default prompts dir: `~/.ara/prompts/`.
    pub fn default_override_dir() -> PathBuf {
        crate::paths::ara_home().join("prompts")
    }

    // -- private -------------------------------------------------------------

    /// Read every `.md` file in `dir` and insert/overwrite matching keys.
    fn overlay_from_dir(prompts: &mut HashMap<String, String>, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return, // dir doesn't exist — that's fine
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(content) = std::fs::read_to_string(&path) {
                prompts.insert(stem.to_string(), content);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_load() {
        let store = PromptStore::load(None);
        assert!(store.get(ROLE_SYSTEM).is_some());
        assert!(store.get(DECOMPOSE).is_some());
        assert!(store.get(MERGE_FILE).is_some());
        assert!(store.get(ANALYZE).is_some());
    }

    #[test]
    fn render_substitutes_vars() {
        let store = PromptStore::load(None);
        let rendered = store
            .render(DECOMPOSE, &[("goal", "build a parser"), ("authority_summary", "x"), ("memory", "-")])
            .unwrap();
        assert!(rendered.contains("build a parser"));
        assert!(!rendered.contains("{goal}"));
    }

    #[test]
    fn render_preserves_unknown_vars() {
        let out = PromptStore::substitute("hello {name}, {unknown} world", &[("name", "alice")]);
        assert_eq!(out, "hello alice, {unknown} world");
    }

    #[test]
    fn merge_template_demands_complete_file() {
        let store = PromptStore::load(None);
        let tpl = store.get(MERGE_FILE).unwrap();
        assert!(tpl.contains("{current_content}"));
        assert!(tpl.to_lowercase().contains("complete"));
    }

    #[test]
    fn overlay_from_tempdir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("analyze.md"), "custom analysis prompt").unwrap();

        let store = PromptStore::load(Some(tmp.path()));
        assert_eq!(store.get(ANALYZE).unwrap(), "custom analysis prompt");
        // untouched keys keep defaults
        assert!(store.get(DECOMPOSE).unwrap().len() > 50);
    }
}
