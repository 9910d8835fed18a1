// Prompt Guard — pre-LLM sanitizer for operator-supplied text.
//
// Normalizes the input (NFKC, zero-width strip, smart-quote fold, whitespace
// collapse) and strips twelve adversarial pattern families: instruction
// override, identity hijack, system-prompt smuggling, jailbreaks,
// safety-disable requests, and role-authority override. Guard results are
// recorded in the audit log by callers; stripping is non-fatal and execution
// proceeds on the cleaned remainder.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

// ── Pattern table ──────────────────────────────────────────────────────

struct GuardPattern {
    name: &'static str,
    regex: &'static str,
}

const PATTERNS: &[GuardPattern] = &[
    GuardPattern {
        name: "ignore_instructions",
        regex: r"(?i)\b(ignore|disregard|forget|override)\s+(all\s+|any\s+)?(previous|prior|above|earlier|your|the)\s+(instructions?|rules?|prompts?|directives?|guidelines?)\b",
    },
    GuardPattern {
        name: "identity_hijack",
        regex: r"(?i)\byou\s+are\s+now\s+(a|an|the)\b[^.!?\n]*",
    },
    GuardPattern {
        name: "roleplay_escape",
        regex: r"(?i)\b(pretend\s+to\s+be|act\s+as\s+if\s+you\s+(are|were)|roleplay\s+as)\b[^.!?\n]*",
    },
    GuardPattern {
        name: "new_instructions",
        regex: r"(?i)\bnew\s+(system\s+)?instructions?\s*:[^\n]*",
    },
    GuardPattern {
        name: "prompt_smuggle",
        regex: r"(?im)(<\|im_start\|>|<\|im_end\|>|\[INST\]|\[/INST\]|</?(system|assistant)>|^\s*(system|assistant)\s*:)",
    },
    GuardPattern {
        name: "jailbreak",
        regex: r"(?i)\b(dan\s+(mode|prompt|jailbreak)|do\s+anything\s+now|developer\s+mode\s+(enabled|activated))\b",
    },
    GuardPattern {
        name: "safety_disable",
        regex: r"(?i)\b(without\s+(any\s+)?(restrictions?|limitations?|safety|guardrails?|filters?|censorship)|(disable|bypass|circumvent|evade)\s+(the\s+)?(safety|security|content\s+filters?|moderation))\b",
    },
    GuardPattern {
        name: "fake_admin",
        regex: r"(?i)\b(system|admin|root)\s+(override|command|directive)\s*:?[^\n]*",
    },
    GuardPattern {
        name: "reveal_prompt",
        regex: r"(?i)\b(show|reveal|print|output|repeat|echo)\s+(me\s+)?(your|the)\s+(system\s+)?(prompt|instructions|configuration|rules)\b",
    },
    GuardPattern {
        name: "encoded_payload",
        regex: r"(?i)\b(decode|unbase64|rot13)\s+(this\s+|it\s+)?(and|then)\s+(run|execute|follow|obey)\b[^\n]*",
    },
    GuardPattern {
        name: "exfiltration",
        regex: r"(?i)\b(send|post|upload|exfiltrate)\s+(all\s+)?(the\s+)?(secrets?|credentials?|keys?|tokens?|passwords?)\s+to\b[^\n]*",
    },
    GuardPattern {
        name: "authority_override",
        regex: r"(?i)\b(you\s+have\s+(full|unlimited|root)\s+authority|all\s+actions?\s+(are|is)\s+(autonomous|approved|permitted)|no\s+approval\s+(is\s+)?(needed|required)|grant\s+yourself\b[^\n]*)",
    },
];

fn compiled() -> &'static Vec<(&'static str, Regex)> {
    static COMPILED: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|p| (p.name, Regex::new(p.regex).expect("guard pattern compiles")))
            .collect()
    })
}

// ── Result type ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeResult {
    pub cleaned: String,
    /// Names of pattern families removed, in table order, deduplicated.
    pub stripped_patterns: Vec<String>,
}

impl SanitizeResult {
    pub fn was_modified(&self) -> bool {
        !self.stripped_patterns.is_empty()
    }
}

// ── Normalization ──────────────────────────────────────────────────────

/// NFKC normalization, zero-width and formatting character removal, smart
/// quote folding, and whitespace collapse.
pub fn normalize(input: &str) -> String {
    let nfkc: String = input.nfkc().collect();
    let mut out = String::with_capacity(nfkc.len());
    for c in nfkc.chars() {
        match c {
            // zero-width and invisible formatting characters
            '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}' | '\u{FEFF}' => {}
            '\u{2018}' | '\u{2019}' => out.push('\''),
            '\u{201C}' | '\u{201D}' => out.push('"'),
            _ => out.push(c),
        }
    }
    // Collapse runs of spaces/tabs but keep line structure: the smuggle
    // pattern anchors on line starts.
    let mut collapsed = String::with_capacity(out.len());
    let mut last_was_space = false;
    for c in out.chars() {
        if c == ' ' || c == '\t' {
            if !last_was_space {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            collapsed.push(c);
            last_was_space = false;
        }
    }
    collapsed.trim().to_string()
}

// ── Guard operations ───────────────────────────────────────────────────

/// Remove every adversarial span from `input` and report which pattern
/// families were stripped. Idempotent: sanitizing the cleaned output again
/// is a no-op.
pub fn sanitize(input: &str) -> SanitizeResult {
    let mut text = normalize(input);
    let mut stripped: Vec<String> = Vec::new();

    // Stripping one span can join text into a new match, so iterate to a
    // fixpoint. Bounded: each pass either removes characters or stops.
    loop {
        let mut changed = false;
        for (name, regex) in compiled() {
            if regex.is_match(&text) {
                text = regex.replace_all(&text, "").to_string();
                if !stripped.iter().any(|s| s == name) {
                    stripped.push(name.to_string());
                }
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    SanitizeResult {
        cleaned: normalize(&text),
        stripped_patterns: stripped,
    }
}

/// Pure predicate: does the normalized input contain no adversarial pattern?
pub fn is_safe(input: &str) -> bool {
    let text = normalize(input);
    compiled().iter().all(|(_, regex)| !regex.is_match(&text))
}
