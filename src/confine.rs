// Path confinement predicate used by every path-accepting operation:
// skill supporting-file inventory, sandbox I/O, and promotion.
//
// A candidate is confined iff, after full resolution of both paths, it is a
// descendant of the base. Null bytes, escaping `..`, symlinks that resolve
// outside the base, reserved device names, and alternate-data-stream colons
// are all rejected.

use crate::errors::{CoreError, CoreResult};
use std::path::{Component, Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Windows device names that must never appear as a path component stem,
/// regardless of platform (skill directories travel between machines).
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// True iff `candidate` resolves to a strict descendant of `base` (or `base`
/// itself). Never true for paths containing null bytes, reserved device
/// names, stream colons, or components that escape the base.
pub fn is_confined(candidate: &Path, base: &Path) -> bool {
    confine(candidate, base).is_ok()
}

/// Resolve `candidate` against `base` and return the absolute target path.
/// Relative candidates are joined onto the base; absolute candidates must
/// already lie within it. Fails with `PathEscape` on any violation.
pub fn confine(candidate: &Path, base: &Path) -> CoreResult<PathBuf> {
    let raw = candidate.to_string_lossy();
    if raw.contains('\0') {
        return Err(escape(candidate, "null byte in path"));
    }

    let canonical_base = base
        .canonicalize()
        .map_err(|_| escape(base, "confinement base does not resolve"))?;

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        canonical_base.join(candidate)
    };

    // Lexical normalization: validate each component, resolve `..` against
    // the depth accumulated so far, and refuse to pop above the base.
    let mut resolved = PathBuf::new();
    let mut depth_above_root = 0usize;
    for component in joined.components() {
        match component {
            Component::Prefix(p) => resolved.push(p.as_os_str()),
            Component::RootDir => resolved.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(escape(candidate, "parent traversal above root"));
                }
                if depth_above_root == 0 {
                    return Err(escape(candidate, "parent traversal escapes base"));
                }
                depth_above_root -= 1;
            }
            Component::Normal(c) => {
                check_component(candidate, c)?;
                resolved.push(c);
                depth_above_root += 1;
            }
        }
    }

    // Resolve symlinks on the existing portion of the path: canonicalize the
    // deepest existing ancestor, then re-append the not-yet-created tail.
    let (existing, tail) = split_existing(&resolved);
    let canonical_existing = existing
        .canonicalize()
        .map_err(|_| escape(candidate, "path does not resolve"))?;
    let full = canonical_existing.join(&tail);

    if path_is_descendant(&full, &canonical_base) {
        Ok(full)
    } else {
        Err(escape(candidate, "resolves outside base"))
    }
}

fn escape(path: &Path, why: &str) -> CoreError {
    CoreError::PathEscape(format!("{} ({})", path.display(), why))
}

fn check_component(candidate: &Path, component: &std::ffi::OsStr) -> CoreResult<()> {
    let text = component.to_string_lossy();
    // Alternate data streams: `name:stream` on NTFS.
    if text.contains(':') {
        return Err(escape(candidate, "stream separator in component"));
    }
    let stem = text.split('.').next().unwrap_or(&text);
    if RESERVED_NAMES.contains(&fold(stem).as_str()) {
        return Err(escape(candidate, "reserved device name"));
    }
    Ok(())
}

/// Split a path into its deepest existing ancestor and the remaining tail.
fn split_existing(path: &Path) -> (PathBuf, PathBuf) {
    let mut existing = path.to_path_buf();
    let mut tail_parts: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail_parts.push(name.to_os_string());
                existing.pop();
            }
            None => break,
        }
    }
    let mut tail = PathBuf::new();
    for part in tail_parts.iter().rev() {
        tail.push(part);
    }
    (existing, tail)
}

/// Descendant check. Exact comparison first; on case-insensitive platforms a
/// NFKC-case-folded comparison is also accepted.
fn path_is_descendant(path: &Path, base: &Path) -> bool {
    if path.starts_with(base) {
        return true;
    }
    if cfg!(any(windows, target_os = "macos")) {
        let folded_path = fold(&path.to_string_lossy());
        let folded_base = fold(&base.to_string_lossy());
        return folded_path == folded_base
            || folded_path.starts_with(&format!("{}{}", folded_base, std::path::MAIN_SEPARATOR));
    }
    false
}

/// NFKC normalization + lowercase, the folding used for case-insensitive
/// filesystem comparison.
pub(crate) fn fold(s: &str) -> String {
    s.nfkc().collect::<String>().to_lowercase()
}
