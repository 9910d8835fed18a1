use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Resolve the workspace a session will be delegated against.
///
/// An explicit path wins; otherwise walk up from the current directory
/// looking for a `.git` marker, falling back to the current directory
/// itself. The resolved root must exist and must not be the ARA state
/// area — sessions never operate on the engine's own files.
pub fn resolve_workspace_root(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let root = match explicit {
        Some(p) => p,
        None => {
            let cwd = std::env::current_dir()?;
            find_git_root(&cwd).unwrap_or(cwd)
        }
    };
    if !root.is_dir() {
        bail!("workspace {} is not a directory", root.display());
    }
    let canonical = root.canonicalize()?;
    let home = crate::paths::ara_home();
    if home.exists() {
        if let Ok(home_canonical) = home.canonicalize() {
            if canonical.starts_with(&home_canonical) {
                bail!("refusing to use the ARA state area as a workspace");
            }
        }
    }
    Ok(canonical)
}

fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        cur = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_workspace_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = resolve_workspace_root(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(resolved, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn missing_workspace_rejected() {
        assert!(resolve_workspace_root(Some(PathBuf::from("/nonexistent/ws"))).is_err());
    }

    #[test]
    fn git_root_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        assert_eq!(find_git_root(&nested).unwrap(), tmp.path());
    }
}
