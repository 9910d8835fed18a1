use super::validate_id;
use crate::roles::RoleProfile;
use anyhow::{bail, Result};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// On-disk role library: `roles/<name>.yaml`, one validated profile each.
pub struct RoleStore {
    dir: PathBuf,
}

impl RoleStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn open_default() -> Self {
        Self::new(crate::paths::roles_dir())
    }

    pub fn save(&self, role: &RoleProfile) -> Result<()> {
        validate_id(&role.name)?;
        fs::create_dir_all(&self.dir)?;
        let yaml = role.to_yaml()?;
        fs::write(self.dir.join(format!("{}.yaml", role.name)), yaml)?;
        Ok(())
    }

    /// Load and re-validate one role. Validation runs on every load so the
    /// hardcoded block subtraction applies even to hand-edited files.
    pub fn load(&self, name: &str) -> Result<RoleProfile> {
        validate_id(name)?;
        let path = self.dir.join(format!("{}.yaml", name));
        if !path.exists() {
            bail!("role '{}' not found", name);
        }
        let content = fs::read_to_string(&path)?;
        Ok(RoleProfile::from_yaml(&content)?)
    }

    pub fn list(&self) -> Result<Vec<RoleProfile>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut roles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "yaml") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match RoleProfile::from_yaml(&content) {
                Ok(role) => roles.push(role),
                Err(e) => warn!("Skipping invalid role at {}: {}", path.display(), e),
            }
        }
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        validate_id(name)?;
        let path = self.dir.join(format!("{}.yaml", name));
        if !path.exists() {
            bail!("role '{}' not found", name);
        }
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_id(name).is_ok() && self.dir.join(format!("{}.yaml", name)).exists()
    }
}
