// Role profiles: named autonomous identities with bounded authority.
//
// A role carries three disjoint authority sets (autonomous, requires
// approval, forbidden), confidence thresholds, resource ceilings, and an
// auth method. The hardcoded blocked-action set is subtracted from every
// authority set on load; no configuration can re-enable those actions.

use crate::auth::AuthMethod;
use crate::errors::{CoreError, CoreResult};
use crate::limits::WriteLimits;
use serde::{Deserialize, Serialize};

/// Actions that are never permitted under any role, configuration, or skill.
pub const HARDCODED_BLOCKED: &[&str] = &[
    "delete_repository",
    "force_push",
    "modify_ci_pipeline",
    "access_credentials_store",
    "disable_aegis",
    "modify_aegis_rules",
    "execute_as_root",
    "access_host_filesystem",
];

/// Labels the planner can emit as task action types. Unknown labels may only
/// appear in `requires_approval` or `forbidden`.
pub const KNOWN_ACTIONS: &[&str] = &[
    "read_file",
    "write_file",
    "edit_file",
    "analyze",
    "validate",
    "generic",
];

// ── Starter templates ──────────────────────────────────────────────────

const TEMPLATES: &[(&str, &str)] = &[
    (
        "software-engineer",
        include_str!("../templates/roles/software-engineer.yaml"),
    ),
    (
        "code-reviewer",
        include_str!("../templates/roles/code-reviewer.yaml"),
    ),
    ("doc-writer", include_str!("../templates/roles/doc-writer.yaml")),
];

pub fn template_names() -> Vec<&'static str> {
    TEMPLATES.iter().map(|(n, _)| *n).collect()
}

pub fn template(name: &str) -> Option<&'static str> {
    TEMPLATES.iter().find(|(n, _)| *n == name).map(|(_, t)| *t)
}

// ── Schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    #[serde(default = "default_auto_execute")]
    pub auto_execute: f64,
    #[serde(default = "default_execute_and_flag")]
    pub execute_and_flag: f64,
    #[serde(default = "default_pause_and_ask")]
    pub pause_and_ask: f64,
}

fn default_auto_execute() -> f64 {
    0.90
}
fn default_execute_and_flag() -> f64 {
    0.70
}
fn default_pause_and_ask() -> f64 {
    0.50
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            auto_execute: 0.90,
            execute_and_flag: 0.70,
            pause_and_ask: 0.50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_max_hours")]
    pub max_session_hours: f64,
    #[serde(default = "default_max_cost")]
    pub max_cost_per_session: f64,
    #[serde(default)]
    pub write_limits: WriteLimits,
}

fn default_max_hours() -> f64 {
    8.0
}
fn default_max_cost() -> f64 {
    5.0
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_session_hours: default_max_hours(),
            max_cost_per_session: default_max_cost(),
            write_limits: WriteLimits::default(),
        }
    }
}

/// Where an action label falls for a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    Autonomous,
    RequiresApproval,
    Forbidden,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleProfile {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub scope: String,
    pub auth_method: AuthMethod,
    pub competencies: Vec<String>,
    #[serde(rename = "authority_autonomous")]
    pub autonomous: Vec<String>,
    #[serde(rename = "authority_requires_approval", default)]
    pub requires_approval: Vec<String>,
    #[serde(rename = "authority_forbidden", default)]
    pub forbidden: Vec<String>,
    #[serde(default)]
    pub confidence_thresholds: ConfidenceThresholds,
    #[serde(default = "default_risk")]
    pub risk_tolerance: RiskTolerance,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub assigned_skills: Vec<String>,
    #[serde(default)]
    pub assigned_skill_groups: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

fn default_risk() -> RiskTolerance {
    RiskTolerance::Medium
}

impl RoleProfile {
    /// Parse and validate a role from its YAML description.
    pub fn from_yaml(yaml: &str) -> CoreResult<Self> {
        let mut role: RoleProfile = serde_yml::from_str(yaml)
            .map_err(|e| CoreError::InvalidState(format!("role parse error: {}", e)))?;
        role.validate()?;
        Ok(role)
    }

    /// Validation and normalization applied to every loaded role:
    /// subtract the hardcoded block set, check disjointness, threshold
    /// monotonicity, and label hygiene.
    pub fn validate(&mut self) -> CoreResult<()> {
        // The block set wins over any configuration.
        let blocked = |a: &String| HARDCODED_BLOCKED.contains(&a.as_str());
        self.autonomous.retain(|a| !blocked(a));
        self.requires_approval.retain(|a| !blocked(a));
        self.forbidden.retain(|a| !blocked(a));

        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidState("role name is empty".to_string()));
        }
        if self.description.trim().is_empty() {
            return Err(CoreError::InvalidState(format!(
                "role '{}' has no description",
                self.name
            )));
        }
        if self.competencies.is_empty() {
            return Err(CoreError::InvalidState(format!(
                "role '{}' declares no competencies",
                self.name
            )));
        }
        if self.autonomous.is_empty() {
            return Err(CoreError::InvalidState(format!(
                "role '{}' declares no autonomous actions",
                self.name
            )));
        }

        for (a, b, label) in [
            (&self.autonomous, &self.requires_approval, "autonomous/requires_approval"),
            (&self.autonomous, &self.forbidden, "autonomous/forbidden"),
            (&self.requires_approval, &self.forbidden, "requires_approval/forbidden"),
        ] {
            if let Some(overlap) = a.iter().find(|x| b.contains(x)) {
                return Err(CoreError::RoleAuthorityOverlap(format!(
                    "'{}' appears in both {} for role '{}'",
                    overlap, label, self.name
                )));
            }
        }

        let t = &self.confidence_thresholds;
        for (name, v) in [
            ("auto_execute", t.auto_execute),
            ("execute_and_flag", t.execute_and_flag),
            ("pause_and_ask", t.pause_and_ask),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(CoreError::InvalidState(format!(
                    "threshold {} out of range for role '{}'",
                    name, self.name
                )));
            }
        }
        if !(t.auto_execute >= t.execute_and_flag && t.execute_and_flag >= t.pause_and_ask) {
            return Err(CoreError::InvalidState(format!(
                "thresholds must satisfy auto_execute >= execute_and_flag >= pause_and_ask for role '{}'",
                self.name
            )));
        }

        // Unknown labels are only meaningful as restrictions.
        if let Some(unknown) = self
            .autonomous
            .iter()
            .find(|a| !KNOWN_ACTIONS.contains(&a.as_str()))
        {
            return Err(CoreError::InvalidState(format!(
                "unknown action '{}' cannot be autonomous for role '{}'",
                unknown, self.name
            )));
        }

        Ok(())
    }

    /// Authority classification for an action label. Hardcoded-blocked
    /// actions are forbidden; unknown actions default to requires-approval.
    pub fn is_action_allowed(&self, action: &str) -> Authority {
        if HARDCODED_BLOCKED.contains(&action) {
            return Authority::Forbidden;
        }
        if self.autonomous.iter().any(|a| a == action) {
            return Authority::Autonomous;
        }
        if self.forbidden.iter().any(|a| a == action) {
            return Authority::Forbidden;
        }
        if self.requires_approval.iter().any(|a| a == action) {
            return Authority::RequiresApproval;
        }
        if KNOWN_ACTIONS.contains(&action) {
            // Known but unlisted: the operator must approve.
            return Authority::RequiresApproval;
        }
        Authority::Unknown
    }

    pub fn to_yaml(&self) -> CoreResult<String> {
        serde_yml::to_string(self)
            .map_err(|e| CoreError::InvalidState(format!("role serialize error: {}", e)))
    }

    /// One-line authority summary for prompt assembly.
    pub fn authority_summary(&self) -> String {
        format!(
            "autonomous: [{}]; requires approval: [{}]; forbidden: [{}]",
            self.autonomous.join(", "),
            self.requires_approval.join(", "),
            self.forbidden.join(", ")
        )
    }
}

/// Materialize a starter template as a validated role.
pub fn from_template(template_name: &str) -> CoreResult<RoleProfile> {
    let yaml = template(template_name).ok_or_else(|| {
        CoreError::InvalidState(format!("unknown role template '{}'", template_name))
    })?;
    RoleProfile::from_yaml(yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> String {
        r#"
name: tester
description: runs and writes tests
scope: project
auth_method: pin
competencies: [testing]
authority_autonomous: [read_file, write_file, edit_file, analyze]
authority_requires_approval: [deploy_to_staging]
authority_forbidden: [deploy_to_production]
"#
        .to_string()
    }

    #[test]
    fn minimal_role_loads_with_defaults() {
        let role = RoleProfile::from_yaml(&minimal_yaml()).unwrap();
        assert_eq!(role.name, "tester");
        assert_eq!(role.confidence_thresholds.auto_execute, 0.90);
        assert_eq!(role.confidence_thresholds.execute_and_flag, 0.70);
        assert_eq!(role.confidence_thresholds.pause_and_ask, 0.50);
        assert_eq!(role.risk_tolerance, RiskTolerance::Medium);
        assert_eq!(role.resource_limits.max_session_hours, 8.0);
    }

    #[test]
    fn hardcoded_block_subtracted_on_load() {
        let yaml = minimal_yaml().replace(
            "authority_autonomous: [read_file, write_file, edit_file, analyze]",
            "authority_autonomous: [read_file, force_push, disable_aegis]",
        );
        let role = RoleProfile::from_yaml(&yaml).unwrap();
        assert_eq!(role.autonomous, vec!["read_file"]);
        assert_eq!(role.is_action_allowed("force_push"), Authority::Forbidden);
        assert_eq!(role.is_action_allowed("disable_aegis"), Authority::Forbidden);
    }

    #[test]
    fn overlap_rejected() {
        let yaml = minimal_yaml().replace(
            "authority_requires_approval: [deploy_to_staging]",
            "authority_requires_approval: [write_file]",
        );
        let err = RoleProfile::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, CoreError::RoleAuthorityOverlap(_)));
    }

    #[test]
    fn threshold_monotonicity_enforced() {
        let mut role = RoleProfile::from_yaml(&minimal_yaml()).unwrap();
        role.confidence_thresholds.pause_and_ask = 0.95;
        assert!(role.validate().is_err());
    }

    #[test]
    fn threshold_range_enforced() {
        let mut role = RoleProfile::from_yaml(&minimal_yaml()).unwrap();
        role.confidence_thresholds.auto_execute = 1.5;
        assert!(role.validate().is_err());
    }

    #[test]
    fn unknown_action_cannot_be_autonomous() {
        let yaml = minimal_yaml().replace(
            "authority_autonomous: [read_file, write_file, edit_file, analyze]",
            "authority_autonomous: [launch_rockets]",
        );
        assert!(RoleProfile::from_yaml(&yaml).is_err());
    }

    #[test]
    fn unknown_action_allowed_in_restrictions() {
        let role = RoleProfile::from_yaml(&minimal_yaml()).unwrap();
        // deploy_to_production is not a known action but may be forbidden
        assert_eq!(
            role.is_action_allowed("deploy_to_production"),
            Authority::Forbidden
        );
    }

    #[test]
    fn authority_query_defaults() {
        let role = RoleProfile::from_yaml(&minimal_yaml()).unwrap();
        assert_eq!(role.is_action_allowed("write_file"), Authority::Autonomous);
        assert_eq!(
            role.is_action_allowed("deploy_to_staging"),
            Authority::RequiresApproval
        );
        // known but unlisted → requires approval
        assert_eq!(
            role.is_action_allowed("validate"),
            Authority::RequiresApproval
        );
        // totally unknown → unknown (treated as requires approval upstream)
        assert_eq!(role.is_action_allowed("mystery_op"), Authority::Unknown);
    }

    #[test]
    fn empty_sections_rejected() {
        for (from, to) in [
            ("name: tester", "name: \"\""),
            ("competencies: [testing]", "competencies: []"),
            (
                "authority_autonomous: [read_file, write_file, edit_file, analyze]",
                "authority_autonomous: []",
            ),
        ] {
            let yaml = minimal_yaml().replace(from, to);
            assert!(RoleProfile::from_yaml(&yaml).is_err(), "expected error for {to}");
        }
    }

    #[test]
    fn starter_templates_validate() {
        for name in template_names() {
            let role = from_template(name).unwrap();
            assert!(!role.autonomous.is_empty(), "template {name}");
            assert!(role
                .autonomous
                .iter()
                .all(|a| !HARDCODED_BLOCKED.contains(&a.as_str())));
        }
    }

    #[test]
    fn yaml_roundtrip() {
        let role = RoleProfile::from_yaml(&minimal_yaml()).unwrap();
        let yaml = role.to_yaml().unwrap();
        let reloaded = RoleProfile::from_yaml(&yaml).unwrap();
        assert_eq!(reloaded.name, role.name);
        assert_eq!(reloaded.autonomous, role.autonomous);
    }
}
