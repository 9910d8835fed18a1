//! Thin CLI transport over the operator surface.
//!
//! Subcommands map 1:1 onto core operations and contain no business logic;
//! they parse arguments, call the `Core`, and print the typed result.

use crate::auth::AuthMethod;
use crate::ops::{Core, OpResult};
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage role profiles
    Role {
        #[command(subcommand)]
        action: RoleAction,
    },
    /// Manage skills
    Skill {
        #[command(subcommand)]
        action: SkillAction,
    },
    /// Run and govern sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Configure operator authentication
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum RoleAction {
    /// List roles
    List,
    /// Show one role
    Show { name: String },
    /// Create a role from a starter template or a YAML file
    Create {
        /// Starter template name (software-engineer, code-reviewer, doc-writer)
        #[arg(long)]
        template: Option<String>,
        /// Path to a role YAML file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Update a role from a YAML file (requires current credential)
    Update {
        name: String,
        file: PathBuf,
        #[arg(long)]
        credential: Option<String>,
    },
    /// Delete a role (requires current credential)
    Delete {
        name: String,
        #[arg(long)]
        credential: Option<String>,
    },
    /// Validate a role YAML file without saving it
    Validate { file: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum SkillAction {
    /// List skills (bundled and library)
    List,
    /// Show one skill
    Show { name: String },
    /// Create a skill from a SKILL.md file
    Create { file: PathBuf },
    /// Import a skill directory
    Import { dir: PathBuf },
    /// Delete a skill
    Delete { name: String },
    /// Re-scan a skill (restores approval after an integrity demotion)
    Scan { name: String },
}

#[derive(Subcommand, Debug)]
pub enum SessionAction {
    /// Start a session: decompose the goal and execute it in the sandbox
    Start { role: String, goal: String },
    /// Pause a running session
    Pause { id: String },
    /// Resume a paused session
    Resume { id: String },
    /// Cancel a session
    Cancel { id: String },
    /// Show one session
    Status { id: String },
    /// List sessions
    List,
    /// Show the pending file changes of a session
    Diff { id: String },
    /// Review a session: diff, decision log, approval queue
    Review { id: String },
    /// Approve a task from the approval queue
    Approve { id: String, task_id: String },
    /// Promote sandbox changes into the workspace (gated)
    Promote {
        id: String,
        #[arg(long)]
        credential: Option<String>,
    },
    /// Reject a completed session, keeping its sandbox
    Reject { id: String },
    /// Undo the most recent promotion of a session
    Undo { id: String },
    /// Roll a session back to a checkpoint
    Rollback {
        id: String,
        #[arg(long)]
        checkpoint: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuditAction {
    /// Query audit entries, optionally for one session
    Query {
        #[arg(long)]
        session: Option<String>,
    },
    /// Verify the hash chain
    Verify,
    /// Rotate the chain under a fresh HMAC key
    Rotate,
}

#[derive(Subcommand, Debug)]
pub enum AuthAction {
    /// Enroll a verification method
    Configure {
        /// "pin" or "totp"
        method: String,
        #[arg(long)]
        pin: Option<String>,
    },
    /// Switch methods (verifies under the current one first)
    Switch {
        /// Current method: "pin" or "totp"
        current: String,
        credential: String,
        #[arg(long)]
        new_pin: Option<String>,
    },
    /// Verify a credential
    Verify { method: String, credential: String },
}

fn parse_method(s: &str) -> Result<AuthMethod, OpResult> {
    match s {
        "pin" => Ok(AuthMethod::Pin),
        "totp" => Ok(AuthMethod::Totp),
        other => Err(OpResult::fail(
            "invalid_state",
            format!("unknown auth method '{}', expected pin or totp", other),
        )),
    }
}

fn read_file(path: &PathBuf) -> Result<String, OpResult> {
    std::fs::read_to_string(path)
        .map_err(|e| OpResult::fail("io", format!("cannot read {}: {}", path.display(), e)))
}

pub async fn dispatch(core: &Core, command: Command, workspace: Option<PathBuf>) -> OpResult {
    match command {
        Command::Role { action } => match action {
            RoleAction::List => core.role_list(),
            RoleAction::Show { name } => core.role_show(&name),
            RoleAction::Create { template, file } => {
                let yaml = match &file {
                    Some(path) => match read_file(path) {
                        Ok(y) => Some(y),
                        Err(r) => return r,
                    },
                    None => None,
                };
                core.role_create(template.as_deref(), yaml.as_deref())
            }
            RoleAction::Update { name, file, credential } => match read_file(&file) {
                Ok(yaml) => core.role_update(&name, &yaml, credential.as_deref()),
                Err(r) => r,
            },
            RoleAction::Delete { name, credential } => {
                core.role_delete(&name, credential.as_deref())
            }
            RoleAction::Validate { file } => match read_file(&file) {
                Ok(yaml) => core.role_validate(&yaml),
                Err(r) => r,
            },
        },
        Command::Skill { action } => match action {
            SkillAction::List => core.skill_list(),
            SkillAction::Show { name } => core.skill_show(&name),
            SkillAction::Create { file } => match read_file(&file) {
                Ok(md) => core.skill_create(&md),
                Err(r) => r,
            },
            SkillAction::Import { dir } => core.skill_import(&dir),
            SkillAction::Delete { name } => core.skill_delete(&name),
            SkillAction::Scan { name } => core.skill_scan(&name),
        },
        Command::Session { action } => match action {
            // The CLI is a one-shot process; sessions always run in the
            // foreground here. Long-running hosts pass detach=true.
            SessionAction::Start { role, goal } => {
                core.session_start(&role, &goal, workspace, false).await
            }
            SessionAction::Pause { id } => core.session_pause(&id).await,
            SessionAction::Resume { id } => core.session_resume(&id).await,
            SessionAction::Cancel { id } => core.session_cancel(&id).await,
            SessionAction::Status { id } => core.session_status(&id),
            SessionAction::List => core.session_list(),
            SessionAction::Diff { id } => core.session_diff(&id),
            SessionAction::Review { id } => core.session_review(&id),
            SessionAction::Approve { id, task_id } => core.session_approve_task(&id, &task_id),
            SessionAction::Promote { id, credential } => {
                core.session_promote(&id, credential.as_deref())
            }
            SessionAction::Reject { id } => core.session_reject(&id),
            SessionAction::Undo { id } => core.session_undo(&id),
            SessionAction::Rollback { id, checkpoint } => {
                core.session_rollback(&id, checkpoint.as_deref())
            }
        },
        Command::Audit { action } => match action {
            AuditAction::Query { session } => core.audit_query(session.as_deref()),
            AuditAction::Verify => core.audit_verify(),
            AuditAction::Rotate => core.audit_rotate(),
        },
        Command::Auth { action } => match action {
            AuthAction::Configure { method, pin } => match parse_method(&method) {
                Ok(m) => core.auth_configure(m, pin.as_deref()),
                Err(r) => r,
            },
            AuthAction::Switch { current, credential, new_pin } => match parse_method(&current) {
                Ok(m) => core.auth_switch(m, &credential, new_pin.as_deref()),
                Err(r) => r,
            },
            AuthAction::Verify { method, credential } => match parse_method(&method) {
                Ok(m) => core.auth_verify(m, &credential),
                Err(r) => r,
            },
        },
    }
}

pub fn print_result(result: &OpResult, json: bool) {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("failed to serialize result: {}", e),
        }
        return;
    }
    if result.success {
        println!("{}", result.message);
        if !result.data.is_null() {
            if let Ok(pretty) = serde_json::to_string_pretty(&result.data) {
                println!("{}", pretty);
            }
        }
    } else {
        eprintln!(
            "error ({}): {}",
            result.error_kind.as_deref().unwrap_or("unknown"),
            result.message
        );
    }
}
