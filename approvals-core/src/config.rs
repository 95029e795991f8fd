//! Configuration for the approvals engine.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.
//! Configuration is loaded from `~/.config/approvals/config.toml` and/or
//! `.approvals/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Name of the per-workspace configuration directory.
pub const WORKSPACE_DIR: &str = ".approvals";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Routing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Role of the single step used when no rule matches.
    pub default_role: String,
    /// When set, every built step is due this many hours after creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_due_hours: Option<u64>,
    /// Roles allowed to reassign a step.
    #[serde(default)]
    pub admin_roles: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_role: "FINANCE_MANAGER".to_string(),
            step_due_hours: None,
            admin_roles: vec!["FINANCE_ADMIN".to_string()],
        }
    }
}

/// SQLite location. Relative paths resolve against the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(WORKSPACE_DIR).join("approvals.db"),
        }
    }
}

/// Static role membership, role -> users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily-rolling JSON logs. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_dir: Option<PathBuf>,
}

impl ApprovalsConfig {
    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.routing.default_role.trim().is_empty() {
            problems.push("routing.default_role must not be empty".to_string());
        }
        match self.routing.step_due_hours {
            Some(0) => problems.push("routing.step_due_hours must be greater than 0".to_string()),
            Some(h) if h > MAX_DUE_HOURS => problems.push(format!(
                "routing.step_due_hours must be at most {MAX_DUE_HOURS}"
            )),
            _ => {}
        }
        if self.routing.admin_roles.iter().any(|r| r.trim().is_empty()) {
            problems.push("routing.admin_roles must not contain empty roles".to_string());
        }
        if self.database.path.as_os_str().is_empty() {
            problems.push("database.path must not be empty".to_string());
        }
        for (role, users) in &self.identity.roles {
            if role.trim().is_empty() {
                problems.push("identity.roles contains an empty role name".to_string());
            }
            if users.iter().any(|u| u.trim().is_empty()) {
                problems.push(format!("identity.roles.{role} contains an empty user id"));
            }
        }
        problems
    }

    /// [`validate`](Self::validate) folded into a single error.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                message: problems.join("; "),
            })
        }
    }

    /// Database path, resolved against `workspace` when relative.
    pub fn database_path(&self, workspace: &Path) -> PathBuf {
        if self.database.path.is_absolute() {
            self.database.path.clone()
        } else {
            workspace.join(&self.database.path)
        }
    }
}

/// Ten years. Keeps due dates inside chrono's range.
const MAX_DUE_HOURS: u64 = 24 * 365 * 10;

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ApprovalsConfig>,
) -> Result<ApprovalsConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ApprovalsConfig::default()));

    // User-level config
    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (APPROVALS_ROUTING__DEFAULT_ROLE, APPROVALS_DATABASE__PATH, etc.)
    figment = figment.merge(Env::prefixed("APPROVALS_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "approvals", "approvals")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// `<workspace>/.approvals/config.toml`.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_DIR).join("config.toml")
}

/// Check whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}

/// Write `config` to the workspace config file, creating the directory.
/// Returns the path written.
pub fn write_workspace_config(workspace: &Path, config: &ApprovalsConfig) -> Result<PathBuf, ConfigError> {
    let path = workspace_config_path(workspace);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    std::fs::write(&path, body)?;
    Ok(path)
}
