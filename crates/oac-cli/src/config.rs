//! Plan-level configuration for `oac`: a small TOML file plus a
//! resolution chain (CLI flag > env var > config file > default),
//! trimmed from the teacher's config layer down to what a
//! budget-constrained execution run actually needs -- no database, no
//! auth secrets.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Return the oac config directory: `$XDG_CONFIG_HOME/oac` or `~/.config/oac`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("oac");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("oac")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// On-disk shape. Every field is optional: an absent config file, or an
/// absent field within one, simply falls through to the next link in
/// the resolution chain.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    #[serde(default)]
    pub branch_prefix: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
    #[serde(default)]
    pub token_budget: Option<u64>,
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// Load and parse the config file, if present. A missing file is not an
/// error -- every value it could supply has a further fallback.
pub fn load_config() -> Option<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&contents) {
        Ok(config) => Some(config),
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "ignoring unparsable config file");
            None
        }
    }
}

/// Writes a starter config file, creating parent directories as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents).with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

/// Fully resolved run configuration, CLI flags already folded in by the
/// caller -- this just supplies the env-var and config-file links of the
/// chain and the final defaults.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub providers: Vec<String>,
    pub branch_prefix: String,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub task_timeout_ms: u64,
    pub token_budget: u64,
    pub base_branch: String,
}

impl RunConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        cli_providers: Option<Vec<String>>,
        cli_branch_prefix: Option<String>,
        cli_concurrency: Option<usize>,
        cli_max_attempts: Option<u32>,
        cli_task_timeout_ms: Option<u64>,
        cli_token_budget: Option<u64>,
        cli_base_branch: Option<String>,
    ) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let providers = cli_providers
            .or(file.providers)
            .or_else(|| std::env::var("OAC_PROVIDERS").ok().map(|v| v.split(',').map(|s| s.trim().to_string()).collect()))
            .unwrap_or_else(|| vec!["claude-code".to_string()]);

        if providers.is_empty() {
            anyhow::bail!("at least one provider must be configured");
        }

        let branch_prefix = cli_branch_prefix.or(file.branch_prefix).unwrap_or_else(|| "oac".to_string());
        let concurrency = cli_concurrency.or(file.concurrency).unwrap_or(2);
        let max_attempts = cli_max_attempts.or(file.max_attempts).unwrap_or(2);
        let task_timeout_ms = cli_task_timeout_ms.or(file.task_timeout_ms).unwrap_or(300_000);
        let token_budget = cli_token_budget.or(file.token_budget).unwrap_or(50_000);
        let base_branch = cli_base_branch.or(file.base_branch).unwrap_or_else(|| "main".to_string());

        if concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }

        Ok(Self { providers, branch_prefix, concurrency, max_attempts, task_timeout_ms, token_budget, base_branch })
    }
}
