//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (<user config dir>/rulectl/config.toml)
//! 3. Project config (<repo>/.rulectl/config.toml)
//! 4. Environment variables (RULECTL_* prefix, `__` separates sections)

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::constants::paths;
use crate::types::{Result, RulectlError};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a repository:
    /// defaults → global → project → env vars
    pub fn load(repo_root: &Path) -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        let project_path = Self::project_config_path(repo_root);
        if project_path.exists() {
            debug!("Loading project config from: {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        // e.g. RULECTL_RATE_LIMIT__REQUESTS_PER_MINUTE -> rate_limit.requests_per_minute
        figment = figment.merge(Env::prefixed("RULECTL_").split("__").lowercase(true));

        let config: Config = figment
            .extract()
            .map_err(|e| RulectlError::Config(format!("Configuration error: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file only
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| RulectlError::Config(format!("Configuration error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Global config directory (platform config dir + `rulectl`)
    pub fn global_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "rulectl").map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join(paths::CONFIG_FILE))
    }

    /// State directory for a repository
    pub fn project_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(paths::STATE_DIR)
    }

    pub fn project_config_path(repo_root: &Path) -> PathBuf {
        Self::project_dir(repo_root).join(paths::CONFIG_FILE)
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    /// Show config file paths
    pub fn show_path(repo_root: &Path) {
        println!("Configuration paths:");
        println!();

        if let Some(global) = Self::global_config_path() {
            let exists = if global.exists() { "✓" } else { "✗" };
            println!("  Global:  {} {}", exists, global.display());
        } else {
            println!("  Global:  (not available)");
        }

        let project = Self::project_config_path(repo_root);
        let exists = if project.exists() { "✓" } else { "✗" };
        println!("  Project: {} {}", exists, project.display());
    }

    /// Show current effective configuration
    pub fn show_config(repo_root: &Path, as_json: bool) -> Result<()> {
        let config = Self::load(repo_root)?;

        if as_json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| RulectlError::Config(e.to_string()))?
            );
        }

        Ok(())
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Write the default global configuration
    pub fn init_global(force: bool) -> Result<PathBuf> {
        let global_dir = Self::global_dir().ok_or_else(|| {
            RulectlError::Config("Cannot determine global config directory".to_string())
        })?;
        fs::create_dir_all(&global_dir)?;

        let config_path = global_dir.join(paths::CONFIG_FILE);
        Self::write_default(&config_path, force)?;
        Ok(config_path)
    }

    /// Write the default project configuration
    pub fn init_project(repo_root: &Path, force: bool) -> Result<PathBuf> {
        let project_dir = Self::project_dir(repo_root);
        fs::create_dir_all(&project_dir)?;

        let config_path = project_dir.join(paths::CONFIG_FILE);
        Self::write_default(&config_path, force)?;
        Ok(config_path)
    }

    fn write_default(config_path: &Path, force: bool) -> Result<()> {
        if config_path.exists() && !force {
            info!("Config exists: {}", config_path.display());
            return Ok(());
        }
        fs::write(config_path, Self::default_config())?;
        info!("Created config: {}", config_path.display());
        Ok(())
    }

    /// Default config content (TOML)
    fn default_config() -> String {
        r#"# rulectl configuration
# Project settings in .rulectl/config.toml override the global file.
# Environment overrides: RULECTL_<SECTION>__<KEY>, e.g. RULECTL_RATE_LIMIT__REQUESTS_PER_MINUTE=10

version = "1.0"

[llm]
provider = "anthropic"
timeout_secs = 120

# Budget fields left unset use the provider defaults
[rate_limit]
strategy = "adaptive"
# requests_per_minute = 5
# base_delay_ms = 1000
# max_delay_ms = 60000

[batching]
enabled = true
batch_size = 3
delay_between_batches_ms = 2000
concurrency = 2

[failure]
max_failure_ratio = 0.5

[session]
checkpoint_every_items = 10
checkpoint_every_secs = 30
auto_resume = false
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitStrategy;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_template_parses() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, ConfigLoader::default_config()).unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.batching.batch_size, 3);
        assert_eq!(config.rate_limit.requests_per_minute, None);
    }

    #[test]
    fn test_project_config_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join(".rulectl");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(
            state_dir.join("config.toml"),
            "[rate_limit]\nstrategy = \"exponential\"\nrequests_per_minute = 12\n",
        )
        .unwrap();

        let config = ConfigLoader::load(temp_dir.path()).unwrap();
        assert_eq!(config.rate_limit.strategy, RateLimitStrategy::Exponential);
        assert_eq!(config.rate_limit.requests_per_minute, Some(12));
    }

    #[test]
    fn test_invalid_project_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join(".rulectl");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(
            state_dir.join("config.toml"),
            "[failure]\nmax_failure_ratio = 3.0\n",
        )
        .unwrap();

        assert!(matches!(
            ConfigLoader::load(temp_dir.path()),
            Err(RulectlError::Config(_))
        ));
    }

    #[test]
    fn test_init_project_writes_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = ConfigLoader::init_project(temp_dir.path(), false).unwrap();
        assert!(path.ends_with(".rulectl/config.toml"));

        fs::write(&path, "version = \"custom\"\n").unwrap();
        ConfigLoader::init_project(temp_dir.path(), false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "version = \"custom\"\n");
    }

    #[test]
    fn test_env_override() {
        let temp_dir = TempDir::new().unwrap();
        // SAFETY: no other test reads this variable
        unsafe {
            std::env::set_var("RULECTL_LLM__MAX_TOKENS", "1234");
        }
        let config = ConfigLoader::load(temp_dir.path());
        unsafe {
            std::env::remove_var("RULECTL_LLM__MAX_TOKENS");
        }
        assert_eq!(config.unwrap().llm.max_tokens, 1234);
    }
}
