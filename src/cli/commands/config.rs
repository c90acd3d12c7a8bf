//! Config Command
//!
//! Manage rulectl configuration.
//!
//! Usage:
//!   rulectl config show [-g] [-f json]
//!   rulectl config path
//!   rulectl config init [-g] [--force]

use std::path::Path;

use super::start::resolve_repo;
use crate::cli::ui::Output;
use crate::config::ConfigLoader;
use crate::types::Result;

/// Show configuration
pub fn show(dir: Option<&Path>, global: bool, format: &str) -> Result<()> {
    let output = Output::new();
    if !global {
        let repo = resolve_repo(dir)?;
        return ConfigLoader::show_config(&repo, format == "json");
    }

    match ConfigLoader::global_config_path() {
        Some(path) if path.exists() => {
            println!("# Global Config: {}\n", path.display());
            println!("{}", std::fs::read_to_string(&path)?);
        }
        Some(_) => {
            output.info("No global config found");
            output.info("Run 'rulectl config init --global' to create one");
        }
        None => output.warning("Cannot determine global config directory"),
    }
    Ok(())
}

/// Show configuration paths
pub fn path(dir: Option<&Path>) -> Result<()> {
    let repo = resolve_repo(dir)?;
    ConfigLoader::show_path(&repo);
    Ok(())
}

/// Write a default configuration file
pub fn init(dir: Option<&Path>, global: bool, force: bool) -> Result<()> {
    let config_path = if global {
        ConfigLoader::init_global(force)?
    } else {
        ConfigLoader::init_project(&resolve_repo(dir)?, force)?
    };

    let output = Output::new();
    output.success(if global {
        "Initialized global configuration"
    } else {
        "Initialized project configuration"
    });
    output.field("Config", config_path.display());
    Ok(())
}
