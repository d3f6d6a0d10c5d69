//! Config Command
//!
//! Manage codeloom configuration.
//!
//! Usage:
//!   codeloom config show [-f json|toml]
//!   codeloom config path
//!   codeloom config init [--global] [--force]

use crate::cli::Output;
use crate::config::ConfigLoader;
use crate::types::{LoomError, Result};

/// Show the merged effective configuration
pub fn show(format: &str) -> Result<()> {
    match format {
        "json" => ConfigLoader::show_config(true),
        "toml" => ConfigLoader::show_config(false),
        other => Err(LoomError::Config(format!(
            "Unknown format '{}'. Valid values: toml, json",
            other
        ))),
    }
}

/// Show configuration paths
pub fn path() -> Result<()> {
    ConfigLoader::show_path();
    Ok(())
}

/// Write a default config file, globally or for the current project
pub fn init(global: bool, force: bool) -> Result<()> {
    let output = Output::new();
    let (scope, config_path) = if global {
        ("global", ConfigLoader::init_global(force)?)
    } else {
        ("project", ConfigLoader::init_project(force)?)
    };

    output.success(&format!("Initialized {} configuration", scope));
    output.field("Config", config_path.display());
    Ok(())
}
