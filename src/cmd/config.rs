//! Configuration view and validation commands: `code-sentinel config`.

use std::path::Path;

use anyhow::Result;
use code_sentinel::config::Config;

use super::super::ConfigCommands;

pub fn cmd_config(path: &Path, config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No config file at {} (using defaults)", path.display());
            }
            println!();
            let mut shown = config.clone();
            if shown.model.api_key.is_some() {
                shown.model.api_key = Some("********".to_string());
            }
            if shown.provisioning.cluster_uri.is_some() {
                shown.provisioning.cluster_uri = Some("********".to_string());
            }
            print!("{}", toml::to_string_pretty(&shown)?);
        }
        Some(ConfigCommands::Check) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("Configuration has {} problem(s)", problems.len());
            }
        }
    }
    Ok(())
}
