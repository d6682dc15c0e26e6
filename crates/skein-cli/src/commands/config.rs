//! Configuration command

use anyhow::{Context, Result};
use clap::Args;
use skein_core::SessionConfig;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// JSON file with settings; missing fields keep their defaults
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

/// Load the effective configuration, validated
pub fn load(file: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = file else {
        let config = SessionConfig::default();
        config.validate()?;
        return Ok(config);
    };

    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let config = SessionConfig::from_json(&json)
        .with_context(|| format!("Invalid config: {}", path.display()))?;
    Ok(config)
}

pub fn run(args: ConfigArgs) -> Result<()> {
    let config = load(args.file.as_deref())?;
    println!("{}", config.to_json()?);
    Ok(())
}
