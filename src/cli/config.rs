//! CLI `config` commands: show, write and describe the placement document.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use lyra::config::{DocumentFormat, PlacementConfig};

use super::ConfigRequest;

/// Print the resolved configuration as TOML.
pub fn show(request: &ConfigRequest) -> Result<()> {
    let config = request.resolve()?;
    print!("{}", config.to_document(DocumentFormat::Toml)?);
    Ok(())
}

/// Write the resolved configuration to `path`.
pub fn init(request: &ConfigRequest, path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from("config/model_config.toml"));
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }

    let config = request.resolve()?;
    config.save(&path)?;
    println!("Wrote placement configuration to {}", path.display());
    Ok(())
}

/// Print the JSON Schema of the configuration document.
pub fn schema() -> Result<()> {
    let schema = schemars::schema_for!(PlacementConfig);
    let json = serde_json::to_string_pretty(&schema).context("failed to render schema")?;
    println!("{json}");
    Ok(())
}
