pub mod config;
pub mod doctor;
pub mod plan;
pub mod recommend;

use anyhow::Result;
use std::path::PathBuf;

use lyra::config::{ConfigOverrides, ConfigResolver, PlacementConfig};
use lyra::system;

/// What the command line asked for: a document path plus field overrides.
pub struct ConfigRequest {
    pub path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
    pub auto_select: bool,
}

impl ConfigRequest {
    /// Resolve the document, then apply auto-selection and overrides, in that order.
    pub fn resolve(&self) -> Result<PlacementConfig> {
        let resolver = ConfigResolver::new();
        let base = resolver.resolve(self.path.as_deref())?;

        let base = if self.auto_select {
            tracing::info!("auto-selecting model based on system resources");
            system::recommend::auto_select(&base, system::detect())
        } else {
            PlacementConfig::clone(&base)
        };

        Ok(self.overrides.apply(&base))
    }
}

pub(crate) fn format_gb(gb: f64) -> String {
    format!("{gb:.1} GB")
}
