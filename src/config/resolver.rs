//! Configuration discovery and parsing.
//!
//! [`ConfigResolver`] finds the placement document (an explicit path, or the
//! first usable file in its search list), parses it, and memoizes the result
//! per requested path for the life of the resolver. Call
//! [`ConfigResolver::clear`] to force a re-read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::{default_lyra_dir, DocumentFormat, PlacementConfig};

/// A placement document exists but cannot be used. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config file {}: {message}", path.display())]
    Format { path: PathBuf, message: String },
}

/// Resolves placement configurations with a per-path cache.
#[derive(Debug)]
pub struct ConfigResolver {
    search_paths: Vec<PathBuf>,
    cache: Mutex<HashMap<Option<PathBuf>, Arc<PlacementConfig>>>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver over the default search list.
    pub fn new() -> Self {
        Self::with_search_paths(default_search_paths())
    }

    /// Resolver over a custom search list, tried in order.
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Resolve the configuration for `explicit`, or by searching when `None`.
    ///
    /// A missing explicit file, or no file anywhere in the search list,
    /// yields the defaults. A malformed explicit file is an error; malformed
    /// files in the search list are skipped.
    pub fn resolve(&self, explicit: Option<&Path>) -> Result<Arc<PlacementConfig>, ConfigError> {
        let key = explicit.map(Path::to_path_buf);
        if let Some(cached) = self.lock().get(&key) {
            debug!(path = ?key, "using cached placement configuration");
            return Ok(Arc::clone(cached));
        }

        let config = match explicit {
            Some(path) => resolve_explicit(path)?,
            None => self.search(),
        };

        let config = Arc::new(config);
        self.lock().insert(key, Arc::clone(&config));
        Ok(config)
    }

    /// Drop every memoized configuration.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn search(&self) -> PlacementConfig {
        for path in &self.search_paths {
            if !path.exists() {
                continue;
            }
            match read_document(path) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded placement configuration");
                    return config;
                }
                Err(e) => warn!("skipping {e}"),
            }
        }
        info!("no placement configuration found, using defaults");
        PlacementConfig::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Option<PathBuf>, Arc<PlacementConfig>>> {
        // Entries are whole values written in one insert, so a poisoned map is still consistent.
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Default search order: `config/`, `data/`, the working directory, then `~/.lyra/`.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for dir in [Some("config"), Some("data"), None] {
        for name in ["model_config.toml", "model_config.json"] {
            paths.push(match dir {
                Some(dir) => Path::new(dir).join(name),
                None => PathBuf::from(name),
            });
        }
    }
    if let Some(dir) = default_lyra_dir() {
        paths.push(dir.join("model_config.toml"));
    }
    paths
}

fn resolve_explicit(path: &Path) -> Result<PlacementConfig, ConfigError> {
    if !path.exists() {
        info!("no config file at {}, using defaults", path.display());
        return Ok(PlacementConfig::default());
    }
    let config = read_document(path)?;
    info!(path = %path.display(), "loaded placement configuration");
    Ok(config)
}

fn read_document(path: &Path) -> Result<PlacementConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    PlacementConfig::from_document(&contents, DocumentFormat::for_path(path)).map_err(|message| {
        ConfigError::Format {
            path: path.to_path_buf(),
            message,
        }
    })
}
