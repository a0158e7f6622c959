//! Configuration file loader.

use std::path::PathBuf;

use super::Config;

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default search paths.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from(".decoder-supervisor.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("decoder-supervisor").join("config.toml"));
        }

        Self { search_paths }
    }

    /// Create a config loader with a specific config file path.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            search_paths: vec![path],
        }
    }

    /// Load configuration from the first available file, or return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(&self) -> Result<Config, ConfigError> {
        match self.find_config_file() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                Self::load_from_path(path)
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                Ok(Config::default())
            }
        }
    }

    fn load_from_path(path: PathBuf) -> Result<Config, ConfigError> {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(source) => return Err(ConfigError::ReadError { path, source }),
        };

        toml::from_str(&content).map_err(|source| ConfigError::ParseError { path, source })
    }

    /// Get the search paths for debugging.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find the first config file that exists.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths.iter().find(|p| p.exists()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised while loading configuration or resolving decoders.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Unknown decoder: {name}")]
    UnknownDecoder { name: String },

    #[error("Decoder {decoder} needs a value for {{{parameter}}}")]
    MissingParameter { decoder: String, parameter: String },
}
