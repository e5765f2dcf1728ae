//! Settings file loading and repair

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{ConfigKey, Configuration};
use crate::error::ConfigError;

/// File name used next to the executable when no path is given
pub const DEFAULT_FILE_NAME: &str = "config.json";

/// What [`ConfigStore::load_with_outcome`] had to do to produce a
/// complete configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// File was absent; defaults were written
    Created,
    /// File was unparsable; defaults were written over it
    Recovered { reason: String },
    /// File parsed but lacked keys; defaults filled in memory only
    Patched { missing: Vec<ConfigKey> },
    /// File parsed and was complete
    Loaded,
    /// File exists but could not be read; defaults used, file left alone
    Unreadable { reason: String },
}

/// Loader for the JSON settings file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `config.json` in the directory of the running executable, or in the
    /// working directory when the executable path is unknown.
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_FILE_NAME)))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration. Never fails: every problem with the file is
    /// resolved by falling back to defaults.
    pub fn load(&self) -> Configuration {
        self.load_with_outcome().0
    }

    /// Load the configuration and report how it was obtained.
    ///
    /// At most one write happens, and only when the file was absent or
    /// corrupt. A file that parses but is missing keys is never rewritten.
    pub fn load_with_outcome(&self) -> (Configuration, LoadOutcome) {
        match self.read() {
            Ok(Some(values)) => {
                let (config, missing) = Configuration::complete(values);
                if missing.is_empty() {
                    debug!(path = %self.path.display(), "Loaded settings");
                    (config, LoadOutcome::Loaded)
                } else {
                    info!(
                        path = %self.path.display(),
                        missing = ?missing.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
                        "Settings file is missing keys, using defaults for them"
                    );
                    (config, LoadOutcome::Patched { missing })
                }
            }
            Ok(None) => {
                info!(path = %self.path.display(), "Settings file not found, creating it with defaults");
                let config = Configuration::default();
                self.persist_or_warn(&config);
                (config, LoadOutcome::Created)
            }
            Err(err @ ConfigError::Corrupt { .. }) => {
                warn!(error = %err, "Settings file is corrupt, replacing it with defaults");
                let config = Configuration::default();
                self.persist_or_warn(&config);
                (
                    config,
                    LoadOutcome::Recovered {
                        reason: err.to_string(),
                    },
                )
            }
            Err(err) => {
                warn!(error = %err, "Settings file unreadable, using defaults");
                (
                    Configuration::default(),
                    LoadOutcome::Unreadable {
                        reason: err.to_string(),
                    },
                )
            }
        }
    }

    /// Read and parse the file. `Ok(None)` means the file does not exist.
    fn read(&self) -> Result<Option<Map<String, Value>>, ConfigError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(values)) => Ok(Some(values)),
            Ok(other) => Err(ConfigError::Corrupt {
                path: self.path.clone(),
                reason: format!("expected a JSON object, found {}", json_kind(&other)),
            }),
            Err(e) => Err(ConfigError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn persist(&self, config: &Configuration) -> Result<(), ConfigError> {
        let persist_err = |source| ConfigError::Persist {
            path: self.path.clone(),
            source,
        };
        let body = config
            .to_json()
            .map_err(|e| persist_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(&self.path, body).map_err(persist_err)
    }

    fn persist_or_warn(&self, config: &Configuration) {
        if let Err(err) = self.persist(config) {
            warn!(error = %err, "Could not persist default settings, continuing in memory");
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
