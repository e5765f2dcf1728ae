//! Internal error type for the settings store.
//!
//! None of these escape [`crate::ConfigStore::load`]: each one is recovered
//! by falling back to the compiled-in defaults.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File content is not a JSON object
    #[error("Corrupt settings file '{path}': {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to write '{path}': {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
