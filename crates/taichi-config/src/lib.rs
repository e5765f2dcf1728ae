//! taichi-config - Self-healing settings store
//!
//! Loads the gateway's JSON settings file once at startup and guarantees
//! that every key the process relies on has a value:
//!
//! - a missing file is created with the compiled-in defaults;
//! - an unparsable file is overwritten with the defaults;
//! - a parsable file with missing keys is completed in memory only and
//!   left untouched on disk.
//!
//! # Usage
//!
//! ```no_run
//! use taichi_config::{ConfigKey, ConfigStore};
//!
//! let config = ConfigStore::new(ConfigStore::default_path()).load();
//! println!("{}", config.get(ConfigKey::SourceUrl));
//! ```

mod config;
mod error;
mod store;

pub use config::{ConfigKey, Configuration};
pub use store::{ConfigStore, LoadOutcome, DEFAULT_FILE_NAME};
