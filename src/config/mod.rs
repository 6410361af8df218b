//! Configuration Management Module
//!
//! Runtime settings and the JSON document storage shared by the registry,
//! session and schedule stores.

pub mod settings;
pub mod storage;

pub use settings::{TetherConfig, CONFIG_FILE, DEFAULT_USERNAME};
pub use storage::{data_dir, log_dir, JsonStore, StorageError, STORE_VERSION};
