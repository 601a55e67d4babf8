pub mod config;
pub mod state_store;
pub mod types;

pub use config::{Config, ConfigError};
pub use state_store::{FileStateStore, MemoryStateStore, StateStore, StoreError};
pub use types::*;
