//! shared-types-rs
//! Records, storage abstraction and configuration shared across the
//! prompt-evolution workspace.

pub mod config;
pub mod error;
pub mod model;
pub mod storage;

pub use config::{ConfigError, EvolutionConfig, StorageBackend};
pub use error::ErrorClass;
pub use model::*;
pub use storage::{FileKvStore, KvStore, MemoryKvStore, StorageError};
