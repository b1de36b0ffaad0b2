//! Infrastructure layer: configuration, storage adapters and the job queue.

pub mod config;
pub mod jobs;
pub mod store;

pub use config::{AppConfig, ConfigError};
pub use store::{InMemoryStore, PostgresStore};
