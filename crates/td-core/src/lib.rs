//! Shared configuration and vocabulary types for the tandem orchestration
//! crates.

pub mod config;
pub mod types;

pub use config::{ConfigError, CredentialProvider, TandemConfig};
pub use types::{ProviderKind, SpeedClass, TaskCategory};
