//! ember-core — shared model for the Ember executor orchestrator.
//!
//! Holds the lifecycle state tags, error classification, the status
//! snapshot handed to callers, the executor wire types, and the
//! `ember.toml` configuration parser. Every other Ember crate depends on
//! this one and nothing here performs I/O beyond reading a config file.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AwsConfig, BackendPaths, CatalogConfig, ConfigError, EmberConfig, ExecutorConfig,
    LifecycleConfig, parse_duration,
};
pub use error::{ErrorKind, ErrorRecord, ResourceError, ResourceResult};
pub use types::*;
