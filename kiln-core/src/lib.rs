//! kiln core library: resolved configuration, pipeline and cache record
//! types, errors.
//!
//! Public API surface:
//! - [`config`]: `kiln.yaml` loading and [`Config`] resolution
//! - [`types`]: [`PipelineSetting`], [`CacheRecord`], [`Role`]
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{resolve, Config, ConfigFile, ConfigOverrides};
pub use error::ConfigError;
pub use types::{CacheRecord, CacheWritePolicy, PipelineSetting, Role};
