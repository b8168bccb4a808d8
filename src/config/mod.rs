//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, every error reported)
//!     → ServerConfig (validated, immutable)
//!     → server builds listen options from it
//!
//! On reload:
//!     watcher.rs detects change (or SIGHUP, or a certificate change)
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → server diffs endpoints and rebinds only what changed
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Equality is by value; certificate change flags are not compared

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    EndpointConfig, HttpsDefaultsConfig, LimitsConfig, ListenerConfig, LogFormat, ObservabilityConfig, ServerConfig,
    SniConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
