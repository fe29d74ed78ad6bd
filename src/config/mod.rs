//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) or ClientConfig::default() with field overrides
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ClientConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the client is built
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackpressureConfig, ClientConfig, EndpointConfig, FailoverConfig, HealthCheckConfig,
    LoadBalanceStrategy, LogFormat, LoggingConfig, OtelConfig, PoolConfig, ProtocolMode,
    ReconnectConfig,
};
pub use validation::{validate_config, ValidationError};
