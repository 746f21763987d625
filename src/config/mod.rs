//! Configuration system
//!
//! Loads ~/.config/changeflow/config.yaml with support for:
//! - Per-provider OAuth clients and endpoint overrides
//! - Retry policy and per-provider concurrency limits
//! - Vault key sourcing

mod changeflow_config;
pub mod validation;

pub use changeflow_config::{
    ChangeflowConfig, ProviderSettings, ProvidersConfig, RetrySettings, DEFAULT_KEY_ENV,
    MAX_LIFETIME_SECS,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
