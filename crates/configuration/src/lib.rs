use crate::error::ConfigError;
use std::path::Path;

// Declare the modules that make up this crate.
pub mod error;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use settings::{Config, DatabaseSettings, LedgerSettings, LoggingSettings};

/// Environment variables with this prefix override file values,
/// e.g. `BROKER__LEDGER__MAX_COMMIT_RETRIES=5`.
pub const ENV_PREFIX: &str = "BROKER";

/// Loads configuration from the given file (if it exists) layered under the
/// `BROKER__*` environment, then validates it.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::from(path.as_ref()).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config = builder.try_deserialize::<Config>()?;
    config.validate()?;

    Ok(config)
}
