//! meshcall configuration.
//!
//! TOML-based configuration with full validation. All sections use
//! sensible defaults so partial configs work out of the box.

pub mod schema;
mod toml_loader;
pub mod validation;

pub use schema::{LogLevel, LoggingConfig, MeshcallConfig, RealtimeSection, RoomSection};

use meshcall_common::ConfigError;
use std::path::Path;

/// Load and validate config from the platform default path, writing the
/// default template there first if the file does not exist.
pub fn load_config() -> Result<MeshcallConfig, ConfigError> {
    let config = toml_loader::read_or_create(&toml_loader::default_path()?)?;
    validation::validate(&config)?;
    Ok(config)
}

/// Load and validate config from an explicit path.
pub fn load_config_from(path: &Path) -> Result<MeshcallConfig, ConfigError> {
    let config = toml_loader::read(path)?;
    validation::validate(&config)?;
    Ok(config)
}
