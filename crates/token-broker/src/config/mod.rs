//! Configuration management
//!
//! Supports configuration loading with precedence: env > file > CLI > defaults

mod builder;
mod env;
mod file;

pub use builder::{
    AuditConfig, Config, ConfigBuilder, DeploymentMode, ServerConfig, StoreConfig,
    TelemetryConfig, TlsConfig,
};

use crate::Result;

/// Layer the first config file found and then the environment over `base`.
///
/// `base` carries CLI arguments and defaults, so both sources override it.
pub fn load_config(base: ConfigBuilder) -> Result<ConfigBuilder> {
    let mut builder = base;

    // Load from config file if exists
    if let Some(path) = file::find_config_file() {
        tracing::info!("Loading configuration from {}", path.display());
        builder = file::load_from_file(&path, builder)?;
    }

    // Override with environment variables
    builder = env::load_from_env(builder)?;

    Ok(builder)
}

/// Like [`load_config`], but with an explicit file path
pub fn load_config_from_path(path: &std::path::Path, base: ConfigBuilder) -> Result<ConfigBuilder> {
    let mut builder = file::load_from_file(path, base)?;

    // Override with environment variables
    builder = env::load_from_env(builder)?;

    Ok(builder)
}
