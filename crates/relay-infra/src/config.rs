//! Relay configuration loader.
//!
//! Reads `relay.toml` and deserializes it into [`RelayConfig`]. Unlike
//! optional global settings, a missing or malformed relay config is fatal:
//! without providers there is nothing to dispatch to.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use relay_core::llm::dispatch::validate_settings;
use relay_core::llm::registry::ProviderRegistry;
use relay_types::config::RelayConfig;
use relay_types::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "relay.toml";

/// Environment variable that overrides the config location.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";

/// Locate the config file.
///
/// Priority:
/// 1. An explicit path (e.g., from a command-line flag)
/// 2. `$RELAY_CONFIG`
/// 3. `{config_dir}/relay/relay.toml` (`~/.config/relay/relay.toml` on Linux)
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_from(explicit, std::env::var_os(CONFIG_PATH_ENV), dirs::config_dir())
}

fn resolve_from(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
    config_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env_value.filter(|v| !v.is_empty()).map(PathBuf::from))
        .or_else(|| config_dir.map(|dir| dir.join("relay").join(CONFIG_FILE_NAME)))
}

/// Parse and validate a config document.
///
/// Validation builds a throwaway registry so malformed provider entries fail
/// here rather than when the dispatcher is constructed.
pub fn parse_relay_config(content: &str) -> Result<RelayConfig, ConfigError> {
    let config: RelayConfig =
        toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
    validate_settings(&config)?;
    ProviderRegistry::from_config(&config.providers)?;
    Ok(config)
}

/// Load and validate the config at `path`.
pub async fn load_relay_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;

    let config = parse_relay_config(&content).inspect_err(|err| {
        tracing::error!(path = %path.display(), error = %err, "Invalid relay config");
    })?;

    tracing::info!(
        path = %path.display(),
        providers = config.providers.len(),
        "Relay config loaded"
    );
    Ok(config)
}
