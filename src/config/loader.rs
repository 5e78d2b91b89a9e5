use std::path::{Path, PathBuf};

use crate::errors::{ConductorError, Result};

use super::schema::Config;

pub fn default_config_path() -> PathBuf {
    PathBuf::from("./conductor.toml")
}

/// Loads, applies `CONDUCTOR_*` secret overrides, then validates.
/// Validation failure is a `ConfigurationError` — fatal at startup,
/// before any other subsystem starts.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ConductorError::configuration(format!("reading {}: {e}", path.display()))
    })?;
    let mut config: Config = toml::from_str(&raw)
        .map_err(|e| ConductorError::configuration(format!("parsing {}: {e}", path.display())))?;

    if let Ok(key) = std::env::var("CONDUCTOR_PROVIDER_API_KEY") {
        config.provider.api_key = Some(key);
    }

    config.validate()?;
    Ok(config)
}

pub fn save_config(path: impl AsRef<Path>, config: &Config) -> Result<()> {
    let serialized = toml::to_string_pretty(config)
        .map_err(|e| ConductorError::configuration(format!("serializing config: {e}")))?;
    std::fs::write(path, serialized)
        .map_err(|e| ConductorError::configuration(format!("writing config: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_file() {
        let result = load_config("/nonexistent/conductor.toml");
        assert!(result.is_err());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        let config = Config {
            workspace: dir.path().to_path_buf(),
            sandbox_mode: super::super::schema::SandboxMode::None,
            provider: super::super::schema::ProviderConfig {
                base_url: "https://api.example.com".into(),
                api_key: None,
                default_model: "m".into(),
                request_timeout_secs: 30,
            },
            tools: Default::default(),
            mcp_servers: vec![],
            scheduler: Default::default(),
            memory: Default::default(),
            log_level: "info".into(),
            max_tool_iterations: 20,
        };
        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.provider.base_url, "https://api.example.com");
    }
}
