use anyhow::{Context, Result};
use config::{Config, Environment, File};
use std::collections::HashMap;
use std::path::Path;

use crate::config::types::ServerConfig;

/// Prefix of the environment variables that override file settings,
/// e.g. `PGMCP_DATABASE__CONNECT_TIMEOUT=5s`.
pub const ENV_PREFIX: &str = "PGMCP";

pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<ServerConfig> {
    load_config_from(path, None)
}

/// Same as [`load_config`], with the environment overrides taken from
/// `env_source` instead of the process environment when given.
pub fn load_config_from<P: AsRef<Path>>(
    path: Option<P>,
    env_source: Option<HashMap<String, String>>,
) -> Result<ServerConfig> {
    let mut builder = Config::builder();

    // Start with default settings
    builder = builder.add_source(File::from_str(
        include_str!("../config/default.yaml"),
        config::FileFormat::Yaml,
    ));

    // Add config file if specified
    if let Some(config_path) = path {
        builder = builder.add_source(
            File::from(config_path.as_ref())
                .required(true)
                .format(config::FileFormat::Yaml),
        );
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env_source),
    );

    // Build and deserialize the config
    let config = builder
        .build()
        .context("Failed to build configuration")?
        .try_deserialize::<ServerConfig>()
        .context("Failed to deserialize configuration")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{LogFormat, SslMode};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_embedded() {
        let config = load_config_from::<&Path>(None, Some(HashMap::new())).unwrap();

        assert_eq!(config.server.name, "azure-postgres-mcp");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.ssl_mode, SslMode::Require);
        assert_eq!(config.database.connect_timeout, Duration::from_secs(15));
        assert!(config.database.read_only);
        assert_eq!(config.azure.resource_scheme, "flexpg");
        assert!(!config.security.rate_limiting.enabled);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("override.yaml");
        fs::write(
            &path,
            r#"
server:
  name: "test-gateway"
  version: "9.9.9"
database:
  ssl_mode: "disable"
  connect_timeout: "3s"
  read_only: false
logging:
  format: "json"
"#,
        )
        .unwrap();

        let config = load_config_from(Some(&path), Some(HashMap::new())).unwrap();

        assert_eq!(config.server.name, "test-gateway");
        assert_eq!(config.database.ssl_mode, SslMode::Disable);
        assert_eq!(config.database.connect_timeout, Duration::from_secs(3));
        assert!(!config.database.read_only);
        assert_eq!(config.database.maintenance_database, "postgres");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn environment_overrides_file() {
        let mut env = HashMap::new();
        env.insert("PGMCP_DATABASE__PORT".to_string(), "6432".to_string());
        env.insert("PGMCP_DATABASE__CONNECT_TIMEOUT".to_string(), "2s".to_string());

        let config = load_config_from::<&Path>(None, Some(env)).unwrap();

        assert_eq!(config.database.port, 6432);
        assert_eq!(config.database.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        assert!(load_config_from(Some(&path), Some(HashMap::new())).is_err());
    }
}
