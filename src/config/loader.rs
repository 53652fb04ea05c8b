//! Configuration loading

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a YAML file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)?;

    info!(
        "Configuration loaded: dns port {}, ipv6 {}, rpc tcp={} unix={}",
        config.dns_server.port,
        config.network.enable_ipv6,
        config.rpc.tcp.enabled,
        config.rpc.unix.enabled,
    );

    Ok(config)
}

/// Load configuration from a YAML string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
dns-server:
  port: 5353
  running: true
network:
  lan-interface: br1
  enable-ipv6: true
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.dns_server.port, 5353);
        assert!(config.dns_server.running);
        assert_eq!(config.network.lan_interface, "br1");
        assert!(config.network.enable_ipv6);
        // Untouched sections keep their defaults
        assert_eq!(config.resolver.cache_ttl, 300);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/vpner.yaml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let result = load_config_str("dns-server: [not, a, map]");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = load_config_str("dns-servr:\n  port: 53\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_custom_resolve_map() {
        let config = load_config_str(
            r#"
dns-server:
  custom-resolve:
    "192.168.1.1":
      - "*.lan"
      - "router.local"
"#,
        )
        .unwrap();
        let patterns = &config.dns_server.custom_resolve["192.168.1.1"];
        assert_eq!(patterns.len(), 2);
    }
}
