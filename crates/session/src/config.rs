use std::{fs, path::Path};

use serde::Deserialize;

/// Top-level configuration for the Mailsis session layer.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub smtp: SmtpConfig,
}

/// SMTP session configuration.
#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    /// Server identity printed in the `by` clause of trace headers.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Software tag printed in the `with` clause, omitted when unset.
    #[serde(default)]
    pub software: Option<String>,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            software: None,
            auth: AuthConfig::default(),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Default, Deserialize)]
pub struct AuthConfig {
    /// Mechanisms that may be advertised, an empty list allows every
    /// registered mechanism.
    #[serde(default)]
    pub mechanisms: Vec<String>,
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_hostname() -> String {
    "localhost".to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[smtp]
hostname = "mx.example.com"
software = "Mailsis 0.1"

[smtp.auth]
mechanisms = ["PLAIN", "LOGIN"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smtp.hostname, "mx.example.com");
        assert_eq!(config.smtp.software.as_deref(), Some("Mailsis 0.1"));
        assert_eq!(config.smtp.auth.mechanisms, ["PLAIN", "LOGIN"]);
    }

    #[test]
    fn test_parse_defaults() {
        let toml = r#"
[smtp]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smtp.hostname, "localhost");
        assert!(config.smtp.software.is_none());
        assert!(config.smtp.auth.mechanisms.is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[smtp]\nhostname = \"relay.example.org\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.smtp.hostname, "relay.example.org");
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("does/not/exist.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
        assert!(err.to_string().starts_with("Config I/O error: "));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[smtp\nhostname = ").unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
