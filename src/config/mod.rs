use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::heartbeat;

pub const DEFAULT_CONFIG_FILE: &str = "majorq.toml";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 5555,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub liveness_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: heartbeat::DEFAULT_INTERVAL_MS,
            liveness_multiplier: heartbeat::DEFAULT_LIVENESS_MULTIPLIER,
        }
    }
}

impl AppConfig {
    // First positional argument (anything not starting with '--') is the
    // config path. Without one, the default file is used when present, and
    // built-in defaults otherwise. Remaining args are '--section.key value'
    // overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut args = args.into_iter().peekable();
        let explicit_path = match args.peek() {
            Some(first) if !first.starts_with("--") => args.next(),
            _ => None,
        };

        match explicit_path {
            Some(path) => Self::load_from_toml_with_args(path, args),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load_from_toml_with_args(DEFAULT_CONFIG_FILE, args)
            }
            None => Self::from_defaults_with_args(args),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let root_value: Value = toml_content
            .parse()
            .map_err(|source| ConfigError::TomlParse {
                path: path.as_ref().to_string_lossy().to_string(),
                source,
            })?;

        Self::apply_args_and_deserialize(root_value, args)
    }

    pub fn from_defaults_with_args(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let root_value = Value::try_from(AppConfig::default()).map_err(ConfigError::Serialize)?;
        Self::apply_args_and_deserialize(root_value, args)
    }

    fn apply_args_and_deserialize(
        mut root_value: Value,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Serialize(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Serialize(source) => {
                write!(f, "failed to build default config tree: {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.is_empty() || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
        current = table
            .get_mut(*section)
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
    }

    let final_key = parts[parts.len() - 1];
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    let current_value = table
        .get_mut(final_key)
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    let parsed_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    *current_value = parsed_value;

    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => {
            let parsed = raw_value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "integer",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Integer(parsed))
        }
        Value::Float(_) => {
            let parsed = raw_value
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "float",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Float(parsed))
        }
        Value::Boolean(_) => {
            let parsed = raw_value
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "boolean",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Boolean(parsed))
        }
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "majorq-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    const SAMPLE_CONFIG: &str = r#"
[logging]
level = "debug"
human_friendly = false

[server]
host = "127.0.0.1"
port = 6000

[heartbeat]
interval_ms = 2500
liveness_multiplier = 3
"#;

    #[test]
    fn loads_config_from_toml_without_overrides() {
        let path = write_temp_config(SAMPLE_CONFIG, "default");

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.human_friendly);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.heartbeat.interval_ms, 2500);
        assert_eq!(config.heartbeat.liveness_multiplier, 3);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(SAMPLE_CONFIG, "override");

        let config = AppConfig::load_from_toml_with_args(
            &path,
            vec![
                "--logging.level".to_owned(),
                "verbose".to_owned(),
                "--server.port".to_owned(),
                "7001".to_owned(),
                "--heartbeat.interval_ms".to_owned(),
                "500".to_owned(),
            ],
        )
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "verbose");
        assert_eq!(config.server.port, 7001);
        assert_eq!(config.heartbeat.interval_ms, 500);
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let config = AppConfig::from_defaults_with_args(Vec::<String>::new())
            .expect("defaults should load");

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.heartbeat.liveness_multiplier, 3);
    }

    #[test]
    fn defaults_accept_cli_overrides() {
        let config = AppConfig::from_defaults_with_args(vec![
            "--server.host".to_owned(),
            "127.0.0.1".to_owned(),
            "--logging.human_friendly".to_owned(),
            "true".to_owned(),
        ])
        .expect("defaults with overrides should load");

        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.logging.human_friendly);
    }

    #[test]
    fn discovery_treats_first_positional_arg_as_config_path() {
        let path = write_temp_config(SAMPLE_CONFIG, "discovery");

        let config = AppConfig::load_with_discovery(vec![
            path.to_string_lossy().to_string(),
            "--server.port".to_owned(),
            "6100".to_owned(),
        ])
        .expect("discovery with explicit path should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.port, 6100);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::from_defaults_with_args(vec![
            "--logging.nonexistent".to_owned(),
            "x".to_owned(),
        ])
        .expect_err("unknown override key should fail");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_value_of_wrong_type() {
        let err = AppConfig::from_defaults_with_args(vec![
            "--server.port".to_owned(),
            "not-a-number".to_owned(),
        ])
        .expect_err("non-integer port should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }

    #[test]
    fn rejects_malformed_override_flags() {
        let missing_value =
            AppConfig::from_defaults_with_args(vec!["--server.port".to_owned()])
                .expect_err("missing override value should fail");
        assert!(matches!(
            missing_value,
            ConfigError::MissingValueForArg { .. }
        ));

        let bad_format = AppConfig::from_defaults_with_args(vec![
            "--".to_owned(),
            "value".to_owned(),
        ])
        .expect_err("empty override key should fail");
        assert!(matches!(bad_format, ConfigError::InvalidArgFormat { .. }));
    }
}
