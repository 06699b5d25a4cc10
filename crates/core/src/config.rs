use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            channel_type: default_channel_type(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_true")]
    pub notifications: bool,
    pub call_base_url: Option<String>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            notifications: true,
            call_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_aggregation_window_ms")]
    pub aggregation_window_ms: u64,
    #[serde(default = "default_aggregation_threshold")]
    pub aggregation_threshold: usize,
}

impl NotificationsConfig {
    pub fn aggregation_window(&self) -> Duration {
        Duration::from_millis(self.aggregation_window_ms)
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            aggregation_window_ms: default_aggregation_window_ms(),
            aggregation_threshold: default_aggregation_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    channel_type: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_channel_type() -> String {
    "messaging".to_string()
}

fn default_aggregation_window_ms() -> u64 {
    2000
}

fn default_aggregation_threshold() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[vendor]
channel_type = "messaging"

[ui]
notifications = true
# call_base_url = "https://tandem.example.com"

[notifications]
aggregation_window_ms = 2000
aggregation_threshold = 3

[logging]
level = "info"

[event_bus]
channel_capacity = 1024
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("app", "tandem", "tandem") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. A missing file is created with
/// the defaults, which are then loaded.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            DEFAULT_CONFIG_TOML.to_string()
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        channel_type: std::env::var("TANDEM_CHANNEL_TYPE").ok(),
        log_level: std::env::var("TANDEM_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(channel_type) = overrides.channel_type {
        config.vendor.channel_type = channel_type;
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let channel_type = &config.vendor.channel_type;
    if channel_type.is_empty() || channel_type.contains(':') {
        return Err(ConfigError::InvalidValue {
            field: "vendor.channel_type".to_string(),
            message: "must be non-empty and must not contain ':'".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.event_bus.channel_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            field: "event_bus.channel_capacity".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if config.notifications.aggregation_threshold == 0 {
        return Err(ConfigError::InvalidValue {
            field: "notifications.aggregation_threshold".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    Ok(())
}

fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
