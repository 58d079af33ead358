//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address (default `0.0.0.0:9000`)
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on `/v1/*`; blank disables authorization
    #[serde(default)]
    pub token: Option<String>,
    /// Seconds in-flight requests get after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Output tree and public mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root holding `live/` and `uploads/` job directories
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Publicly served mirror root (default `<output_root>/public`)
    #[serde(default)]
    pub public_dir: Option<PathBuf>,
    /// Base URL the mirror is served under; unset disables URL rewriting
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./work")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            public_dir: None,
            public_base_url: None,
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable (default `ffmpeg`)
    #[serde(default = "default_program")]
    pub program: String,
    /// Seconds a stop request waits for the encoder to exit
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_stop_timeout_secs() -> u64 {
    15
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Blank values are ignored, as are numbers that fail to parse:
    /// - JOB_CONTROLLER_BIND -> server.bind
    /// - JOB_CONTROLLER_TOKEN -> server.token
    /// - JOB_CONTROLLER_SHUTDOWN_GRACE_SECS -> server.shutdown_grace_secs
    /// - JOB_CONTROLLER_OUTPUT_ROOT -> storage.output_root
    /// - BITRIVER_TRANSCODER_PUBLIC_DIR -> storage.public_dir
    /// - BITRIVER_TRANSCODER_PUBLIC_BASE_URL -> storage.public_base_url
    /// - JOB_CONTROLLER_FFMPEG -> encoder.program
    /// - JOB_CONTROLLER_STOP_TIMEOUT_SECS -> encoder.stop_timeout_secs
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = env_value("JOB_CONTROLLER_BIND") {
            self.server.bind = val;
        }

        if let Some(val) = env_value("JOB_CONTROLLER_TOKEN") {
            self.server.token = Some(val);
        }

        if let Some(secs) = env_value("JOB_CONTROLLER_SHUTDOWN_GRACE_SECS")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.server.shutdown_grace_secs = secs;
        }

        if let Some(val) = env_value("JOB_CONTROLLER_OUTPUT_ROOT") {
            self.storage.output_root = PathBuf::from(val);
        }

        if let Some(val) = env_value("BITRIVER_TRANSCODER_PUBLIC_DIR") {
            self.storage.public_dir = Some(PathBuf::from(val));
        }

        if let Some(val) = env_value("BITRIVER_TRANSCODER_PUBLIC_BASE_URL") {
            self.storage.public_base_url = Some(val);
        }

        if let Some(val) = env_value("JOB_CONTROLLER_FFMPEG") {
            self.encoder.program = val;
        }

        if let Some(secs) = env_value("JOB_CONTROLLER_STOP_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.encoder.stop_timeout_secs = secs;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// The configured bearer token, `None` when unset or blank.
    pub fn token(&self) -> Option<&str> {
        self.server
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// The public base URL without a trailing slash, `None` when unset or blank.
    pub fn public_base(&self) -> Option<String> {
        self.storage
            .public_base_url
            .as_deref()
            .map(|b| b.trim().trim_end_matches('/'))
            .filter(|b| !b.is_empty())
            .map(str::to_string)
    }

    /// The public mirror root, defaulting to `<output_root>/public`.
    pub fn public_dir(&self) -> PathBuf {
        self.storage
            .public_dir
            .clone()
            .unwrap_or_else(|| self.storage.output_root.join("public"))
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "JOB_CONTROLLER_BIND",
        "JOB_CONTROLLER_TOKEN",
        "JOB_CONTROLLER_SHUTDOWN_GRACE_SECS",
        "JOB_CONTROLLER_OUTPUT_ROOT",
        "BITRIVER_TRANSCODER_PUBLIC_DIR",
        "BITRIVER_TRANSCODER_PUBLIC_BASE_URL",
        "JOB_CONTROLLER_FFMPEG",
        "JOB_CONTROLLER_STOP_TIMEOUT_SECS",
    ];

    fn clear_env_vars() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            port in 1u16..u16::MAX,
            grace in 0u64..600,
            root in "[a-z][a-z0-9_/]{0,20}",
            stop_timeout in 1u64..120,
            token in proptest::option::of("[A-Za-z0-9]{1,32}"),
        ) {
            let toml_str = format!(
                r#"
[server]
bind = "127.0.0.1:{}"
{}
shutdown_grace_secs = {}

[storage]
output_root = "{}"

[encoder]
program = "/usr/bin/ffmpeg"
stop_timeout_secs = {}
"#,
                port,
                token.as_ref().map(|t| format!("token = \"{}\"", t)).unwrap_or_default(),
                grace,
                root,
                stop_timeout,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.server.bind, format!("127.0.0.1:{}", port));
            prop_assert_eq!(config.server.token, token);
            prop_assert_eq!(config.server.shutdown_grace_secs, grace);
            prop_assert_eq!(config.storage.output_root, PathBuf::from(root));
            prop_assert_eq!(config.encoder.program, "/usr/bin/ffmpeg");
            prop_assert_eq!(config.encoder.stop_timeout_secs, stop_timeout);
        }

        #[test]
        fn prop_env_overrides_stop_timeout(
            initial in 1u64..60,
            override_secs in 1u64..600,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encoder]\nstop_timeout_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("JOB_CONTROLLER_STOP_TIMEOUT_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.stop_timeout_secs, override_secs);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.token, None);
        assert_eq!(config.server.shutdown_grace_secs, 10);
        assert_eq!(config.storage.output_root, PathBuf::from("./work"));
        assert_eq!(config.storage.public_base_url, None);
        assert_eq!(config.encoder.program, "ffmpeg");
        assert_eq!(config.encoder.stop_timeout_secs, 15);
    }

    #[test]
    fn test_env_overrides_strings_and_ignores_blank() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("JOB_CONTROLLER_BIND", "127.0.0.1:9100");
        env::set_var("JOB_CONTROLLER_TOKEN", "  secret  ");
        env::set_var("JOB_CONTROLLER_OUTPUT_ROOT", "/srv/hls");
        env::set_var("BITRIVER_TRANSCODER_PUBLIC_BASE_URL", "https://cdn.example.com/");
        env::set_var("JOB_CONTROLLER_FFMPEG", "   ");
        env::set_var("JOB_CONTROLLER_SHUTDOWN_GRACE_SECS", "soon");

        let config = Config::from_env();
        clear_env_vars();

        assert_eq!(config.server.bind, "127.0.0.1:9100");
        assert_eq!(config.token(), Some("secret"));
        assert_eq!(config.storage.output_root, PathBuf::from("/srv/hls"));
        assert_eq!(config.public_base().as_deref(), Some("https://cdn.example.com"));
        assert_eq!(config.encoder.program, "ffmpeg");
        assert_eq!(config.server.shutdown_grace_secs, 10);
    }

    #[test]
    fn test_blank_token_disables_auth() {
        let config = Config::parse_toml("[server]\ntoken = \"   \"\n").unwrap();
        assert_eq!(config.token(), None);
    }

    #[test]
    fn test_public_dir_defaults_under_output_root() {
        let config = Config::parse_toml("[storage]\noutput_root = \"/data\"\n").unwrap();
        assert_eq!(config.public_dir(), PathBuf::from("/data/public"));

        let config = Config::parse_toml(
            "[storage]\noutput_root = \"/data\"\npublic_dir = \"/var/www/hls\"\n",
        )
        .unwrap();
        assert_eq!(config.public_dir(), PathBuf::from("/var/www/hls"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = Config::parse_toml("[server\nbind = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
