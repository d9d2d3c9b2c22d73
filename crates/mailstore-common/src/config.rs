//! Configuration for mailstore

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// IMAP configuration
    #[serde(default = "ServiceConfig::imap")]
    pub imap: ServiceConfig,

    /// POP3 configuration
    #[serde(default = "ServiceConfig::pop3")]
    pub pop3: ServiceConfig,

    /// LMTP configuration
    #[serde(default = "ServiceConfig::lmtp")]
    pub lmtp: ServiceConfig,

    /// ManageSieve configuration
    #[serde(default = "ServiceConfig::managesieve")]
    pub managesieve: ServiceConfig,

    /// Authentication backend
    #[serde(default)]
    pub auth: AuthConfig,

    /// Mail sorting backend
    #[serde(default)]
    pub sort: SortConfig,

    /// Local delivery
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Greeting banner; a generic one is used when empty
    #[serde(default)]
    pub banner: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            banner: String::new(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Storage backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            migrate: true,
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Listener configuration shared by IMAP, POP3, LMTP and ManageSieve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Enable this listener
    #[serde(default)]
    pub enabled: bool,

    /// Bind address; the service default is used when empty
    #[serde(default)]
    pub bind: String,

    /// Idle timeout before authentication, in seconds
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,

    /// Idle timeout once authenticated, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum concurrent connections
    #[serde(default = "default_service_max_connections")]
    pub max_connections: usize,

    /// Largest literal or message body accepted, in bytes
    #[serde(default = "default_max_literal_size")]
    pub max_literal_size: usize,

    /// Socket filter clients must match, e.g. "inet:10.0.0.0/8:143"
    #[serde(default)]
    pub allow: String,

    /// Socket filter that refuses matching clients
    #[serde(default)]
    pub deny: String,
}

impl ServiceConfig {
    fn with_bind(bind: &str) -> Self {
        Self {
            enabled: false,
            bind: bind.to_string(),
            login_timeout_secs: default_login_timeout(),
            timeout_secs: default_timeout(),
            max_connections: default_service_max_connections(),
            max_literal_size: default_max_literal_size(),
            allow: String::new(),
            deny: String::new(),
        }
    }

    pub fn imap() -> Self {
        Self::with_bind("0.0.0.0:143")
    }

    pub fn pop3() -> Self {
        Self::with_bind("0.0.0.0:110")
    }

    pub fn lmtp() -> Self {
        Self::with_bind("127.0.0.1:24")
    }

    pub fn managesieve() -> Self {
        Self::with_bind("0.0.0.0:4190")
    }
}

fn default_login_timeout() -> u64 {
    60
}

fn default_timeout() -> u64 {
    300
}

fn default_service_max_connections() -> usize {
    500
}

fn default_max_literal_size() -> usize {
    50 * 1024 * 1024
}

/// Authentication backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Driver name: "database"
    #[serde(default = "default_auth_driver")]
    pub driver: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            driver: default_auth_driver(),
        }
    }
}

fn default_auth_driver() -> String {
    "database".to_string()
}

/// Sorting backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortConfig {
    /// Driver name: "none" or "sieve"
    #[serde(default = "default_sort_driver")]
    pub driver: String,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            driver: default_sort_driver(),
        }
    }
}

fn default_sort_driver() -> String {
    "none".to_string()
}

/// Local delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Mailbox used when no script picks one
    #[serde(default = "default_mailbox")]
    pub default_mailbox: String,

    /// Create a `+detail` mailbox on delivery when it does not exist
    #[serde(default)]
    pub create_detail_mailbox: bool,

    /// Outbound relay for alias forwards and script redirects
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_mailbox: default_mailbox(),
            create_detail_mailbox: false,
            relay: RelayConfig::default(),
        }
    }
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

/// SMTP relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay host. Mail for non-local addresses is refused when unset.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Upgrade the connection with STARTTLS
    #[serde(default)]
    pub starttls: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Connect and command timeout, in seconds
    #[serde(default = "default_relay_timeout")]
    pub timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_relay_port(),
            starttls: false,
            username: None,
            password: None,
            timeout_secs: default_relay_timeout(),
        }
    }
}

fn default_relay_port() -> u16 {
    25
}

fn default_relay_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            imap: ServiceConfig::imap(),
            pop3: ServiceConfig::pop3(),
            lmtp: ServiceConfig::lmtp(),
            managesieve: ServiceConfig::managesieve(),
            auth: AuthConfig::default(),
            sort: SortConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

/// Prefix for environment overrides, e.g. `MAILSTORE__DATABASE__URL`.
const ENV_PREFIX: &str = "MAILSTORE";

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config.with_default_binds())
    }

    /// Fill listener addresses left empty in the file
    fn with_default_binds(mut self) -> Self {
        for (service, fallback) in [
            (&mut self.imap, ServiceConfig::imap()),
            (&mut self.pop3, ServiceConfig::pop3()),
            (&mut self.lmtp, ServiceConfig::lmtp()),
            (&mut self.managesieve, ServiceConfig::managesieve()),
        ] {
            if service.bind.is_empty() {
                service.bind = fallback.bind;
            }
        }
        self
    }

    /// Load a file and layer `MAILSTORE__*` environment variables on top
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config.with_default_binds())
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./mailstore.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/mailstore/mailstore.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}
