use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5173))
}

fn default_static_root() -> String {
    "web/public".to_string()
}

fn default_proxy_prefix() -> String {
    "/api".to_string()
}

fn default_upstream_origin() -> String {
    "http://localhost:8000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_index_files() -> Vec<String> {
    vec!["index.html".to_string()]
}

fn default_max_header_size() -> Option<usize> {
    Some(16 * 1024) // 16KB default header size limit
}

/// Route configuration, fixed for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_static_root")]
    pub static_root: String,
    /// Literal prefix; a request is forwarded when its path starts with it.
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,
    /// `scheme://host[:port]`, optionally followed by a base path.
    #[serde(default = "default_upstream_origin")]
    pub upstream_origin: String,
    #[serde(default = "default_true")]
    pub rewrite_host_header: bool,
    #[serde(default)]
    pub forwarded_headers: bool,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub header_read_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: Option<usize>,
    #[serde(default)]
    pub connection_pool_enabled: Option<bool>,
    /// 0 disables idle pooling; each forwarded request opens a fresh connection.
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    #[serde(default)]
    pub pool_idle_timeout_secs: Option<u64>,
    #[serde(default = "default_index_files")]
    pub index_files: Vec<String>,
    #[serde(default)]
    pub custom_mime_types: HashMap<String, String>,
    #[serde(default)]
    pub cache_max_age_secs: u64,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            static_root: default_static_root(),
            proxy_prefix: default_proxy_prefix(),
            upstream_origin: default_upstream_origin(),
            rewrite_host_header: true,
            forwarded_headers: false,
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
            header_read_timeout_secs: Some(30),
            max_connections: Some(1000),
            max_header_size: default_max_header_size(),
            connection_pool_enabled: Some(true),
            pool_max_idle_per_host: Some(10),
            pool_idle_timeout_secs: Some(90),
            index_files: default_index_files(),
            custom_mime_types: HashMap::new(),
            cache_max_age_secs: 0,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs.unwrap_or(10)
    }

    pub fn request_timeout_secs(&self) -> u64 {
        self.request_timeout_secs.unwrap_or(30)
    }

    pub fn header_read_timeout_secs(&self) -> u64 {
        self.header_read_timeout_secs.unwrap_or(30)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(1000)
    }

    /// Idle connections kept per upstream host, 0 when pooling is disabled.
    pub fn effective_pool_max_idle(&self) -> usize {
        if self.connection_pool_enabled.unwrap_or(true) {
            self.pool_max_idle_per_host.unwrap_or(10)
        } else {
            0
        }
    }

    pub fn pool_idle_timeout_secs(&self) -> u64 {
        self.pool_idle_timeout_secs.unwrap_or(90)
    }

    pub fn add_custom_mime_type(&mut self, extension: String, mime_type: String) {
        // Remove leading dot if present
        let clean_ext = extension.strip_prefix('.').unwrap_or(&extension).to_lowercase();
        self.custom_mime_types.insert(clean_ext, mime_type);
    }
}
