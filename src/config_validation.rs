//! Startup validation of the route configuration.
//!
//! Errors stop the process before the listener is bound; warnings are only
//! logged.

use crate::config::Config;
use crate::error::GatewayError;
use std::path::Path;
use url::Url;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn into_result(self) -> Result<Vec<String>, GatewayError> {
        if self.is_valid {
            Ok(self.warnings)
        } else {
            Err(GatewayError::Config(self.errors.join("; ")))
        }
    }
}

pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::success();

    validate_prefix(&config.proxy_prefix, &mut result);
    let origin = validate_upstream_origin(&config.upstream_origin, &mut result);
    validate_static_root(config, &mut result);
    validate_limits(config, &mut result);

    if let Some(origin) = origin {
        validate_no_self_proxy(config, &origin, &mut result);
    }

    result
}

fn validate_prefix(prefix: &str, result: &mut ValidationResult) {
    if prefix.is_empty() {
        result.add_error("Proxy prefix cannot be empty".to_string());
        return;
    }
    if !prefix.starts_with('/') {
        result.add_error(format!("Proxy prefix '{}' must start with '/'", prefix));
    }
    if prefix.contains('?') || prefix.contains('#') {
        result.add_error(format!("Proxy prefix '{}' must be a plain path", prefix));
    }
    if prefix == "/" {
        result.add_warning("Proxy prefix '/' forwards every request; static files will never be served".to_string());
    } else if prefix.ends_with('/') {
        result.add_warning(format!(
            "Proxy prefix '{}' ends with '/', so '{}' itself is not forwarded",
            prefix,
            prefix.trim_end_matches('/')
        ));
    }
}

fn validate_upstream_origin(origin: &str, result: &mut ValidationResult) -> Option<Url> {
    let url = match Url::parse(origin) {
        Ok(url) => url,
        Err(e) => {
            result.add_error(format!("Invalid upstream origin '{}': {}", origin, e));
            return None;
        }
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        result.add_error(format!("Upstream origin '{}' must use http or https", origin));
    }
    if url.host_str().is_none() {
        result.add_error(format!("Upstream origin '{}' has no host", origin));
    }
    if url.query().is_some() || url.fragment().is_some() {
        result.add_warning(format!("Query and fragment of upstream origin '{}' are ignored", origin));
    }

    Some(url)
}

fn validate_static_root(config: &Config, result: &mut ValidationResult) {
    let root = Path::new(&config.static_root);
    if !root.exists() {
        result.add_error(format!("Static root does not exist: {}", config.static_root));
        return;
    }
    if !root.is_dir() {
        result.add_error(format!("Static root is not a directory: {}", config.static_root));
        return;
    }

    let shadowed = shadowed_static_entries(root, &config.proxy_prefix);
    if !shadowed.is_empty() {
        result.add_error(format!(
            "Proxy prefix '{}' overlaps static entries in {}: {}",
            config.proxy_prefix,
            config.static_root,
            shadowed.join(", ")
        ));
    }

    if config.index_files.is_empty() {
        result.add_warning("No index files configured; directory requests will return 404".to_string());
    }
}

/// Static entries whose request path starts with `prefix`. The prefix match
/// is byte-wise, so `/api` also claims `/api-docs.html` and `/apiary/`.
fn shadowed_static_entries(root: &Path, prefix: &str) -> Vec<String> {
    // "/" claims everything and is reported as a warning instead.
    if prefix == "/" || !prefix.starts_with('/') {
        return Vec::new();
    }

    let (parent, stem) = prefix.rsplit_once('/').unwrap_or(("", prefix));
    let dir = parent
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(root.to_path_buf(), |acc, segment| acc.join(segment));

    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut shadowed: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.') && name.starts_with(stem))
        .map(|name| format!("{}/{}", parent, name))
        .collect();
    shadowed.sort();
    shadowed
}

fn validate_limits(config: &Config, result: &mut ValidationResult) {
    if config.connect_timeout_secs == Some(0) {
        result.add_error("Connect timeout must be greater than 0".to_string());
    }
    if config.request_timeout_secs == Some(0) {
        result.add_error("Request timeout must be greater than 0".to_string());
    }
    if config.header_read_timeout_secs == Some(0) {
        result.add_error("Header read timeout must be greater than 0".to_string());
    }
    if config.max_connections == Some(0) {
        result.add_error("Max connections must be greater than 0".to_string());
    }
    if let Some(size) = config.max_header_size {
        if size < 8192 {
            result.add_warning(format!("Max header size {} is below the 8192 byte minimum and will be raised", size));
        }
    }

    let port = config.listen_addr.port();
    if port != 0 && port < 1024 {
        result.add_warning(format!("Using privileged port {} - may require elevated privileges", port));
    }
}

fn validate_no_self_proxy(config: &Config, origin: &Url, result: &mut ValidationResult) {
    let Some(host) = origin.host_str() else {
        return;
    };
    let is_local = matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "0.0.0.0")
        || config.listen_addr.ip().to_string() == host;

    if is_local && origin.port_or_known_default() == Some(config.listen_addr.port()) {
        result.add_error(format!(
            "Upstream origin '{}' points back at the listen address {}",
            config.upstream_origin, config.listen_addr
        ));
    }
}
