use crate::common::{GatewayBody, StreamingFileBody, empty_body};
use crate::config::Config;
use crate::error::GatewayError;
use hyper::header::{
    CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED,
    LOCATION,
};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, warn};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Clone)]
pub struct StaticFileHandler {
    root_path: PathBuf,
    index_files: Vec<String>,
    custom_mime_types: HashMap<String, String>,
    cache_max_age_secs: u64,
}

/// Splits a request path into safe relative segments.
///
/// The path is percent-decoded first so `%2e%2e` is treated like `..`. A `..`
/// that would climb above the root is rejected rather than clamped.
pub fn normalize_request_path(path: &str) -> Result<Vec<String>, GatewayError> {
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| GatewayError::NotFound(format!("undecodable path {}", path)))?;

    let mut segments: Vec<String> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(GatewayError::PathTraversal(path.to_string()));
                }
            }
            s if s.contains('\\') || s.contains('\0') => {
                return Err(GatewayError::PathTraversal(path.to_string()));
            }
            // dotfiles are never served
            s if s.starts_with('.') => {
                return Err(GatewayError::NotFound(path.to_string()));
            }
            s => segments.push(s.to_string()),
        }
    }

    Ok(segments)
}

impl StaticFileHandler {
    pub fn new(
        root_dir: &str,
        index_files: Vec<String>,
        custom_mime_types: HashMap<String, String>,
        cache_max_age_secs: u64,
    ) -> Result<Self, GatewayError> {
        let root_path = Path::new(root_dir).canonicalize()
            .map_err(|e| GatewayError::Config(format!("Invalid static root '{}': {}", root_dir, e)))?;

        if !root_path.is_dir() {
            return Err(GatewayError::Config(format!("Static root '{}' is not a directory", root_dir)));
        }

        Ok(Self {
            root_path,
            index_files,
            custom_mime_types,
            cache_max_age_secs,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        Self::new(
            &config.static_root,
            config.index_files.clone(),
            config.custom_mime_types.clone(),
            config.cache_max_age_secs,
        )
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Serves the file a request path points at.
    ///
    /// `Ok(None)` means "no match": wrong method, missing file, dotfile or a
    /// path that tries to leave the root. The caller turns that into a 404.
    pub async fn handle_request<B>(&self, req: &Request<B>) -> Result<Option<Response<GatewayBody>>, GatewayError> {
        let is_head = req.method() == Method::HEAD;
        if req.method() != Method::GET && !is_head {
            return Ok(None);
        }

        let path = req.uri().path();
        let segments = match normalize_request_path(path) {
            Ok(segments) => segments,
            Err(GatewayError::PathTraversal(p)) => {
                warn!("Path traversal attempt blocked: {}", p);
                return Ok(None);
            }
            Err(e) => {
                debug!("No static match for {}: {}", path, e);
                return Ok(None);
            }
        };

        let candidate = segments
            .iter()
            .fold(self.root_path.clone(), |acc, segment| acc.join(segment));

        let metadata = match tokio::fs::metadata(&candidate).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("No static match for {}: {}", path, e);
                return Ok(None);
            }
        };

        if metadata.is_dir() {
            if !path.ends_with('/') {
                return self.redirect_to_directory(req).map(Some);
            }
            return self.handle_directory(&candidate, req, is_head).await;
        }

        self.handle_file(&candidate, metadata, req, is_head).await
    }

    async fn handle_directory<B>(&self, dir_path: &Path, req: &Request<B>, is_head: bool) -> Result<Option<Response<GatewayBody>>, GatewayError> {
        for index_file in &self.index_files {
            let index_path = dir_path.join(index_file);
            if let Ok(metadata) = tokio::fs::metadata(&index_path).await {
                if metadata.is_file() {
                    return self.handle_file(&index_path, metadata, req, is_head).await;
                }
            }
        }

        Ok(None)
    }

    fn redirect_to_directory<B>(&self, req: &Request<B>) -> Result<Response<GatewayBody>, GatewayError> {
        let location = match req.uri().query() {
            Some(query) => format!("{}/?{}", req.uri().path(), query),
            None => format!("{}/", req.uri().path()),
        };

        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(LOCATION, location)
            .header(CONTENT_LENGTH, 0)
            .body(empty_body())
            .map_err(|e| GatewayError::Http(e.to_string()))
    }

    async fn handle_file<B>(
        &self,
        file_path: &Path,
        metadata: Metadata,
        req: &Request<B>,
        is_head: bool,
    ) -> Result<Option<Response<GatewayBody>>, GatewayError> {
        if !metadata.is_file() {
            return Ok(None);
        }

        // Symlinks may point outside the root even when the lexical path does not.
        let canonical = match tokio::fs::canonicalize(file_path).await {
            Ok(canonical) => canonical,
            Err(_) => return Ok(None),
        };
        if !canonical.starts_with(&self.root_path) {
            warn!("Path traversal attempt blocked: {} -> {}", req.uri().path(), canonical.display());
            return Ok(None);
        }

        let mime_type = Self::guess_mime_type(file_path, &self.custom_mime_types);
        let cache_control = format!("public, max-age={}", self.cache_max_age_secs);
        let last_modified = metadata.modified().ok().map(httpdate::HttpDate::from);

        if let (Some(modified), Some(since)) = (last_modified, Self::if_modified_since(req)) {
            if SystemTime::from(modified) <= since {
                return Response::builder()
                    .status(StatusCode::NOT_MODIFIED)
                    .header(LAST_MODIFIED, modified.to_string())
                    .header(CACHE_CONTROL, cache_control)
                    .body(empty_body())
                    .map(Some)
                    .map_err(|e| GatewayError::Http(e.to_string()));
            }
        }

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, mime_type)
            .header(CONTENT_LENGTH, metadata.len())
            .header(CACHE_CONTROL, cache_control);
        if let Some(modified) = last_modified {
            response = response.header(LAST_MODIFIED, modified.to_string());
        }

        let body = if is_head {
            empty_body()
        } else {
            let file = match tokio::fs::File::open(&canonical).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(GatewayError::Io(e)),
            };
            http_body_util::BodyExt::boxed_unsync(StreamingFileBody::new(file, metadata.len()))
        };

        response
            .body(body)
            .map(Some)
            .map_err(|e| GatewayError::Http(e.to_string()))
    }

    fn if_modified_since<B>(req: &Request<B>) -> Option<SystemTime> {
        req.headers()
            .get(IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok())
    }

    pub fn guess_mime_type(file_path: &Path, custom_mime_types: &HashMap<String, String>) -> HeaderValue {
        if let Some(extension) = file_path.extension().and_then(|ext| ext.to_str()) {
            let ext_lower = extension.to_lowercase();

            // Check custom MIME types first - allows overriding mime_guess
            if let Some(custom_mime) = custom_mime_types.get(&ext_lower) {
                if let Ok(value) = HeaderValue::from_str(custom_mime) {
                    return value;
                }
            }
        }

        let mime = mime_guess::from_path(file_path).first_or_octet_stream();

        // Add charset for text-based MIME types
        let mime_str = mime.as_ref();
        let content_type = if mime_str.starts_with("text/")
            || mime_str == "application/json"
            || mime_str == "application/xml"
            || mime_str == "application/javascript"
        {
            format!("{}; charset=utf-8", mime_str)
        } else {
            mime_str.to_string()
        };

        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
    }
}
