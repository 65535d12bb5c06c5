use crate::common::{GatewayBody, IdleTimeoutBody, box_body};
use crate::config::Config;
use crate::error::GatewayError;
use http_body_util::BodyExt;
use hyper::header::{CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use log::{debug, warn};
use std::net::SocketAddr;
use tokio::time::{Duration, timeout};
use url::Url;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes headers that only describe one transport leg, including any
/// extra names the sender listed in `Connection`.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Forwards requests under one path prefix to one fixed upstream origin.
pub struct PrefixForwarder {
    client: Client<HttpsConnector<HttpConnector>, GatewayBody>,
    prefix: String,
    origin: Url,
    authority: HeaderValue,
    rewrite_host: bool,
    forwarded_headers: bool,
    timeout_duration: Duration,
}

impl PrefixForwarder {
    pub fn new(prefix: String, upstream_origin: &str, connect_timeout_secs: u64, request_timeout_secs: u64) -> Result<Self, GatewayError> {
        Self::with_pool(prefix, upstream_origin, connect_timeout_secs, request_timeout_secs, 10, 90)
    }

    pub fn with_pool(
        prefix: String,
        upstream_origin: &str,
        connect_timeout_secs: u64,
        request_timeout_secs: u64,
        pool_max_idle_per_host: usize,
        pool_idle_timeout_secs: u64,
    ) -> Result<Self, GatewayError> {
        if prefix.is_empty() {
            return Err(GatewayError::Config("Proxy prefix must not be empty".to_string()));
        }

        let origin = Url::parse(upstream_origin)?;
        if origin.scheme() != "http" && origin.scheme() != "https" {
            return Err(GatewayError::Config(format!("Unsupported upstream scheme '{}'", origin.scheme())));
        }
        let authority = Self::authority_of(&origin)?;

        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(Duration::from_secs(connect_timeout_secs)));
        http.enforce_http(false);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(pool_idle_timeout_secs))
            .pool_timer(TokioTimer::new())
            .build(HttpsConnector::new_with_connector(http));

        Ok(Self {
            client,
            prefix,
            origin,
            authority,
            rewrite_host: true,
            forwarded_headers: false,
            timeout_duration: Duration::from_secs(request_timeout_secs),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let forwarder = Self::with_pool(
            config.proxy_prefix.clone(),
            &config.upstream_origin,
            config.connect_timeout_secs(),
            config.request_timeout_secs(),
            config.effective_pool_max_idle(),
            config.pool_idle_timeout_secs(),
        )?;

        Ok(forwarder
            .with_rewrite_host(config.rewrite_host_header)
            .with_forwarded_headers(config.forwarded_headers))
    }

    pub fn with_rewrite_host(mut self, rewrite_host: bool) -> Self {
        self.rewrite_host = rewrite_host;
        self
    }

    pub fn with_forwarded_headers(mut self, forwarded_headers: bool) -> Self {
        self.forwarded_headers = forwarded_headers;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Byte-wise prefix match on the request path.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// `host[:port]` as the upstream expects it in `Host`; default ports are omitted.
    fn authority_of(origin: &Url) -> Result<HeaderValue, GatewayError> {
        let host = origin.host_str()
            .ok_or_else(|| GatewayError::Config(format!("Upstream origin '{}' has no host", origin)))?;
        let authority = match origin.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        HeaderValue::from_str(&authority)
            .map_err(|e| GatewayError::Config(format!("Invalid upstream authority '{}': {}", authority, e)))
    }

    /// Path with the prefix removed, always starting with `/`.
    pub fn rewrite_path(&self, path: &str) -> String {
        let remainder = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        if remainder.is_empty() {
            "/".to_string()
        } else if remainder.starts_with('/') {
            remainder.to_string()
        } else {
            format!("/{}", remainder)
        }
    }

    pub fn build_target_uri(&self, uri: &Uri) -> Result<Uri, GatewayError> {
        let rewritten = self.rewrite_path(uri.path());

        let mut target = format!(
            "{}://{}{}{}",
            self.origin.scheme(),
            self.authority.to_str().unwrap_or_default(),
            self.origin.path().trim_end_matches('/'),
            rewritten
        );
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query);
        }

        target.parse()
            .map_err(|e: http::uri::InvalidUri| GatewayError::Uri(e.to_string()))
    }

    fn modify_request(&self, req: &mut Request<GatewayBody>, target_uri: Uri, client_addr: Option<SocketAddr>) {
        let original_host = req.headers().get(HOST).cloned();
        *req.uri_mut() = target_uri;

        let headers = req.headers_mut();
        strip_hop_by_hop_headers(headers);

        if self.rewrite_host {
            headers.insert(HOST, self.authority.clone());
        }

        if self.forwarded_headers {
            if let Some(addr) = client_addr {
                let ip = addr.ip().to_string();
                let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                    Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing.trim(), ip),
                    _ => ip,
                };
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(X_FORWARDED_FOR.clone(), value);
                }
            }
            headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));
            if let Some(host) = original_host {
                headers.insert(X_FORWARDED_HOST.clone(), host);
            }
        }
    }

    fn modify_response<B>(&self, mut response: Response<B>) -> Response<B> {
        strip_hop_by_hop_headers(response.headers_mut());
        response
    }

    /// Sends the request upstream and streams the answer back.
    ///
    /// Connection failures become `UpstreamUnavailable`, a missing response
    /// head within the request timeout becomes `UpstreamTimeout`. Once the head
    /// is back, the body is aborted if it stalls for longer than the same
    /// timeout between frames.
    pub async fn forward(&self, mut req: Request<GatewayBody>, client_addr: Option<SocketAddr>) -> Result<Response<GatewayBody>, GatewayError> {
        let target_uri = self.build_target_uri(req.uri())?;
        debug!("Forwarding {} {} -> {}", req.method(), req.uri(), target_uri);

        self.modify_request(&mut req, target_uri, client_addr);

        let response = timeout(self.timeout_duration, self.client.request(req))
            .await
            .map_err(|_| {
                warn!("Upstream {} did not respond within {:?}", self.origin, self.timeout_duration);
                GatewayError::UpstreamTimeout(self.timeout_duration.as_secs())
            })?
            .map_err(|e| {
                warn!("Upstream {} request failed: {:?}", self.origin, e);
                GatewayError::UpstreamUnavailable(e.to_string())
            })?;

        let idle = self.timeout_duration;
        Ok(self
            .modify_response(response)
            .map(|body| IdleTimeoutBody::new(box_body(body), idle).boxed_unsync()))
    }
}
