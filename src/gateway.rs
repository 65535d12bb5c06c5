//! Listener and dispatcher.
//!
//! Every accepted connection gets its own task; every request on it is routed
//! to exactly one handler: the prefix forwarder when the path starts with the
//! configured prefix, the static responder otherwise. Whatever neither
//! handler claims becomes a plain 404.

use crate::common::{GatewayBody, ResponseBuilder, box_body};
use crate::config::Config;
use crate::error::GatewayError;
use crate::reverse_proxy::PrefixForwarder;
use crate::static_files::StaticFileHandler;
use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Smallest read buffer hyper accepts for an HTTP/1 connection.
const MIN_HEADER_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Proxy,
    Static,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Proxy => write!(f, "proxy"),
            Route::Static => write!(f, "static"),
        }
    }
}

pub struct Gateway {
    config: Config,
    static_files: StaticFileHandler,
    forwarder: PrefixForwarder,
    connection_slots: Arc<Semaphore>,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        let static_files = StaticFileHandler::from_config(&config)?;
        let forwarder = PrefixForwarder::from_config(&config)?;
        let connection_slots = Arc::new(Semaphore::new(config.max_connections()));

        debug!(
            "Gateway configuration - static_root: {}, prefix: {}, upstream: {}, rewrite_host: {}",
            static_files.root_path().display(),
            config.proxy_prefix,
            config.upstream_origin,
            config.rewrite_host_header
        );

        Ok(Self {
            config,
            static_files,
            forwarder,
            connection_slots,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prefix match wins; everything else is offered to the static responder.
    pub fn route(&self, path: &str) -> Route {
        if self.forwarder.matches(path) {
            Route::Proxy
        } else {
            Route::Static
        }
    }

    /// Produces exactly one response for one request. Never fails: errors are
    /// translated into status responses here.
    pub async fn dispatch<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match self.handle(req, client_addr).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    GatewayError::NotFound(_) | GatewayError::PathTraversal(_) => debug!("{}", e),
                    GatewayError::MalformedRequest(_)
                    | GatewayError::UpstreamUnavailable(_)
                    | GatewayError::UpstreamTimeout(_) => warn!("{} {}: {}", method, path, e),
                    _ => error!("{} {}: {}", method, path, e),
                }
                ResponseBuilder::from_error(&e)
            }
        };

        info!(
            "{} {} -> {} ({} ms)",
            method,
            path,
            response.status().as_u16(),
            started.elapsed().as_millis()
        );
        response
    }

    async fn handle<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !req.uri().path().starts_with('/') {
            return Err(GatewayError::MalformedRequest(format!("unsupported request target '{}'", req.uri())));
        }

        let route = self.route(req.uri().path());
        debug!("{} {} routed to {}", req.method(), req.uri().path(), route);

        match route {
            Route::Proxy => self.forwarder.forward(req.map(box_body), client_addr).await,
            Route::Static => {
                let (parts, _) = req.into_parts();
                let head = Request::from_parts(parts, ());
                self.static_files
                    .handle_request(&head)
                    .await?
                    .ok_or_else(|| GatewayError::NotFound(head.uri().path().to_string()))
            }
        }
    }

    pub async fn run(self) -> Result<(), GatewayError> {
        info!("Binding TCP listener to: {}", self.config.listen_addr);
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener. Returns only if the local
    /// address cannot be read; accept errors are logged and skipped.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        let local_addr = listener.local_addr()?;
        let gateway = Arc::new(self);

        info!(
            "Listening on http://{} (static: {}, {} -> {})",
            local_addr,
            gateway.static_files.root_path().display(),
            gateway.forwarder.prefix(),
            gateway.forwarder.origin()
        );

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let permit = match Arc::clone(&gateway.connection_slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, rejecting connection from: {}", remote_addr);
                    drop(stream);
                    continue;
                }
            };

            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway.serve_connection(stream, remote_addr).await;
                drop(permit);
            });
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        debug!("Connection established from: {}", remote_addr);

        let mut builder = ServerBuilder::new();
        builder
            .keep_alive(true)
            .timer(TokioTimer::new())
            .header_read_timeout(Duration::from_secs(self.config.header_read_timeout_secs()));
        if let Some(max_header_size) = self.config.max_header_size {
            builder.max_buf_size(max_header_size.max(MIN_HEADER_BUF_SIZE));
        }

        let gateway = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let gateway = Arc::clone(&gateway);
            async move { Ok::<_, Infallible>(gateway.dispatch(req, Some(remote_addr)).await) }
        });

        // Dropping this future on client disconnect also drops any in-flight
        // upstream request and open file stream.
        if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
            debug!("Connection from {} ended with error: {}", remote_addr, e);
        }
    }
}
