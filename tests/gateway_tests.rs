//! End-to-end tests: a real gateway on an ephemeral port in front of a mock
//! upstream built with hyper.

use devgate::config::Config;
use devgate::gateway::Gateway;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HOST, HeaderMap};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Echoes what it received in `x-upstream-*` headers. `/users/1` answers with
/// a fixed JSON document, everything else echoes the request body.
async fn upstream_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let method = req.method().to_string();
    let saw_hop_header = req.headers().contains_key("keep-alive");
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let payload = if path.starts_with("/users/1") {
        Bytes::from_static(br#"{"id":1}"#)
    } else {
        body
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header("keep-alive", "timeout=5")
        .header("x-upstream-path", path)
        .header("x-upstream-host", host)
        .header("x-upstream-method", method)
        .header("x-upstream-saw-hop-header", saw_hop_header.to_string())
        .body(Full::new(payload))
        .unwrap())
}

async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream_handler))
                    .await;
            });
        }
    });

    addr
}

/// Accepts connections and never answers.
async fn spawn_silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

/// Sends a response head promising 100 bytes, delivers 10 and then stalls.
async fn spawn_stalling_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nhelloworld")
                .await;
            held.push(stream);
        }
    });

    addr
}

/// Origin of a port that was bound and released, so connects are refused.
async fn closed_origin() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    format!("http://{}", listener.local_addr().unwrap())
}

fn static_site() -> TempDir {
    let dir = TempDir::new().unwrap();
    let public = dir.path().join("web").join("public");
    fs::create_dir_all(public.join("docs")).unwrap();
    fs::write(public.join("index.html"), "<html><body>devgate</body></html>").unwrap();
    fs::write(public.join("docs").join("index.html"), "<p>docs</p>").unwrap();
    fs::write(public.join("app.js"), "console.log('hi');").unwrap();
    dir
}

fn config_for(site: &Path, upstream: &str) -> Config {
    Config {
        static_root: site.join("web").join("public").to_string_lossy().to_string(),
        upstream_origin: upstream.to_string(),
        ..Config::default()
    }
}

async fn spawn_gateway(config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Gateway::new(config).unwrap();
    tokio::spawn(gateway.serve(listener));
    addr
}

async fn send(
    addr: SocketAddr,
    method: Method,
    path: &str,
    body: &'static str,
) -> (StatusCode, HeaderMap, Bytes) {
    let client: Client<HttpConnector, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let req = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", addr, path))
        .header("keep-alive", "timeout=30")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap();

    let response = client.request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, bytes)
}

/// Sends raw bytes and returns everything the gateway writes before closing.
async fn send_raw(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("gateway kept the connection open")
        .unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

#[tokio::test]
async fn test_prefix_request_is_forwarded_without_prefix() {
    let site = static_site();
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(config_for(site.path(), &format!("http://{}", upstream))).await;

    let (status, headers, body) = send(gateway, Method::GET, "/api/users/1", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], br#"{"id":1}"#);
    assert_eq!(headers.get("x-upstream-path").unwrap(), "/users/1");
    assert_eq!(headers.get("x-upstream-method").unwrap(), "GET");
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
}

#[tokio::test]
async fn test_bare_prefix_maps_to_root_and_query_is_kept() {
    let site = static_site();
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(config_for(site.path(), &format!("http://{}", upstream))).await;

    let (_, headers, _) = send(gateway, Method::GET, "/api", "").await;
    assert_eq!(headers.get("x-upstream-path").unwrap(), "/");

    let (_, headers, _) = send(gateway, Method::GET, "/api?page=2", "").await;
    assert_eq!(headers.get("x-upstream-path").unwrap(), "/?page=2");

    let (_, headers, _) = send(gateway, Method::GET, "/api/users/1?verbose=true", "").await;
    assert_eq!(headers.get("x-upstream-path").unwrap(), "/users/1?verbose=true");
}

#[tokio::test]
async fn test_method_and_body_are_forwarded() {
    let site = static_site();
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(config_for(site.path(), &format!("http://{}", upstream))).await;

    let (status, headers, body) = send(gateway, Method::POST, "/api/items", r#"{"name":"widget"}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-upstream-method").unwrap(), "POST");
    assert_eq!(headers.get("x-upstream-path").unwrap(), "/items");
    assert_eq!(&body[..], br#"{"name":"widget"}"#);
}

#[tokio::test]
async fn test_host_header_rewrite_follows_config() {
    let site = static_site();
    let upstream = spawn_upstream().await;

    let rewriting = spawn_gateway(config_for(site.path(), &format!("http://{}", upstream))).await;
    let (_, headers, _) = send(rewriting, Method::GET, "/api/whoami", "").await;
    assert_eq!(headers.get("x-upstream-host").unwrap(), upstream.to_string().as_str());

    let mut config = config_for(site.path(), &format!("http://{}", upstream));
    config.rewrite_host_header = false;
    let preserving = spawn_gateway(config).await;
    let (_, headers, _) = send(preserving, Method::GET, "/api/whoami", "").await;
    assert_eq!(headers.get("x-upstream-host").unwrap(), preserving.to_string().as_str());
}

#[tokio::test]
async fn test_hop_by_hop_headers_are_stripped_both_ways() {
    let site = static_site();
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(config_for(site.path(), &format!("http://{}", upstream))).await;

    let (_, headers, _) = send(gateway, Method::GET, "/api/users/1", "").await;

    assert_eq!(headers.get("x-upstream-saw-hop-header").unwrap(), "false");
    assert!(headers.get("keep-alive").is_none());
}

#[tokio::test]
async fn test_static_file_is_served_byte_identical() {
    let site = static_site();
    let gateway = spawn_gateway(config_for(site.path(), "http://127.0.0.1:9")).await;

    let (status, headers, body) = send(gateway, Method::GET, "/index.html", "").await;

    let expected = fs::read(site.path().join("web/public/index.html")).unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], &expected[..]);
    assert_eq!(headers.get("content-type").unwrap(), "text/html; charset=utf-8");
}

#[tokio::test]
async fn test_large_static_file_streams_intact() {
    let site = static_site();
    let data: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    fs::write(site.path().join("web/public/bundle.bin"), &data).unwrap();
    let gateway = spawn_gateway(config_for(site.path(), "http://127.0.0.1:9")).await;

    let (status, headers, body) = send(gateway, Method::GET, "/bundle.bin", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-length").unwrap(), data.len().to_string().as_str());
    assert_eq!(body.len(), data.len());
    assert!(body[..] == data[..]);
}

#[tokio::test]
async fn test_root_and_directory_serve_index() {
    let site = static_site();
    let gateway = spawn_gateway(config_for(site.path(), "http://127.0.0.1:9")).await;

    let (status, _, body) = send(gateway, Method::GET, "/", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"<html><body>devgate</body></html>");

    let (status, headers, _) = send(gateway, Method::GET, "/docs", "").await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(headers.get("location").unwrap(), "/docs/");

    let (status, _, body) = send(gateway, Method::GET, "/docs/", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"<p>docs</p>");
}

#[tokio::test]
async fn test_traversal_is_not_found() {
    let site = static_site();
    fs::write(site.path().join("web").join("secret.txt"), "top secret").unwrap();
    let gateway = spawn_gateway(config_for(site.path(), "http://127.0.0.1:9")).await;

    for path in ["/../../etc/passwd", "/../secret.txt", "/%2e%2e/secret.txt", "/docs/../../secret.txt"] {
        let response = send_raw(
            gateway,
            &format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"), "{} -> {}", path, response);
        assert!(!response.contains("top secret"));
        assert!(!response.contains("root:"));
    }
}

#[tokio::test]
async fn test_unmatched_path_is_not_found() {
    let site = static_site();
    let gateway = spawn_gateway(config_for(site.path(), "http://127.0.0.1:9")).await;

    let (status, _, body) = send(gateway, Method::GET, "/nope/missing.css", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Not Found");

    let (status, _, _) = send(gateway, Method::POST, "/index.html", "x").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let site = static_site();
    let gateway = spawn_gateway(config_for(site.path(), &closed_origin().await)).await;

    let started = Instant::now();
    let (status, _, body) = send(gateway, Method::GET, "/api/users/1", "").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(&body[..], b"Bad Gateway");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_silent_upstream_times_out() {
    let upstream = spawn_silent_upstream().await;
    let site = static_site();
    let mut config = config_for(site.path(), &format!("http://{}", upstream));
    config.request_timeout_secs = Some(1);
    let gateway = spawn_gateway(config).await;

    let started = Instant::now();
    let (status, _, _) = send(gateway, Method::GET, "/api/slow", "").await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stalled_upstream_body_is_aborted() {
    let upstream = spawn_stalling_upstream().await;
    let site = static_site();
    let mut config = config_for(site.path(), &format!("http://{}", upstream));
    config.request_timeout_secs = Some(1);
    let gateway = spawn_gateway(config).await;

    let client: Client<HttpConnector, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let req = Request::builder()
        .uri(format!("http://{}/api/download", gateway))
        .body(Full::new(Bytes::new()))
        .unwrap();

    let started = Instant::now();
    let response = client.request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = tokio::time::timeout(Duration::from_secs(10), response.into_body().collect())
        .await
        .expect("gateway kept a stalled body open");
    assert!(body.is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_malformed_requests_get_400_and_close() {
    let site = static_site();
    let gateway = spawn_gateway(config_for(site.path(), "http://127.0.0.1:9")).await;

    let response = send_raw(gateway, "THIS IS NOT HTTP\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

    let response = send_raw(gateway, "OPTIONS * HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
}

#[tokio::test]
async fn test_gateway_keeps_serving_after_errors() {
    let site = static_site();
    let gateway = spawn_gateway(config_for(site.path(), &closed_origin().await)).await;

    let _ = send_raw(gateway, "THIS IS NOT HTTP\r\n\r\n").await;
    let (status, _, _) = send(gateway, Method::GET, "/api/anything", "").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (status, _, _) = send(gateway, Method::GET, "/app.js", "").await;
    assert_eq!(status, StatusCode::OK);
}
