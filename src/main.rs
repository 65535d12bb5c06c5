use clap::Parser;
use devgate::config::Config;
use devgate::config_validation::validate_config;
use devgate::gateway::Gateway;
use devgate::logging::{self, CustomLogger};
use log::{info, warn};
use std::net::SocketAddr;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Serves a static directory and forwards one path prefix to a fixed upstream"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:5173)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "PORT", help = "Listen port, keeping the configured bind address")]
    port: Option<u16>,

    #[clap(short, long, value_name = "DIR", help = "Directory to serve static files from")]
    static_dir: Option<String>,

    #[clap(long, value_name = "PREFIX", help = "Path prefix forwarded to the upstream (e.g., /api)")]
    prefix: Option<String>,

    #[clap(short, long, value_name = "URL", help = "Upstream origin (e.g., http://localhost:8000)")]
    target: Option<String>,

    #[clap(long, help = "Keep the client's Host header instead of the upstream's")]
    no_rewrite_host: bool,

    #[clap(long, help = "Add X-Forwarded-For/-Host/-Proto to forwarded requests")]
    forwarded_headers: bool,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Upstream response timeout in seconds")]
    request_timeout: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum concurrent client connections")]
    max_connections: Option<usize>,

    #[clap(long, help = "Disable upstream connection pooling")]
    no_connection_pool: bool,

    #[clap(long, value_name = "EXT:MIME", help = "Custom MIME type mapping (e.g., mjs:text/javascript), can be used multiple times")]
    mime_type: Vec<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Write a sample configuration file and exit")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    apply_args(&mut config, &args)?;

    init_logging(&config, &args)?;

    let warnings = validate_config(&config).into_result()?;
    for warning in warnings {
        warn!("{}", warning);
    }

    info!("Starting devgate...");
    let gateway = Gateway::new(config)?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            log::error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            if let Err(e) = result {
                log::error!("Server task error: {}", e);
            }
        }
    }

    info!("devgate stopped");
    Ok(())
}

fn init_logging(config: &Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &config.logging {
        Some(logging_config) if args.log_level.is_none() && args.log_format.is_none() => {
            CustomLogger::init(logging_config.clone())
        }
        _ => {
            if let Some(level) = &args.log_level {
                logging::parse_log_level(level)?;
            }
            logging::init_fallback(args.log_level.as_deref(), args.log_format.as_deref())
        }
    }
}

fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse::<SocketAddr>()?;
    }
    if let Some(port) = args.port {
        config.listen_addr.set_port(port);
    }
    if let Some(static_dir) = &args.static_dir {
        config.static_root = static_dir.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.proxy_prefix = prefix.clone();
    }
    if let Some(target) = &args.target {
        config.upstream_origin = target.clone();
    }
    if args.no_rewrite_host {
        config.rewrite_host_header = false;
    }
    if args.forwarded_headers {
        config.forwarded_headers = true;
    }
    if args.connect_timeout.is_some() {
        config.connect_timeout_secs = args.connect_timeout;
    }
    if args.request_timeout.is_some() {
        config.request_timeout_secs = args.request_timeout;
    }
    if args.max_connections.is_some() {
        config.max_connections = args.max_connections;
    }
    if args.no_connection_pool {
        config.connection_pool_enabled = Some(false);
    }

    for mime_spec in &args.mime_type {
        let parts: Vec<&str> = mime_spec.splitn(2, ':').collect();
        if parts.len() != 2 {
            return Err(format!("Invalid MIME type specification: '{}'. Use format 'EXT:MIME'", mime_spec).into());
        }
        config.add_custom_mime_type(parts[0].trim().to_string(), parts[1].trim().to_string());
    }

    Ok(())
}
