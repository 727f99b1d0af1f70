use clap::Parser;
use httpcore::config::Config;
use httpcore::http::{HttpRequest, HttpResponse};
use httpcore::monitor::PerformanceMonitor;
use httpcore::pool::{ConnectionPool, PoolConfig};
use httpcore::session::RequestHandler;
use httpcore::timeout::TimeoutManager;
use httpcore::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(feature = "fast-allocator")]
#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "httpcore")]
#[command(about = "HTTP/1.1 connection pool, session, timeout, and metrics substrate", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind address for incoming HTTP connections (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Bind port for incoming HTTP connections (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Bind address for the admin/metrics HTTP surface
    #[arg(long, default_value = "127.0.0.1:9090")]
    admin_bind: String,

    /// Generate an example configuration file and exit
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    /// file's `logging.level` when given
    #[arg(long)]
    log_level: Option<String>,
}

/// Placeholder request handler wired up when no application-specific
/// handler is supplied to the binary. httpcore is a library whose
/// `RequestHandler`/`WebSocketManager` collaborators are supplied by the
/// embedding application (spec §1); this binary demonstrates the wiring
/// with a minimal handler that reports the substrate is alive.
struct PlaceholderHandler;

#[async_trait::async_trait]
impl RequestHandler for PlaceholderHandler {
    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        if request.path == "/" {
            HttpResponse::json(200, "OK", br#"{"status":"httpcore substrate running"}"#.to_vec())
        } else {
            HttpResponse::json(404, "Not Found", br#"{"error":"not found"}"#.to_vec())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!("Edit the file and run: httpcore --config {:?}", config_path);
        return Ok(());
    }

    let (mut config, config_source_log, config_warnings) = if let Some(config_path) = args.config {
        let (config, warnings) = Config::from_file(config_path.clone())?;
        (config, format!("Loading configuration from: {:?}", config_path), warnings)
    } else {
        (Config::default(), "No configuration file specified, using defaults".to_string(), Vec::new())
    };

    let log_level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_logging(&log_level)?;

    info!("httpcore v{} starting", env!("CARGO_PKG_VERSION"));
    info!("{}", config_source_log);
    for warning in &config_warnings {
        warn!("{}", warning);
    }

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    let validation = config.server.validate();
    for warning in &validation.warnings {
        warn!("config warning: {}", warning);
    }
    if !validation.is_valid() {
        for err in &validation.errors {
            error!("config error: {}", err);
        }
        return Err(httpcore::HttpCoreError::InvalidArgument(
            validation.errors.join("; "),
        ));
    }

    let monitor = Arc::new(PerformanceMonitor::new());
    let timeout_manager = TimeoutManager::new(
        config.server.connection_timeout(),
        config.server.request_timeout(),
        monitor.clone(),
    );

    let pool = ConnectionPool::new(
        PoolConfig {
            min_connections: config.server.min_connections,
            max_connections: config.server.max_connections,
            idle_timeout: config.server.idle_timeout(),
            connection_timeout: config.server.connection_timeout(),
            request_timeout: config.server.request_timeout(),
            max_request_body: config.server.max_request_body,
            max_queue_size: config.server.max_queue_size,
            max_queue_wait: config.server.max_queue_wait(),
        },
        Arc::new(PlaceholderHandler),
        None,
        timeout_manager,
        monitor.clone(),
    )?;
    pool.start_cleanup_timer().await;

    let admin_handle = if config.server.enable_metrics {
        Some(httpcore::api::start_admin_server(&args.admin_bind, monitor.clone(), pool.clone()).await?)
    } else {
        None
    };

    let bind_addr = format!("{}:{}", config.bind_address, config.bind_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("listening for HTTP connections on {}", bind_addr);

    let accept_pool = pool.clone();
    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let pool = accept_pool.clone();
                    tokio::spawn(async move {
                        if let Err(e) = pool.serve(socket).await {
                            warn!(%peer, error = %e, "connection rejected");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    });

    let shutdown_signal = tokio::spawn(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        info!("received ctrl-c, shutting down gracefully...");
    });

    tokio::select! {
        _ = accept_loop => {}
        _ = shutdown_signal => {}
    }

    let shutdown_start = Instant::now();
    pool.shutdown().await;
    if let Some(handle) = admin_handle {
        handle.abort();
    }
    info!(elapsed_ms = shutdown_start.elapsed().as_millis() as u64, "shutdown complete");

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| httpcore::HttpCoreError::InvalidArgument(format!("invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
