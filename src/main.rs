//! vibe-rule - edge message routing bridge
//!
//! Usage:
//!   vibe-rule [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: etc/vibe-rule/conf.toml)
//!   -n, --node <NAME>      Node name used in generated client ids
//!   --metrics-bind <ADDR>  Serve Prometheus metrics on this address
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vibe_rule::client::DefaultClientFactory;
use vibe_rule::config::Config;
use vibe_rule::function::HttpFunctionClient;
use vibe_rule::rule::Builder;
use vibe_rule::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// vibe-rule - edge message routing bridge
#[derive(Parser, Debug)]
#[command(name = "vibe-rule")]
#[command(version)]
#[command(about = "Routes messages between MQTT, HTTP, message queues and object storage")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "etc/vibe-rule/conf.toml")]
    config: PathBuf,

    /// Node name used in generated client ids
    #[arg(short, long)]
    node: Option<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, RUST_LOG overrides both
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_filter()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from {:?}", args.config);

    if let Some(node) = args.node {
        config.node.name = node;
    }
    if let Some(bind) = args.metrics_bind {
        config.metrics.enabled = true;
        config.metrics.bind = bind;
    }

    info!("Starting vibe-rule");
    info!("  Node: {}", config.node.name);
    info!("  Clients: {}", config.clients.len());
    for client in &config.clients {
        info!("    - {} ({})", client.name, client.kind);
    }
    info!("  Rules: {}", config.rules.len());
    for rule in &config.rules {
        let target = rule
            .target
            .as_ref()
            .map(|t| format!("{}:{}", t.client, t.topic))
            .unwrap_or_else(|| "-".to_string());
        let function = rule
            .function
            .as_ref()
            .map(|f| f.name.as_str())
            .unwrap_or("-");
        info!(
            "    - {}: {}:{} -> {} (function={})",
            rule.name, rule.source.client, rule.source.topic, target, function
        );
    }

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(Metrics::new());

    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        let metrics_server = MetricsServer::new(metrics.clone(), config.metrics.bind);
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run(token).await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let function = Arc::new(HttpFunctionClient::new(&config.function)?);
    let builder = Builder::new(
        config.node.name.clone(),
        Arc::new(DefaultClientFactory),
        function,
    )
    .with_metrics(metrics)
    .with_adapter(config.adapter.clone());

    let clients = match builder.build(&config.clients, &config.rules).await {
        Ok(clients) => clients,
        Err(e) => {
            error!("Failed to start rules: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(addr) = clients.ingress_addr() {
        info!("  Ingress: http://{}/rules/{{name}}", addr);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    clients.close().await;

    Ok(())
}
