//! `scgi-server` binary: runs the SCGI processor with a demonstration handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use scgi_core::DEFAULT_MAX_CONNECTIONS;
use scgi_server::network::{handle_signals, ConnectionConfig};
use scgi_server::{Processor, ProcessorConfig, RequestHandler, ScgiRequest, Serialized};
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "scgi-server",
    version,
    about = "SCGI gateway between a front-end web server and an application handler"
)]
struct Args {
    /// Bind address
    #[arg(long, env = "SCGI_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Bind port (0 for OS-assigned)
    #[arg(short, long, env = "SCGI_PORT", default_value_t = 9999)]
    port: u16,

    /// Connections above this count receive the busy redirect
    #[arg(long, env = "SCGI_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Environment tag handed to the application
    #[arg(short, long, env = "SCGI_ENVIRONMENT", default_value = "production")]
    environment: String,

    /// Seconds allowed for reading one request (0 disables the limit)
    #[arg(long, env = "SCGI_READ_TIMEOUT_SECS", default_value_t = 30)]
    read_timeout_secs: u64,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "SCGI_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Run the application handler one request at a time
    #[arg(long)]
    serialize: bool,
}

impl Args {
    fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            host: self.host.clone(),
            port: self.port,
            max_connections: self.max_connections,
            environment: self.environment.clone(),
            connection: ConnectionConfig {
                read_timeout: (self.read_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.read_timeout_secs)),
            },
        }
    }
}

fn init_tracing(args: &Args) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match args.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).init(),
    }
}

/// Answers every request with a JSON description of what it received.
struct EchoHandler {
    environment: String,
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(
        &self,
        request: ScgiRequest,
        response: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(&json!({
            "environment": self.environment,
            "peer": request.peer.to_string(),
            "headers": request.headers,
            "body_bytes": request.body.len(),
        }))?;

        let head = format!(
            "Status: 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        response.write_all(head.as_bytes()).await?;
        response.write_all(&body).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    let echo = EchoHandler {
        environment: args.environment.clone(),
    };
    let handler: Arc<dyn RequestHandler> = if args.serialize {
        Arc::new(Serialized::new(echo))
    } else {
        Arc::new(echo)
    };

    let mut processor = Processor::new(args.processor_config(), handler);
    processor.start().await?;

    let controller = processor.shutdown_controller();
    let registry = processor.registry();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(controller, registry).await {
            warn!(error = %e, "Signal handling unavailable");
        }
    });

    processor.serve().await?;
    Ok(())
}
