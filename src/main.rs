mod config;
mod error;
mod mcp;
mod tools;
mod utils;

use crate::config::{Config, TransportMode};
use crate::mcp::dispatch::ToolDispatcher;
use crate::mcp::handler::GatewayServerHandler;
use crate::tools::terminal_tool::TerminalManager;
use anyhow::{Context, Result};
use rust_mcp_schema::{Implementation, InitializeResult, ServerCapabilities, ServerCapabilitiesTools, LATEST_PROTOCOL_VERSION};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

#[cfg(feature = "sse")]
use rust_mcp_sdk::mcp_server::{hyper_server, HyperServerOptions};
#[cfg(feature = "stdio")]
use rust_mcp_sdk::{mcp_server::server_runtime, McpServer};
#[cfg(feature = "stdio")]
use rust_mcp_transport::{StdioTransport, TransportOptions};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mcp_tool_gateway={}", level)));

    // stdout carries the stdio transport, so logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn get_server_details() -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: "mcp-tool-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        meta: None,
        instructions: Some(
            "Tool gateway with persistent interactive terminals. \
            Start a shell with `create_terminal`, send lines with `terminal_input` and poll with `read_terminal_output`. \
            Reads return after the wait timeout, after 3 seconds without new output, or once max_lines new lines are available; \
            check `has_new_output` to tell progress from idle polling. Close terminals you no longer need with `close_terminal`."
                .to_string(),
        ),
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().skip(1).any(|arg| arg == "--openai-tools") {
        println!("{}", serde_json::to_string_pretty(&mcp::schemas::openai_tool_definitions())?);
        return Ok(());
    }

    let config = Arc::new(Config::load().context("Failed to load configuration")?);
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting mcp-tool-gateway server");
    tracing::debug!("Loaded configuration: {:?}", config);

    let terminal_manager = Arc::new(TerminalManager::new(config.clone()));
    let dispatcher = Arc::new(ToolDispatcher::new(config.clone(), terminal_manager));
    let handler = GatewayServerHandler::new(dispatcher.clone()).context("Invalid tool schema")?;
    let server_details = get_server_details();

    let served = match config.transport_mode {
        #[cfg(feature = "stdio")]
        TransportMode::Stdio => {
            tracing::info!("Using STDIO transport mode.");
            let transport = StdioTransport::new(TransportOptions::default())
                .map_err(|e| anyhow::anyhow!("Failed to create StdioTransport: {:?}", e))?;
            let server = server_runtime::create_server(server_details, transport, handler);
            server.start().await.map_err(|e| anyhow::anyhow!("MCP SDK Error: {:?}", e))
        }
        #[cfg(feature = "sse")]
        TransportMode::Sse => {
            tracing::info!(host = %config.sse_host, port = %config.sse_port, "Using SSE transport mode.");
            let sse_options = HyperServerOptions {
                host: config.sse_host.clone(),
                port: config.sse_port,
                ..Default::default()
            };
            let server = hyper_server::create_server(server_details, handler, sse_options);
            server.start().await.map_err(|e| anyhow::anyhow!("MCP SDK Error: {:?}", e))
        }
        #[allow(unreachable_patterns)]
        _ => Err(anyhow::anyhow!(
            "Selected transport mode {:?} is not available in this build.",
            config.transport_mode
        )),
    };

    dispatcher.terminal_manager().close_all().await;
    tracing::info!("Server shutdown.");
    served
}
