// Standalone MCP server binary

use anyhow::Result;
use std::sync::Arc;
use toolgate_mcp::config::McpConfig;
use toolgate_mcp::server::McpServer;
use toolgate_mcp::tools::{EchoTool, ReadFileTool, ToolDefinition};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "toolgate_core=info,toolgate_mcp=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::info!("Toolgate MCP Server starting...");

    let config = McpConfig::from_env()?;
    let service = Arc::new(config.service_builder().build()?);

    service.register_tool(ToolDefinition::from_tool(Arc::new(EchoTool)))?;
    service.register_tool(ToolDefinition::from_tool(Arc::new(ReadFileTool::new(
        config.allowed_directories()?,
    ))))?;

    tracing::info!("Registered {} tools", service.tool_count());

    let server = McpServer::new(service);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    server.start().await?;

    Ok(())
}
