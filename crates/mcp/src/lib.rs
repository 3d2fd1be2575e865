// MCP (Model Context Protocol) server implementation
// Tool registry, capability negotiation, notifications and rate limiting
// behind a JSON-RPC stdio transport, plus a client for the same framing

pub mod client;
pub mod config;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod server;
pub mod service;
pub mod tools;

pub use client::{ClientError, ClientResult, McpClient};
pub use error::{McpError, McpResult};
pub use notify::{NotificationDispatcher, SubscriptionId};
pub use server::McpServer;
pub use service::{McpService, McpServiceBuilder};
