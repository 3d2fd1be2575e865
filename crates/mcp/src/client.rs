// MCP client: newline-delimited JSON-RPC over any byte stream

use crate::protocol::{
    notifications, CallToolParams, CallToolResult, CancelledParams, ClientCapabilities,
    Implementation, InitializeParams, InitializeResult, JsonRpcRequest, JsonRpcResponse,
    ListToolsParams, ListToolsResult, Method, PROTOCOL_VERSION,
};
use crate::server::MAX_LINE_LENGTH;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur when talking to an MCP server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with a JSON-RPC error.
    #[error("RPC error ({code}): {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The connection ended before the response arrived.
    #[error("Connection closed")]
    Closed,

    /// Reading or writing a line failed.
    #[error("Transport error: {0}")]
    Transport(#[from] LinesCodecError),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A response carried neither a result nor an error.
    #[error("Malformed response to request {0}")]
    MalformedResponse(u64),
}

/// Client side of one MCP connection.
///
/// Requests are answered in any order; responses that arrive while waiting
/// for another request are kept until asked for. Server notifications are
/// queued and read with `next_notification`.
pub struct McpClient<R, W> {
    reader: FramedRead<R, LinesCodec>,
    writer: FramedWrite<W, LinesCodec>,
    client_info: Implementation,
    next_id: u64,
    responses: HashMap<String, JsonRpcResponse>,
    notifications: VecDeque<JsonRpcRequest>,
    server: Option<InitializeResult>,
}

impl<R, W> McpClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, client_info: Implementation) -> Self {
        Self {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer: FramedWrite::new(writer, LinesCodec::new()),
            client_info,
            next_id: 1,
            responses: HashMap::new(),
            notifications: VecDeque::new(),
            server: None,
        }
    }

    /// Handshake result, once `initialize` has succeeded
    pub fn server(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    /// Handshake declaring sampling support
    pub async fn initialize(&mut self) -> ClientResult<InitializeResult> {
        self.initialize_with(ClientCapabilities {
            sampling: true,
            ..ClientCapabilities::default()
        })
        .await
    }

    /// Handshake with explicit capabilities, followed by
    /// `notifications/initialized`
    pub async fn initialize_with(
        &mut self,
        capabilities: ClientCapabilities,
    ) -> ClientResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities,
            client_info: self.client_info.clone(),
        };
        let result: InitializeResult = self.call(Method::Initialize, &params).await?;

        if result.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                server = %result.protocol_version,
                client = PROTOCOL_VERSION,
                "server speaks a different protocol version"
            );
        }
        tracing::info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            "connected to MCP server"
        );

        self.notify(notifications::INITIALIZED, None).await?;
        self.server = Some(result.clone());
        Ok(result)
    }

    pub async fn ping(&mut self) -> ClientResult<()> {
        self.request(Method::Ping.as_str(), None).await.map(|_| ())
    }

    pub async fn list_tools(&mut self) -> ClientResult<ListToolsResult> {
        self.call(Method::ListTools, &ListToolsParams::default()).await
    }

    pub async fn call_tool(
        &mut self,
        name: impl Into<String>,
        arguments: impl Serialize,
    ) -> ClientResult<CallToolResult> {
        let params = CallToolParams {
            name: name.into(),
            arguments: Some(serde_json::to_value(arguments)?),
        };
        self.call(Method::CallTool, &params).await
    }

    /// Send a request and wait for its result
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> ClientResult<serde_json::Value> {
        let id = self.send_request(method, params).await?;
        self.response(id).await
    }

    /// Send a request without waiting. Returns its id for `response`.
    pub async fn send_request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> ClientResult<u64> {
        let id = self.next_id;
        self.next_id += 1;

        tracing::debug!(method, id, "sending request");
        self.write(&JsonRpcRequest::new(id, method, params)).await?;
        Ok(id)
    }

    /// Wait for the response to request `id`
    pub async fn response(&mut self, id: u64) -> ClientResult<serde_json::Value> {
        let key = serde_json::Value::from(id).to_string();
        loop {
            if let Some(response) = self.responses.remove(&key) {
                if let Some(error) = response.error {
                    return Err(ClientError::Rpc {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    });
                }
                return response.result.ok_or(ClientError::MalformedResponse(id));
            }
            if !self.read_message().await? {
                return Err(ClientError::Closed);
            }
        }
    }

    /// True if the response to `id` has arrived and not been taken yet
    pub fn has_response(&self, id: u64) -> bool {
        self.responses
            .contains_key(&serde_json::Value::from(id).to_string())
    }

    pub async fn notify(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> ClientResult<()> {
        self.write(&JsonRpcRequest::notification(method, params))
            .await
    }

    /// Ask the server to abandon request `id`
    pub async fn cancel(&mut self, id: u64, reason: Option<&str>) -> ClientResult<()> {
        let params = CancelledParams {
            request_id: id.into(),
            reason: reason.map(str::to_string),
        };
        self.notify(notifications::CANCELLED, Some(serde_json::to_value(params)?))
            .await
    }

    /// Next server notification, or `None` once the connection has ended.
    /// Responses read along the way are kept for `response`.
    pub async fn next_notification(&mut self) -> ClientResult<Option<JsonRpcRequest>> {
        loop {
            if let Some(notification) = self.notifications.pop_front() {
                return Ok(Some(notification));
            }
            if !self.read_message().await? {
                return Ok(None);
            }
        }
    }

    /// Close the sending side. The server sees end of input.
    pub async fn close(&mut self) -> ClientResult<()> {
        SinkExt::<String>::close(&mut self.writer).await?;
        Ok(())
    }

    async fn call<P, T>(&mut self, method: Method, params: &P) -> ClientResult<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method.as_str(), Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn write(&mut self, message: &JsonRpcRequest) -> ClientResult<()> {
        let line = serde_json::to_string(message)?;
        self.writer.send(line).await?;
        Ok(())
    }

    /// Read one message into the response map or notification queue.
    /// Returns false at end of input.
    async fn read_message(&mut self) -> ClientResult<bool> {
        let Some(line) = self.reader.next().await.transpose()? else {
            return Ok(false);
        };

        let value: serde_json::Value = serde_json::from_str(&line)?;
        if value.get("method").is_some() {
            let message: JsonRpcRequest = serde_json::from_value(value)?;
            if message.is_notification() {
                self.notifications.push_back(message);
            } else {
                tracing::debug!(method = %message.method, "ignoring server request");
            }
        } else {
            let response: JsonRpcResponse = serde_json::from_value(value)?;
            self.responses.insert(response.id.to_string(), response);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_initialize_sends_protocol_version_and_sampling() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);

        let peer = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let request: serde_json::Value =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {"name": "fake", "version": "0.0.1"}
                }
            });
            // A notification ahead of the reply must not be mistaken for it
            let early = json!({"jsonrpc": "2.0", "method": notifications::TOOLS_LIST_CHANGED});
            server_write
                .write_all(format!("{}\n{}\n", early, reply).as_bytes())
                .await
                .unwrap();

            let initialized: serde_json::Value =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            (request, initialized)
        });

        let mut client = McpClient::new(
            client_read,
            client_write,
            Implementation::new("test-client", "1.0.0"),
        );
        let result = client.initialize().await.unwrap();
        assert_eq!(result.server_info, Implementation::new("fake", "0.0.1"));
        assert!(result.capabilities.tools_list_changed);
        assert!(client.server().is_some());

        let (request, initialized) = peer.await.unwrap();
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(request["params"]["capabilities"], json!({"sampling": {}}));
        assert_eq!(request["params"]["clientInfo"]["name"], "test-client");
        assert_eq!(initialized, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));

        let notification = client.next_notification().await.unwrap().unwrap();
        assert_eq!(notification.method, notifications::TOOLS_LIST_CHANGED);
    }

    #[tokio::test]
    async fn test_rpc_error_and_closed_connection() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);

        let peer = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            lines.next_line().await.unwrap().unwrap();
            server_write
                .write_all(
                    b"{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-32601,\"message\":\"Method not found: nope\"}}\n",
                )
                .await
                .unwrap();
            lines.next_line().await.unwrap().unwrap();
            // Both halves dropped here: the connection ends
        });

        let mut client = McpClient::new(client_read, client_write, Implementation::new("c", "1"));
        let err = client.request("nope", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc { code: -32601, .. }));

        let err = client.ping().await.unwrap_err();
        peer.await.unwrap();
        assert!(matches!(err, ClientError::Closed));
    }
}
