// MCP server: newline-delimited JSON-RPC over stdio (or any byte stream)

use crate::notify::SubscriptionId;
use crate::protocol::{
    notifications, CancelledParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION,
};
use crate::service::McpService;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use toolgate_core::CallContext;

/// Longest accepted request line
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Transport around one `McpService`.
///
/// A service backs one connection at a time: server-sent notifications are
/// published on the service's dispatcher and every connection being served
/// forwards all of them.
pub struct McpServer {
    service: Arc<McpService>,
    shutdown: CancellationToken,
}

impl McpServer {
    pub fn new(service: Arc<McpService>) -> Self {
        Self {
            service,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn service(&self) -> &Arc<McpService> {
        &self.service
    }

    /// Cancelling this token stops the read loop and cancels every
    /// in-flight request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve on stdin/stdout until EOF or shutdown
    pub async fn start(&self) -> Result<()> {
        tracing::info!("MCP server listening on stdio");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one connection.
    ///
    /// Each request runs on its own task. Responses and forwarded
    /// notifications go through a single writer so lines never interleave.
    /// At end of input or shutdown, requests still waiting on a rate limit
    /// are cancelled and answered with an error; every request except those
    /// the peer cancelled gets a response before this returns.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(FramedWrite::new(writer, LinesCodec::new()), rx));

        let subscriptions = self.forward_notifications(&tx);
        let mut connection = Connection {
            service: self.service.clone(),
            cancel: self.shutdown.child_token(),
            tx,
            in_flight: Arc::default(),
            next_seq: 0,
            tasks: JoinSet::new(),
        };

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let read_result = loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                Some(joined) = connection.tasks.join_next(), if !connection.tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("request task failed: {}", e);
                    }
                    continue;
                }
                next = lines.next() => next,
            };

            match next {
                None => break Ok(()),
                Some(Ok(line)) => connection.handle_line(&line),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!("request line exceeds {} bytes", MAX_LINE_LENGTH);
                    connection.send(&JsonRpcResponse::error(
                        serde_json::Value::Null,
                        JsonRpcError::invalid_request("request too large"),
                    ));
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    break Err(anyhow::Error::new(e).context("failed to read request"));
                }
            }
        };

        // No cancellations can arrive any more; stop rate limit waits
        connection.cancel.cancel();
        while let Some(joined) = connection.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("request task failed: {}", e);
            }
        }

        for id in subscriptions {
            self.service.unsubscribe(id);
        }
        drop(connection);

        writer_task
            .await
            .context("writer task panicked")?
            .context("failed to write response")?;

        tracing::info!("MCP connection closed");
        read_result
    }

    fn forward_notifications(&self, tx: &mpsc::UnboundedSender<String>) -> Vec<SubscriptionId> {
        notifications::SERVER_SENT
            .iter()
            .map(|method| {
                let tx = tx.clone();
                self.service.subscribe(*method, move |method, params| {
                    let notification = JsonRpcRequest::notification(method, params.cloned());
                    let line = serde_json::to_string(&notification)?;
                    tx.send(line)
                        .map_err(|_| anyhow::anyhow!("connection closed"))
                })
            })
            .collect()
    }
}

/// Running request, keyed by its serialized id
struct InFlight {
    seq: u64,
    cancel: CancellationToken,
}

/// Per-connection request state
struct Connection {
    service: Arc<McpService>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<String>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    next_seq: u64,
    tasks: JoinSet<()>,
}

impl Connection {
    fn handle_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("failed to parse request: {}", e);
                self.send(&JsonRpcResponse::error(
                    serde_json::Value::Null,
                    JsonRpcError::parse_error(),
                ));
                return;
            }
        };

        if request.jsonrpc != JSONRPC_VERSION {
            if let Some(id) = request.id {
                self.send(&JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_request(format!(
                        "unsupported jsonrpc version {:?}",
                        request.jsonrpc
                    )),
                ));
            }
            return;
        }

        match request.id {
            None => self.handle_notification(&request.method, request.params),
            Some(id) => self.spawn_request(id, request.method, request.params),
        }
    }

    fn handle_notification(&self, method: &str, params: Option<serde_json::Value>) {
        if method == notifications::CANCELLED {
            let cancelled = params
                .clone()
                .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
            if let Some(cancelled) = cancelled {
                let key = cancelled.request_id.to_string();
                // Removing the entry tells the task its response is unwanted
                if let Some(request) = self.in_flight.lock().remove(&key) {
                    tracing::debug!(request_id = %key, reason = ?cancelled.reason, "cancelling request");
                    request.cancel.cancel();
                }
            }
        }
        self.service.handle_notification(method, params.as_ref());
    }

    fn spawn_request(
        &mut self,
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    ) {
        let key = id.to_string();
        let cx = CallContext::new().with_cancellation(self.cancel.child_token());
        let seq = self.next_seq;

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&key) {
                drop(in_flight);
                tracing::warn!(request_id = %key, "request id already in flight");
                self.send(&JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_request(format!("request id {} is already in flight", key)),
                ));
                return;
            }
            in_flight.insert(
                key.clone(),
                InFlight {
                    seq,
                    cancel: cx.cancellation().clone(),
                },
            );
        }
        self.next_seq += 1;

        let service = self.service.clone();
        let in_flight = self.in_flight.clone();
        let tx = self.tx.clone();

        self.tasks.spawn(async move {
            tracing::debug!(method = %method, request_id = %key, "handling request");

            let response = match service.handle(&cx, &method, params).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => {
                    tracing::debug!(method = %method, error = %e, "request failed");
                    JsonRpcResponse::error(id, e.to_rpc_error())
                }
            };

            // A missing entry (or one reused by a later request) means the
            // peer cancelled this one
            let peer_cancelled = {
                let mut in_flight = in_flight.lock();
                match in_flight.get(&key) {
                    Some(request) if request.seq == seq => {
                        in_flight.remove(&key);
                        false
                    }
                    _ => true,
                }
            };
            if peer_cancelled {
                tracing::debug!(request_id = %key, "dropping response to cancelled request");
                return;
            }
            send(&tx, &response);
        });
    }

    fn send<T: Serialize>(&self, message: &T) {
        send(&self.tx, message);
    }
}

fn send<T: Serialize>(tx: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            if tx.send(line).is_err() {
                tracing::debug!("connection closed before response was written");
            }
        }
        Err(e) => tracing::error!("failed to serialize message: {}", e),
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        sink.send(line).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, McpClient};
    use crate::protocol::{notifications, CallToolResult, Implementation};
    use crate::tools::{EchoTool, ToolDefinition};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
    };
    use tokio::task::JoinHandle;
    use toolgate_core::RateLimitConfig;

    type TestClient = McpClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    /// Line-level peer for input `McpClient` never produces
    struct RawPeer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl RawPeer {
        async fn send(&mut self, message: Value) {
            self.send_raw(&format!("{}\n", message)).await;
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().expect("server closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn close(mut self) -> Vec<Value> {
            self.writer.shutdown().await.unwrap();
            let mut rest = Vec::new();
            while let Some(line) = self.lines.next_line().await.unwrap() {
                rest.push(serde_json::from_str(&line).unwrap());
            }
            rest
        }
    }

    fn spawn_server(
        server: McpServer,
    ) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, JoinHandle<Result<()>>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let handle = tokio::spawn(async move { server.serve(server_read, server_write).await });
        let (client_read, client_write) = tokio::io::split(client_io);
        (client_read, client_write, handle)
    }

    fn connect(service: Arc<McpService>) -> (TestClient, JoinHandle<Result<()>>) {
        let (read, write, handle) = spawn_server(McpServer::new(service));
        let client = McpClient::new(read, write, Implementation::new("test-client", "1.0.0"));
        (client, handle)
    }

    fn connect_raw(service: Arc<McpService>) -> (RawPeer, JoinHandle<Result<()>>) {
        let (read, writer, handle) = spawn_server(McpServer::new(service));
        let peer = RawPeer {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (peer, handle)
    }

    fn echo_service(rate_limits: RateLimitConfig) -> Arc<McpService> {
        let service = McpService::builder()
            .name("test-server")
            .version("1.0.0")
            .rate_limits(rate_limits)
            .build()
            .unwrap();
        service
            .register_tool(ToolDefinition::from_tool(Arc::new(EchoTool)))
            .unwrap();
        Arc::new(service)
    }

    /// One echo per ~17 minutes: every call after the first waits
    fn slow_echo_service() -> Arc<McpService> {
        echo_service(RateLimitConfig::unlimited().with_tool_limit("echo", 0.001, 1))
    }

    fn echo_params() -> Option<Value> {
        Some(json!({"name": "echo", "arguments": {"message": "x"}}))
    }

    fn assert_cancelled_by_rate_limit(err: ClientError) {
        match err {
            ClientError::Rpc { code, data, .. } => {
                assert_eq!(code, JsonRpcError::RATE_LIMITED);
                assert_eq!(data, Some(json!({"reason": "cancelled"})));
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initialize_list_and_call() {
        let service = echo_service(RateLimitConfig::unlimited());
        let (mut client, handle) = connect(service.clone());

        let result = client.initialize().await.unwrap();
        assert_eq!(result.server_info, Implementation::new("test-server", "1.0.0"));
        assert!(result.capabilities.tools_list_changed);

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.tools.len(), 1);
        assert_eq!(tools.tools[0].name, "echo");

        let result = client.call_tool("echo", json!({"message": "hi"})).await.unwrap();
        assert_eq!(result, CallToolResult::text("hi"));

        let err = client.call_tool("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc { code: JsonRpcError::INVALID_PARAMS, .. }));

        client.close().await.unwrap();
        assert!(client.next_notification().await.unwrap().is_none());
        handle.await.unwrap().unwrap();

        assert!(service.is_initialized());
        assert!(service.client_capabilities().unwrap().sampling);
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let (mut peer, handle) = connect_raw(echo_service(RateLimitConfig::unlimited()));

        peer.send_raw("this is not json\n").await;
        let response = peer.recv().await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["error"]["code"], JsonRpcError::PARSE_ERROR);

        peer.send(json!({"jsonrpc": "1.0", "id": 7, "method": "ping"})).await;
        let response = peer.recv().await;
        assert_eq!(response["id"], 7);
        assert_eq!(response["error"]["code"], JsonRpcError::INVALID_REQUEST);

        peer.send(json!({"jsonrpc": "2.0", "id": 8, "method": "resources/read"}))
            .await;
        let response = peer.recv().await;
        assert_eq!(response["error"]["code"], JsonRpcError::METHOD_NOT_FOUND);

        peer.close().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_rejected() {
        let (mut peer, handle) = connect_raw(slow_echo_service());
        let call = |id: u64| {
            json!({
                "jsonrpc": "2.0", "id": id, "method": "tools/call",
                "params": {"name": "echo", "arguments": {"message": "x"}}
            })
        };

        peer.send(call(1)).await;
        assert!(peer.recv().await["result"].is_object());

        // Waits on the tool tier, so id 9 stays in flight
        peer.send(call(9)).await;
        peer.send(call(9)).await;
        let response = peer.recv().await;
        assert_eq!(response["id"], 9);
        assert_eq!(response["error"]["code"], JsonRpcError::INVALID_REQUEST);

        // The original request is still answered once input ends
        let rest = peer.close().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0]["id"], 9);
        assert_eq!(rest[0]["error"]["code"], JsonRpcError::RATE_LIMITED);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_list_changed_forwarded_to_peer() {
        let service = echo_service(RateLimitConfig::unlimited());
        let (mut client, handle) = connect(service.clone());

        // Round trip so the connection's subscriptions are in place
        client.ping().await.unwrap();

        service
            .register_tool(
                ToolDefinition::new("late", "Registered after connect", json!({"type": "object"}))
                    .with_handler(|_| async { Ok(CallToolResult::text("late")) }),
            )
            .unwrap();

        let notification = client.next_notification().await.unwrap().unwrap();
        assert_eq!(notification.method, notifications::TOOLS_LIST_CHANGED);
        assert!(notification.params.is_none());

        client.close().await.unwrap();
        assert!(client.next_notification().await.unwrap().is_none());
        handle.await.unwrap().unwrap();
        assert_eq!(service.dispatcher().subscriber_count(notifications::TOOLS_LIST_CHANGED), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_gets_no_response() {
        let (mut client, handle) = connect(slow_echo_service());

        client.call_tool("echo", json!({"message": "x"})).await.unwrap();

        let waiting = client.send_request("tools/call", echo_params()).await.unwrap();
        client.cancel(waiting, Some("user gave up")).await.unwrap();
        client.ping().await.unwrap();

        client.close().await.unwrap();
        assert!(client.next_notification().await.unwrap().is_none());
        assert!(!client.has_response(waiting));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_cancels_rate_limit_waits() {
        let (mut client, handle) = connect(slow_echo_service());

        client.call_tool("echo", json!({"message": "x"})).await.unwrap();
        let waiting = client.send_request("tools/call", echo_params()).await.unwrap();
        client.close().await.unwrap();

        // Far shorter than the ~17 minute refill
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("serve should return at end of input")
            .unwrap()
            .unwrap();

        assert_cancelled_by_rate_limit(client.response(waiting).await.unwrap_err());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_requests() {
        let server = McpServer::new(slow_echo_service());
        let shutdown = server.shutdown_token();
        let (read, write, handle) = spawn_server(server);
        let mut client = McpClient::new(read, write, Implementation::new("test-client", "1.0.0"));

        client.call_tool("echo", json!({"message": "x"})).await.unwrap();
        let waiting = client.send_request("tools/call", echo_params()).await.unwrap();
        // Answered only after the waiting request was read
        client.ping().await.unwrap();

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_cancelled_by_rate_limit(client.response(waiting).await.unwrap_err());
        assert!(client.next_notification().await.unwrap().is_none());
    }
}
