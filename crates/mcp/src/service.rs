// Protocol engine: handshake, tool listing, tool calls and notifications

use crate::error::{McpError, McpResult};
use crate::notify::{NotificationDispatcher, SubscriptionId};
use crate::protocol::{
    notifications, CallToolParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeParams, InitializeResult, ListToolsParams, ListToolsResult, LoggingLevel, Method,
    ProgressToken, ServerCapabilities, ToolSchema, PROTOCOL_VERSION,
};
use crate::tools::{ToolDefinition, ToolRegistry};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use toolgate_core::{CallContext, RateLimitConfig, RateLimiter};

/// What the client declared in its handshake
#[derive(Debug, Clone)]
struct Session {
    client_info: Implementation,
    client_capabilities: ClientCapabilities,
}

/// Builder for `McpService`
#[derive(Debug, Clone)]
pub struct McpServiceBuilder {
    name: String,
    version: String,
    instructions: Option<String>,
    capabilities: ServerCapabilities,
    rate_limits: RateLimitConfig,
}

impl Default for McpServiceBuilder {
    fn default() -> Self {
        Self {
            name: "toolgate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
            capabilities: ServerCapabilities::tools_only(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl McpServiceBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn rate_limits(mut self, rate_limits: RateLimitConfig) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn build(self) -> McpResult<McpService> {
        self.rate_limits.validate()?;

        Ok(McpService {
            server_info: Implementation::new(self.name, self.version),
            instructions: self.instructions,
            registry: ToolRegistry::new(),
            capabilities: RwLock::new(self.capabilities),
            session: RwLock::new(None),
            initialized: AtomicBool::new(false),
            dispatcher: NotificationDispatcher::new(),
            limiter: RateLimiter::new(&self.rate_limits),
        })
    }
}

/// Service-side protocol engine.
///
/// Every inbound RPC passes the global and method rate limit tiers before it
/// is routed. Tool calls additionally pass the tool tier. Shared state is
/// safe for concurrent callers; hold the service in an `Arc`.
pub struct McpService {
    server_info: Implementation,
    instructions: Option<String>,
    registry: ToolRegistry,
    capabilities: RwLock<ServerCapabilities>,
    session: RwLock<Option<Session>>,
    initialized: AtomicBool,
    dispatcher: NotificationDispatcher,
    limiter: RateLimiter,
}

impl McpService {
    pub fn builder() -> McpServiceBuilder {
        McpServiceBuilder::default()
    }

    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    /// Answer the handshake.
    ///
    /// The configured capabilities are advertised verbatim and the server
    /// always reports its own protocol version. Calling again replaces the
    /// recorded client details.
    pub fn initialize(
        &self,
        client_info: Implementation,
        client_capabilities: ClientCapabilities,
    ) -> InitializeResult {
        tracing::info!(
            client = %client_info.name,
            client_version = %client_info.version,
            "client connected"
        );

        *self.session.write() = Some(Session {
            client_info,
            client_capabilities,
        });

        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        }
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.session.read().as_ref().map(|s| s.client_info.clone())
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.client_capabilities.clone())
    }

    /// True once the client has sent `notifications/initialized`
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn list_tools(&self) -> ListToolsResult {
        ListToolsResult {
            tools: self.registry.list(),
            next_cursor: None,
        }
    }

    pub fn lookup_tool(&self, name: &str) -> McpResult<ToolSchema> {
        self.registry.lookup(name)
    }

    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }

    /// Invoke a tool: tool tier admission, lookup, then the handler.
    ///
    /// A handler `Err` becomes `HandlerFailure`. A result with `is_error`
    /// set is returned as `Ok`.
    pub async fn call_tool(
        &self,
        cx: &CallContext,
        name: &str,
        arguments: Bytes,
    ) -> McpResult<CallToolResult> {
        self.limiter.allow_tool(cx, name).await?;
        let handler = self.registry.handler(name)?;

        tracing::debug!(tool = name, bytes = arguments.len(), "calling tool");

        let result = handler(arguments)
            .await
            .map_err(|source| McpError::HandlerFailure {
                tool: name.to_string(),
                source,
            })?;

        if result.is_error {
            tracing::debug!(tool = name, "tool reported an error result");
        }
        Ok(result)
    }

    /// Register a tool, then announce the change if the capability allows.
    ///
    /// The registration stands even if a subscriber fails to receive the
    /// announcement.
    pub fn register_tool(&self, definition: ToolDefinition) -> McpResult<()> {
        let name = definition.name.clone();
        self.registry.register(definition)?;
        tracing::info!(tool = %name, "registered tool");

        if let Err(e) = self.notify_list_changed(notifications::TOOLS_LIST_CHANGED) {
            tracing::warn!(tool = %name, error = %e, "failed to announce tool list change");
        }
        Ok(())
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.capabilities.read().clone()
    }

    pub fn set_capabilities(&self, capabilities: ServerCapabilities) {
        *self.capabilities.write() = capabilities;
    }

    /// Modify the advertised capabilities in place under the write lock
    pub fn update_capabilities<F>(&self, update: F)
    where
        F: FnOnce(&mut ServerCapabilities),
    {
        update(&mut self.capabilities.write());
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn subscribe<F>(&self, method: impl Into<String>, subscriber: F) -> SubscriptionId
    where
        F: Fn(&str, Option<&serde_json::Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(method, subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Capability-gated list change notification, checked against the
    /// capabilities current at call time
    pub fn notify_list_changed(&self, method: &str) -> McpResult<()> {
        // Released before dispatch so subscribers may update capabilities
        let capabilities = self.capabilities();
        self.dispatcher.notify_list_changed(method, &capabilities)
    }

    pub fn notify_progress(
        &self,
        token: impl Into<ProgressToken>,
        progress: f64,
        total: Option<f64>,
    ) -> McpResult<()> {
        self.dispatcher.notify_progress(token, progress, total)
    }

    pub fn notify_logging_message(
        &self,
        level: LoggingLevel,
        logger: &str,
        data: impl Serialize,
    ) -> McpResult<()> {
        self.dispatcher.notify_logging_message(level, logger, data)
    }

    pub fn notify_cancelled(
        &self,
        request_id: serde_json::Value,
        reason: Option<&str>,
    ) -> McpResult<()> {
        self.dispatcher.notify_cancelled(request_id, reason)
    }

    /// Route one inbound RPC and return its JSON result.
    ///
    /// Rate limiting is keyed on the canonical method name, so aliases
    /// share a bucket. Unknown methods are still rate limited before they
    /// are rejected.
    pub async fn handle(
        &self,
        cx: &CallContext,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> McpResult<serde_json::Value> {
        let parsed = Method::parse(method);
        let key = parsed.map(|m| m.as_str()).unwrap_or(method);
        self.limiter.allow(cx, key).await?;

        let Some(parsed) = parsed else {
            return Err(McpError::MethodNotFound(method.to_string()));
        };

        match parsed {
            Method::Initialize => {
                let params: InitializeParams = decode_params(params)?;
                if params.protocol_version != PROTOCOL_VERSION {
                    tracing::warn!(
                        requested = %params.protocol_version,
                        supported = PROTOCOL_VERSION,
                        "client requested a different protocol version"
                    );
                }
                let result = self.initialize(params.client_info, params.capabilities);
                Ok(serde_json::to_value(result)?)
            }
            Method::Ping => Ok(serde_json::json!({})),
            Method::ListTools => {
                let _params: ListToolsParams = decode_params(params)?;
                Ok(serde_json::to_value(self.list_tools())?)
            }
            Method::CallTool => {
                let params: CallToolParams = decode_params(params)?;
                let arguments = params
                    .arguments
                    .unwrap_or_else(|| serde_json::json!({}));
                let arguments = Bytes::from(serde_json::to_vec(&arguments)?);

                let result = self.call_tool(cx, &params.name, arguments).await?;
                Ok(serde_json::to_value(result)?)
            }
        }
    }

    /// Handle a client-to-server notification. Unknown notifications are
    /// ignored.
    pub fn handle_notification(&self, method: &str, _params: Option<&serde_json::Value>) {
        match method {
            notifications::INITIALIZED => {
                self.initialized.store(true, Ordering::Release);
                tracing::info!("client initialized");
            }
            _ => tracing::debug!(method, "ignoring notification"),
        }
    }
}

fn decode_params<T: DeserializeOwned>(params: Option<serde_json::Value>) -> McpResult<T> {
    let params = params.unwrap_or_else(|| serde_json::json!({}));
    serde_json::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use toolgate_core::RateLimitError;

    fn unlimited_service() -> McpService {
        McpService::builder()
            .name("test-server")
            .version("1.0.0")
            .rate_limits(RateLimitConfig::unlimited())
            .build()
            .unwrap()
    }

    fn echo_definition() -> ToolDefinition {
        ToolDefinition::from_tool(Arc::new(EchoTool))
    }

    fn count_list_changed(service: &McpService) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        service.subscribe(notifications::TOOLS_LIST_CHANGED, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[tokio::test]
    async fn test_echo_end_to_end() {
        let service = unlimited_service();
        service.register_tool(echo_definition()).unwrap();

        let listing = serde_json::to_value(service.list_tools()).unwrap();
        let tools = listing["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo");
        assert!(tools[0].get("handler").is_none());

        let cx = CallContext::new();
        let result = service
            .call_tool(&cx, "echo", Bytes::from_static(br#"{"message":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(result).unwrap(),
            json!({"content": [{"type": "text", "text": "hi"}]})
        );

        let err = service
            .call_tool(&cx, "missing", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_handler_failure_vs_error_result() {
        let service = unlimited_service();
        service
            .register_tool(
                ToolDefinition::new("broken", "", json!({"type": "object"}))
                    .with_handler(|_| async { Err(anyhow::anyhow!("disk on fire")) }),
            )
            .unwrap();
        service
            .register_tool(
                ToolDefinition::new("grumpy", "", json!({"type": "object"}))
                    .with_handler(|_| async { Ok(CallToolResult::error("no thanks")) }),
            )
            .unwrap();

        let cx = CallContext::new();
        let err = service
            .call_tool(&cx, "broken", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::HandlerFailure { ref tool, .. } if tool == "broken"));

        let result = service
            .call_tool(&cx, "grumpy", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[test]
    fn test_register_announces_only_when_negotiated() {
        let service = unlimited_service();
        let count = count_list_changed(&service);

        service.register_tool(echo_definition()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        service.update_capabilities(|caps| caps.tools_list_changed = false);
        service
            .register_tool(
                ToolDefinition::new("quiet", "", json!({"type": "object"}))
                    .with_handler(|_| async { Ok(CallToolResult::text("")) }),
            )
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        service.set_capabilities(ServerCapabilities::tools_only());
        service.notify_list_changed("tools").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registration_survives_failing_subscriber() {
        let service = unlimited_service();
        service.subscribe(notifications::TOOLS_LIST_CHANGED, |_, _| {
            anyhow::bail!("subscriber gone")
        });

        service.register_tool(echo_definition()).unwrap();
        assert!(service.lookup_tool("echo").is_ok());

        let err = service.register_tool(echo_definition()).unwrap_err();
        assert!(matches!(err, McpError::DuplicateName(_)));
    }

    #[test]
    fn test_initialize_advertises_configured_capabilities() {
        let service = McpService::builder()
            .name("test-server")
            .version("1.0.0")
            .instructions("Say hi")
            .rate_limits(RateLimitConfig::unlimited())
            .build()
            .unwrap();

        let result = service.initialize(
            Implementation::new("test-client", "0.1"),
            ClientCapabilities {
                sampling: true,
                ..ClientCapabilities::default()
            },
        );

        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "test-server", "version": "1.0.0"},
                "instructions": "Say hi"
            })
        );
        assert_eq!(
            service.client_info(),
            Some(Implementation::new("test-client", "0.1"))
        );
        assert!(service.client_capabilities().unwrap().sampling);
        assert!(!service.is_initialized());

        service.handle_notification(notifications::INITIALIZED, None);
        assert!(service.is_initialized());
    }

    #[tokio::test]
    async fn test_router_accepts_aliases() {
        let service = unlimited_service();
        service.register_tool(echo_definition()).unwrap();
        let cx = CallContext::new();

        let init = service
            .handle(
                &cx,
                "Initialize",
                Some(json!({
                    "protocolVersion": "1999-01-01",
                    "clientInfo": {"name": "c", "version": "1"}
                })),
            )
            .await
            .unwrap();
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);

        let listing = service.handle(&cx, "MCP.ListTools", None).await.unwrap();
        assert_eq!(listing["tools"][0]["name"], "echo");
        assert!(listing.get("nextCursor").is_none());

        let result = service
            .handle(
                &cx,
                "tools/call",
                Some(json!({"name": "echo", "arguments": {"message": "routed"}})),
            )
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "routed");

        assert_eq!(service.handle(&cx, "ping", None).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_router_errors() {
        let service = unlimited_service();
        let cx = CallContext::new();

        let err = service.handle(&cx, "resources/read", None).await.unwrap_err();
        assert!(matches!(err, McpError::MethodNotFound(_)));

        let err = service
            .handle(&cx, "tools/call", Some(json!({"arguments": {}})))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidParams(_)));

        let err = service
            .handle(&cx, "CallTool", Some(json!({"name": "missing"})))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_method_tier_shared_by_aliases() {
        let service = McpService::builder()
            .rate_limits(RateLimitConfig::unlimited().with_method_limit("tools/list", 1.0, 1))
            .build()
            .unwrap();

        service
            .handle(&CallContext::new(), "ListTools", None)
            .await
            .unwrap();

        let cx = CallContext::with_timeout(Duration::from_millis(100));
        let err = service.handle(&cx, "tools/list", None).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::RateLimited(RateLimitError::DeadlineExceeded { .. })
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let cx = CallContext::with_timeout(Duration::from_millis(100));
        assert!(service.handle(&cx, "tools/list", None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_tier_gates_calls() {
        let service = McpService::builder()
            .rate_limits(RateLimitConfig::unlimited().with_tool_limit("echo", 1.0, 1))
            .build()
            .unwrap();
        service.register_tool(echo_definition()).unwrap();
        let args = Bytes::from_static(br#"{"message":"x"}"#);

        service
            .call_tool(&CallContext::new(), "echo", args.clone())
            .await
            .unwrap();

        let cx = CallContext::new();
        cx.cancel();
        let err = service.call_tool(&cx, "echo", args.clone()).await.unwrap_err();
        assert!(matches!(err, McpError::RateLimited(RateLimitError::Cancelled)));

        // A later call blocks until the token accrues
        let started = tokio::time::Instant::now();
        service
            .call_tool(&CallContext::new(), "echo", args)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_invalid_rate_limits_rejected_at_build() {
        let result = McpService::builder()
            .rate_limits(RateLimitConfig::default().with_tool_limit("echo", -1.0, 1))
            .build();
        assert!(matches!(
            result,
            Err(McpError::RateLimited(RateLimitError::InvalidLimit { .. }))
        ));
    }
}
