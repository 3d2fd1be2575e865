// MCP protocol types and definitions (JSON-RPC 2.0 over stdio)

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Protocol version this server speaks. Reported verbatim in every
/// handshake reply.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(
        id: impl Into<serde_json::Value>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: impl Into<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<serde_json::Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server-defined: the call was refused by a rate limit tier
    pub const RATE_LIMITED: i32 = -32000;

    pub fn parse_error() -> Self {
        Self::custom(Self::PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::custom(Self::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::custom(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::custom(Self::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::custom(Self::INTERNAL_ERROR, message)
    }

    pub fn custom(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// RPC methods this service answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Initialize,
    Ping,
    ListTools,
    CallTool,
}

impl Method {
    /// Resolve a method name. Accepts the MCP wire names as well as the
    /// service-style `Initialize`/`ListTools`/`CallTool` names, optionally
    /// prefixed with `MCP.`. Matching is case-sensitive.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.strip_prefix("MCP.").unwrap_or(name);
        match name {
            "initialize" | "Initialize" => Some(Self::Initialize),
            "ping" | "Ping" => Some(Self::Ping),
            "tools/list" | "ListTools" => Some(Self::ListTools),
            "tools/call" | "CallTool" => Some(Self::CallTool),
            _ => None,
        }
    }

    /// Canonical wire name, also the key used by the method rate limit tier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Ping => "ping",
            Self::ListTools => "tools/list",
            Self::CallTool => "tools/call",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification method identifiers
pub mod notifications {
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
    pub const PROGRESS: &str = "notifications/progress";
    pub const MESSAGE: &str = "notifications/message";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const INITIALIZED: &str = "notifications/initialized";

    /// Every notification the server may push to a peer
    pub const SERVER_SENT: [&str; 7] = [
        TOOLS_LIST_CHANGED,
        RESOURCES_LIST_CHANGED,
        PROMPTS_LIST_CHANGED,
        ROOTS_LIST_CHANGED,
        PROGRESS,
        MESSAGE,
        CANCELLED,
    ];
}

/// Name and version of a protocol participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Features the server advertises during the handshake.
///
/// Flat flags in memory; on the wire each family becomes an object such as
/// `{"tools": {"listChanged": true}}`, present only when enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireServerCapabilities", into = "WireServerCapabilities")]
pub struct ServerCapabilities {
    pub tools: bool,
    pub tools_list_changed: bool,
    pub resources: bool,
    pub resources_list_changed: bool,
    pub prompts: bool,
    pub prompts_list_changed: bool,
    pub roots_list_changed: bool,
    pub logging: bool,
    pub experimental: Option<serde_json::Value>,
}

impl ServerCapabilities {
    /// Tools with list change notifications, nothing else
    pub fn tools_only() -> Self {
        Self {
            tools: true,
            tools_list_changed: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ListChangedCapability {
    #[serde(rename = "listChanged", default)]
    list_changed: bool,
}

fn family(present: bool, list_changed: bool) -> Option<ListChangedCapability> {
    (present || list_changed).then_some(ListChangedCapability { list_changed })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    experimental: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logging: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tools: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resources: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompts: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    roots: Option<ListChangedCapability>,
}

impl From<WireServerCapabilities> for ServerCapabilities {
    fn from(wire: WireServerCapabilities) -> Self {
        let flag = |cap: &Option<ListChangedCapability>| {
            cap.as_ref().map(|c| c.list_changed).unwrap_or(false)
        };
        Self {
            tools: wire.tools.is_some(),
            tools_list_changed: flag(&wire.tools),
            resources: wire.resources.is_some(),
            resources_list_changed: flag(&wire.resources),
            prompts: wire.prompts.is_some(),
            prompts_list_changed: flag(&wire.prompts),
            roots_list_changed: flag(&wire.roots),
            logging: wire.logging.is_some(),
            experimental: wire.experimental,
        }
    }
}

impl From<ServerCapabilities> for WireServerCapabilities {
    fn from(caps: ServerCapabilities) -> Self {
        Self {
            experimental: caps.experimental,
            logging: caps.logging.then(|| serde_json::json!({})),
            tools: family(caps.tools, caps.tools_list_changed),
            resources: family(caps.resources, caps.resources_list_changed),
            prompts: family(caps.prompts, caps.prompts_list_changed),
            roots: family(false, caps.roots_list_changed),
        }
    }
}

/// Features the client declares during the handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireClientCapabilities", into = "WireClientCapabilities")]
pub struct ClientCapabilities {
    pub sampling: bool,
    pub roots: bool,
    pub roots_list_changed: bool,
    pub experimental: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    experimental: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sampling: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    roots: Option<ListChangedCapability>,
}

impl From<WireClientCapabilities> for ClientCapabilities {
    fn from(wire: WireClientCapabilities) -> Self {
        Self {
            // `"sampling": null` is absent, `{}` is present
            sampling: wire.sampling.map(|v| !v.is_null()).unwrap_or(false),
            roots: wire.roots.is_some(),
            roots_list_changed: wire.roots.map(|r| r.list_changed).unwrap_or(false),
            experimental: wire.experimental,
        }
    }
}

impl From<ClientCapabilities> for WireClientCapabilities {
    fn from(caps: ClientCapabilities) -> Self {
        Self {
            experimental: caps.experimental,
            sampling: caps.sampling.then(|| serde_json::json!({})),
            roots: family(caps.roots, caps.roots_list_changed),
        }
    }
}

/// Initialize request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

/// Initialize response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// MCP-specific protocol messages

/// Tool definition for MCP. Descriptive metadata only; handlers never
/// appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// List tools request params
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// List tools response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<ToolSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Call tool request params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// Call tool response.
///
/// `is_error` marks a failure the tool reports as data. Protocol-level
/// failures never produce a `CallToolResult`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(alias = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            ..Self::default()
        }
    }

    /// A tool-level failure, reported as a successful result with
    /// `isError` set
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::error(message)],
            is_error: true,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Displayable tool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        /// Base64-encoded bytes
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "audio")]
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Text {
            text: format!("Error: {}", text.into()),
        }
    }

    pub fn image(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    pub fn audio(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self::Audio {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Self::Text { .. } => None,
            Self::Image { mime_type, .. } | Self::Audio { mime_type, .. } => Some(mime_type),
        }
    }

    /// Decoded binary payload of an image or audio block
    pub fn binary_data(&self) -> Option<Vec<u8>> {
        match self {
            Self::Text { .. } => None,
            Self::Image { data, .. } | Self::Audio { data, .. } => {
                base64::engine::general_purpose::STANDARD.decode(data).ok()
            }
        }
    }
}

/// Log severity (RFC 5424)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// Opaque token correlating progress notifications with a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    String(String),
    Number(i64),
}

impl From<&str> for ProgressToken {
    fn from(token: &str) -> Self {
        Self::String(token.to_string())
    }
}

impl From<String> for ProgressToken {
    fn from(token: String) -> Self {
        Self::String(token)
    }
}

impl From<i64> for ProgressToken {
    fn from(token: i64) -> Self {
        Self::Number(token)
    }
}

/// `notifications/progress` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

/// `notifications/message` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingMessageParams {
    pub level: LoggingLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: serde_json::Value,
}

/// `notifications/cancelled` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
