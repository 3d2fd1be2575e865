// Tool definitions and the registry that owns them

use crate::error::{McpError, McpResult};
use crate::protocol::{CallToolResult, ToolSchema};
use anyhow::Result;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Invocable half of a tool: raw JSON argument bytes in, result out
pub type ToolHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<CallToolResult>> + Send + Sync>;

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool schema for MCP
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with the raw JSON arguments of a call.
    ///
    /// Argument problems should come back as `CallToolResult::error`; an
    /// `Err` here is reported to the caller as a protocol failure.
    async fn execute(&self, arguments: Bytes) -> Result<CallToolResult>;
}

/// A tool as submitted for registration
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    handler: Option<ToolHandler>,
}

impl ToolDefinition {
    /// A definition with no handler yet; see `with_handler`
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: None,
        }
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
    {
        let handler: ToolHandler = Arc::new(move |arguments| handler(arguments).boxed());
        self.handler = Some(handler);
        self
    }

    /// Wrap a `Tool` implementation
    pub fn from_tool(tool: Arc<dyn Tool>) -> Self {
        let schema = tool.schema();
        let handler: ToolHandler = Arc::new(move |arguments| {
            let tool = tool.clone();
            async move { tool.execute(arguments).await }.boxed()
        });

        Self {
            name: schema.name,
            description: schema.description,
            input_schema: schema.input_schema,
            handler: Some(handler),
        }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("has_handler", &self.has_handler())
            .finish()
    }
}

/// Schema and handler together, so a registered tool is never observable
/// without its handler.
struct RegisteredTool {
    schema: ToolSchema,
    handler: ToolHandler,
}

/// Tool registry for managing available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique and registrations are final.
    pub fn register(&self, definition: ToolDefinition) -> McpResult<()> {
        if definition.name.is_empty() {
            return Err(McpError::InvalidTool("tool name required".to_string()));
        }
        let Some(handler) = definition.handler.clone() else {
            return Err(McpError::InvalidTool(format!(
                "tool {:?} has no handler",
                definition.name
            )));
        };

        let mut tools = self.tools.write();
        if tools.contains_key(&definition.name) {
            return Err(McpError::DuplicateName(definition.name));
        }

        let schema = definition.schema();
        tools.insert(definition.name, RegisteredTool { schema, handler });
        Ok(())
    }

    /// Descriptive metadata for a tool
    pub fn lookup(&self, name: &str) -> McpResult<ToolSchema> {
        self.tools
            .read()
            .get(name)
            .map(|tool| tool.schema.clone())
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))
    }

    pub(crate) fn handler(&self, name: &str) -> McpResult<ToolHandler> {
        self.tools
            .read()
            .get(name)
            .map(|tool| tool.handler.clone())
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))
    }

    /// Snapshot of all tool schemas, sorted by name
    pub fn list(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<_> = self
            .tools
            .read()
            .values()
            .map(|tool| tool.schema.clone())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

/// Decode call arguments, turning a decode failure into a tool-level error
/// result.
pub fn parse_arguments<T: DeserializeOwned>(
    tool: &str,
    arguments: &[u8],
) -> std::result::Result<T, CallToolResult> {
    serde_json::from_slice(arguments)
        .map_err(|err| CallToolResult::error(format!("Invalid arguments for {}: {}", tool, err)))
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: serde_json::Value, required: Vec<&str>) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_number(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "number",
        "description": description
    })
}
