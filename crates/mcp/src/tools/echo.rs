// Echo tool, returns its input message

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_object, json_schema_string, parse_arguments, Tool};
use anyhow::Result;
use bytes::Bytes;
use serde::Deserialize;

pub struct EchoTool;

#[derive(Debug, Deserialize)]
struct EchoArgs {
    message: String,
}

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "echo".to_string(),
            description: "Echo the input message back as text".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "message": json_schema_string("The message to echo")
                }),
                vec!["message"],
            ),
        }
    }

    async fn execute(&self, arguments: Bytes) -> Result<CallToolResult> {
        let args: EchoArgs = match parse_arguments("echo", &arguments) {
            Ok(args) => args,
            Err(result) => return Ok(result),
        };

        Ok(CallToolResult::text(args.message))
    }
}
