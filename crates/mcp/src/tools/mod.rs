pub mod echo;
pub mod read_file;
mod registry;

pub use echo::EchoTool;
pub use read_file::ReadFileTool;
pub use registry::{
    json_schema_number, json_schema_object, json_schema_string, parse_arguments, Tool,
    ToolDefinition, ToolHandler, ToolRegistry,
};
