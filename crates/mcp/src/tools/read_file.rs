// File reading tool confined to a set of allowed directories

use crate::protocol::{CallToolResult, ContentBlock, ToolSchema};
use crate::tools::{json_schema_number, json_schema_object, json_schema_string, parse_arguments, Tool};
use anyhow::Result;
use bytes::Bytes;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

/// Files larger than this are truncated unless the call asks for less
const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// Name fragments that are never served, even inside an allowed directory
const DENY_PATTERNS: [&str; 8] = [
    ".env",
    "credentials",
    "id_rsa",
    "id_ed25519",
    ".pem",
    ".key",
    "secrets",
    ".git/config",
];

/// Tool to read files under one or more allowed directories
pub struct ReadFileTool {
    roots: Vec<PathBuf>,
}

impl ReadFileTool {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve a requested path to a canonical path inside an allowed root.
    /// Relative paths are taken relative to the first root.
    ///
    /// The deny list is applied to the resolved path below its root, so a
    /// symlink cannot smuggle a secret file out and a root whose own name
    /// matches a pattern still serves its files.
    fn resolve(&self, requested: &str) -> Option<PathBuf> {
        let requested = Path::new(requested);
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.roots.first()?.join(requested)
        };

        let canonical = candidate.canonicalize().ok()?;
        let relative = self
            .roots
            .iter()
            .filter_map(|root| root.canonicalize().ok())
            .find_map(|root| canonical.strip_prefix(&root).ok().map(Path::to_path_buf))?;

        if is_denied(&relative) {
            return None;
        }
        Some(canonical)
    }
}

fn is_denied(relative: &Path) -> bool {
    let lowered = relative.to_string_lossy().to_lowercase();
    DENY_PATTERNS.iter().any(|pattern| lowered.contains(pattern))
}

/// Decode a possibly truncated prefix. Backs off to the last whole
/// character when truncation split one; any other invalid byte makes the
/// content binary.
fn decode_text(bytes: Vec<u8>, truncated: bool) -> Option<String> {
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(err) => {
            let utf8 = err.utf8_error();
            if !truncated || utf8.error_len().is_some() {
                return None;
            }
            let mut bytes = err.into_bytes();
            bytes.truncate(utf8.valid_up_to());
            String::from_utf8(bytes).ok()
        }
    }
}

async fn read_prefix(path: &Path, max_bytes: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len() as usize;

    // One byte over the limit tells truncation apart from an exact fit
    let mut bytes = Vec::new();
    file.take((max_bytes as u64).saturating_add(1)).read_to_end(&mut bytes).await?;
    let total = size.max(bytes.len());
    Ok((bytes, total))
}

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
    #[serde(default)]
    max_bytes: Option<usize>,
}

fn image_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read_file".to_string(),
            description: "Read the contents of a file inside the server's allowed directories. \
                Images are returned as image content; secret files are never served."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "path": json_schema_string("Path to the file, absolute or relative to the first allowed directory"),
                    "max_bytes": json_schema_number("Maximum number of bytes to return (default: 1 MiB)")
                }),
                vec!["path"],
            ),
        }
    }

    async fn execute(&self, arguments: Bytes) -> Result<CallToolResult> {
        let args: ReadFileArgs = match parse_arguments("read_file", &arguments) {
            Ok(args) => args,
            Err(result) => return Ok(result),
        };

        let Some(path) = self.resolve(&args.path) else {
            return Ok(CallToolResult::error(format!(
                "Access denied: {} is outside the allowed directories, missing, or a secret file",
                args.path
            )));
        };

        if path.is_dir() {
            return Ok(CallToolResult::error(format!("{} is a directory", args.path)));
        }

        if let Some(mime_type) = image_mime_type(&path) {
            return Ok(match tokio::fs::read(&path).await {
                Ok(bytes) => CallToolResult {
                    content: vec![ContentBlock::image(&bytes, mime_type)],
                    ..CallToolResult::default()
                },
                Err(e) => CallToolResult::error(format!("Failed to read file: {}", e)),
            });
        }

        let max_bytes = args.max_bytes.unwrap_or(DEFAULT_MAX_BYTES);
        let (mut bytes, total) = match read_prefix(&path, max_bytes).await {
            Ok(read) => read,
            Err(e) => {
                return Ok(CallToolResult::error(format!("Failed to read file: {}", e)));
            }
        };
        let truncated = bytes.len() > max_bytes;
        bytes.truncate(max_bytes);

        match decode_text(bytes, truncated) {
            Some(text) => {
                let result = CallToolResult::text(text);
                Ok(if truncated {
                    result.with_meta(serde_json::json!({ "truncated": true, "totalBytes": total }))
                } else {
                    result
                })
            }
            None => Ok(CallToolResult::text(format!(
                "File: {} (binary, {} bytes)\n\nBinary files cannot be displayed as text.",
                args.path, total
            ))),
        }
    }
}
