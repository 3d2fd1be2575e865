// Server configuration loaded from TOML

use crate::protocol::ServerCapabilities;
use crate::service::McpServiceBuilder;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toolgate_core::RateLimitConfig;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "TOOLGATE_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "toolgate.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub capabilities: CapabilitiesConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub instructions: Option<String>,
}

fn default_name() -> String {
    "toolgate".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            instructions: None,
        }
    }
}

/// Advertised capabilities. Tools are always offered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    #[serde(default = "default_true")]
    pub tools_list_changed: bool,

    #[serde(default)]
    pub resources_list_changed: bool,

    #[serde(default)]
    pub prompts_list_changed: bool,

    #[serde(default)]
    pub roots_list_changed: bool,

    #[serde(default)]
    pub logging: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            tools_list_changed: true,
            resources_list_changed: false,
            prompts_list_changed: false,
            roots_list_changed: false,
            logging: false,
        }
    }
}

impl From<&CapabilitiesConfig> for ServerCapabilities {
    fn from(config: &CapabilitiesConfig) -> Self {
        Self {
            tools: true,
            tools_list_changed: config.tools_list_changed,
            resources: config.resources_list_changed,
            resources_list_changed: config.resources_list_changed,
            prompts: config.prompts_list_changed,
            prompts_list_changed: config.prompts_list_changed,
            roots_list_changed: config.roots_list_changed,
            logging: config.logging,
            experimental: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Directories `read_file` may serve from. Empty means the current
    /// working directory.
    #[serde(default)]
    pub allowed_directories: Vec<PathBuf>,
}

impl McpConfig {
    /// Load from `TOOLGATE_CONFIG`, or `toolgate.toml` when unset
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path)
    }

    /// Load config file if it exists, otherwise use defaults
    pub fn load(config_path: &Path) -> Result<Self> {
        let config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!(
                "Configuration file {} not found, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config
            .rate_limits
            .validate()
            .context("Invalid rate limit configuration")?;

        Ok(config)
    }

    pub fn server_capabilities(&self) -> ServerCapabilities {
        ServerCapabilities::from(&self.capabilities)
    }

    /// Roots for the file tool, falling back to the current directory
    pub fn allowed_directories(&self) -> Result<Vec<PathBuf>> {
        if self.tools.allowed_directories.is_empty() {
            let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
            Ok(vec![cwd])
        } else {
            Ok(self.tools.allowed_directories.clone())
        }
    }

    /// Service builder carrying this configuration
    pub fn service_builder(&self) -> McpServiceBuilder {
        let builder = McpServiceBuilder::default()
            .name(&self.server.name)
            .version(&self.server.version)
            .capabilities(self.server_capabilities())
            .rate_limits(self.rate_limits.clone());

        match &self.server.instructions {
            Some(instructions) => builder.instructions(instructions),
            None => builder,
        }
    }
}
