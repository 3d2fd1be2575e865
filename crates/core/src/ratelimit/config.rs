// Rate limit configuration

use super::RateLimitError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key matching every method or tool without an entry of its own
pub const WILDCARD: &str = "*";

/// Rate limit settings for the global, method and tool tiers.
///
/// A method or tool listed in an `*_rps` map without a matching `*_burst`
/// entry gets a burst of zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Global requests per second
    pub global_rps: f64,
    /// Burst size for the global limit
    pub global_burst: u32,
    /// Per-method requests per second, keyed by RPC method name
    pub method_rps: HashMap<String, f64>,
    /// Per-method burst sizes
    pub method_burst: HashMap<String, u32>,
    /// Per-tool requests per second, keyed by tool name or `*`
    pub tool_rps: HashMap<String, f64>,
    /// Per-tool burst sizes
    pub tool_burst: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let methods = [
            ("resources/read", 20.0, 10),
            ("resources/list", 10.0, 5),
            ("tools/call", 5.0, 3),
            ("completion/complete", 10.0, 5),
        ];

        Self {
            global_rps: 100.0,
            global_burst: 50,
            method_rps: methods
                .iter()
                .map(|(method, rps, _)| (method.to_string(), *rps))
                .collect(),
            method_burst: methods
                .iter()
                .map(|(method, _, burst)| (method.to_string(), *burst))
                .collect(),
            tool_rps: HashMap::from([(WILDCARD.to_string(), 2.0)]),
            tool_burst: HashMap::from([(WILDCARD.to_string(), 1)]),
        }
    }
}

impl RateLimitConfig {
    /// No limits at all: the global tier admits everything and the method
    /// and tool tiers are empty.
    pub fn unlimited() -> Self {
        Self {
            global_rps: f64::INFINITY,
            global_burst: 0,
            method_rps: HashMap::new(),
            method_burst: HashMap::new(),
            tool_rps: HashMap::new(),
            tool_burst: HashMap::new(),
        }
    }

    pub fn with_method_limit(mut self, method: impl Into<String>, rps: f64, burst: u32) -> Self {
        let method = method.into();
        self.method_rps.insert(method.clone(), rps);
        self.method_burst.insert(method, burst);
        self
    }

    pub fn with_tool_limit(mut self, tool: impl Into<String>, rps: f64, burst: u32) -> Self {
        let tool = tool.into();
        self.tool_rps.insert(tool.clone(), rps);
        self.tool_burst.insert(tool, burst);
        self
    }

    /// Reject negative or NaN rates
    pub fn validate(&self) -> Result<(), RateLimitError> {
        check_rate("global", self.global_rps)?;
        for (method, rps) in &self.method_rps {
            check_rate(&format!("method {}", method), *rps)?;
        }
        for (tool, rps) in &self.tool_rps {
            check_rate(&format!("tool {}", tool), *rps)?;
        }
        Ok(())
    }

    pub(crate) fn method_limits(&self) -> impl Iterator<Item = (&str, f64, u32)> {
        self.method_rps.iter().map(|(method, rps)| {
            let burst = self.method_burst.get(method).copied().unwrap_or(0);
            (method.as_str(), *rps, burst)
        })
    }

    pub(crate) fn tool_limits(&self) -> impl Iterator<Item = (&str, f64, u32)> {
        self.tool_rps.iter().map(|(tool, rps)| {
            let burst = self.tool_burst.get(tool).copied().unwrap_or(0);
            (tool.as_str(), *rps, burst)
        })
    }
}

fn check_rate(scope: &str, rps: f64) -> Result<(), RateLimitError> {
    if rps.is_nan() || rps < 0.0 {
        return Err(RateLimitError::InvalidLimit {
            scope: scope.to_string(),
            rps,
        });
    }
    Ok(())
}
