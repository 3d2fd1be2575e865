// Hierarchical rate limiting: global, per-method and per-tool tiers

mod bucket;
mod config;

pub use bucket::TokenBucket;
pub use config::{RateLimitConfig, WILDCARD};

use crate::context::CallContext;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Reasons an admission attempt fails
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// The caller cancelled while waiting for a token
    #[error("rate limit wait cancelled")]
    Cancelled,

    /// The next token would accrue only after the caller's deadline
    #[error("rate limit wait of {wait:?} would exceed the deadline")]
    DeadlineExceeded { wait: Duration },

    /// The bucket has no burst, or no refill and no tokens left
    #[error("rate limit exhausted")]
    Exhausted,

    /// A configured rate is negative or not a number
    #[error("invalid rate limit for {scope}: {rps}")]
    InvalidLimit { scope: String, rps: f64 },
}

/// Rate limiter for a protocol service.
///
/// The global bucket gates every inbound call; method buckets are consulted
/// only for methods that have one. Tool buckets are an independent gate used
/// for tool invocations and never touch the global bucket.
pub struct RateLimiter {
    global: Arc<TokenBucket>,
    methods: RwLock<HashMap<String, Arc<TokenBucket>>>,
    tools: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let methods = config
            .method_limits()
            .map(|(method, rps, burst)| (method.to_string(), Arc::new(TokenBucket::new(rps, burst))))
            .collect();

        let tools = config
            .tool_limits()
            .map(|(tool, rps, burst)| (tool.to_string(), Arc::new(TokenBucket::new(rps, burst))))
            .collect();

        Self {
            global: Arc::new(TokenBucket::new(config.global_rps, config.global_burst)),
            methods: RwLock::new(methods),
            tools: RwLock::new(tools),
        }
    }

    /// Admit an inbound call to `method`.
    ///
    /// Waits on the global bucket, then on the method bucket if one exists.
    /// The two waits are not atomic: a global token spent before a failed
    /// method wait is not returned.
    pub async fn allow(&self, cx: &CallContext, method: &str) -> Result<(), RateLimitError> {
        self.global.wait(cx).await.inspect_err(|err| {
            tracing::debug!(method, error = %err, "global rate limit rejected call");
        })?;

        let bucket = self.methods.read().get(method).cloned();
        if let Some(bucket) = bucket {
            bucket.wait(cx).await.inspect_err(|err| {
                tracing::debug!(method, error = %err, "method rate limit rejected call");
            })?;
        }

        Ok(())
    }

    /// Admit an invocation of `tool`.
    ///
    /// Uses the tool's own bucket, else the `*` bucket, else admits
    /// immediately.
    pub async fn allow_tool(&self, cx: &CallContext, tool: &str) -> Result<(), RateLimitError> {
        let bucket = {
            let tools = self.tools.read();
            tools.get(tool).or_else(|| tools.get(WILDCARD)).cloned()
        };

        match bucket {
            Some(bucket) => bucket.wait(cx).await.inspect_err(|err| {
                tracing::debug!(tool, error = %err, "tool rate limit rejected call");
            }),
            None => Ok(()),
        }
    }

    /// Replace the bucket for `method`. Calls already waiting keep the
    /// bucket they started on.
    pub fn update_method_limit(&self, method: impl Into<String>, rps: f64, burst: u32) {
        let method = method.into();
        tracing::info!("Updating rate limit for method {}: {} rps, burst {}", method, rps, burst);
        self.methods
            .write()
            .insert(method, Arc::new(TokenBucket::new(rps, burst)));
    }

    /// Replace the bucket for `tool` (or `*`). Calls already waiting keep the
    /// bucket they started on.
    pub fn update_tool_limit(&self, tool: impl Into<String>, rps: f64, burst: u32) {
        let tool = tool.into();
        tracing::info!("Updating rate limit for tool {}: {} rps, burst {}", tool, rps, burst);
        self.tools
            .write()
            .insert(tool, Arc::new(TokenBucket::new(rps, burst)));
    }

    pub fn global_limit(&self) -> (f64, u32) {
        (self.global.rate(), self.global.burst())
    }

    /// Configured `(rps, burst)` for an exact method key
    pub fn method_limit(&self, method: &str) -> Option<(f64, u32)> {
        self.methods
            .read()
            .get(method)
            .map(|bucket| (bucket.rate(), bucket.burst()))
    }

    /// Configured `(rps, burst)` for an exact tool key
    pub fn tool_limit(&self, tool: &str) -> Option<(f64, u32)> {
        self.tools
            .read()
            .get(tool)
            .map(|bucket| (bucket.rate(), bucket.burst()))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}
