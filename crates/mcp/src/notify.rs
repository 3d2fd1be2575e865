// Notification routing to in-process subscribers

use crate::error::{McpError, McpResult};
use crate::protocol::{
    notifications, CancelledParams, LoggingLevel, LoggingMessageParams, ProgressParams,
    ProgressToken, ServerCapabilities,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback invoked with the notification method and its params
pub type Subscriber =
    Arc<dyn Fn(&str, Option<&serde_json::Value>) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The four "list changed" notification families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListChangedKind {
    Tools,
    Resources,
    Prompts,
    Roots,
}

impl ListChangedKind {
    /// Accepts either the full notification method or the short family
    /// name (`"tools"`, `"resources"`, `"prompts"`, `"roots"`).
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            notifications::TOOLS_LIST_CHANGED | "tools" => Some(Self::Tools),
            notifications::RESOURCES_LIST_CHANGED | "resources" => Some(Self::Resources),
            notifications::PROMPTS_LIST_CHANGED | "prompts" => Some(Self::Prompts),
            notifications::ROOTS_LIST_CHANGED | "roots" => Some(Self::Roots),
            _ => None,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Tools => notifications::TOOLS_LIST_CHANGED,
            Self::Resources => notifications::RESOURCES_LIST_CHANGED,
            Self::Prompts => notifications::PROMPTS_LIST_CHANGED,
            Self::Roots => notifications::ROOTS_LIST_CHANGED,
        }
    }

    /// Whether the capability gating this family is set
    pub fn is_enabled(&self, caps: &ServerCapabilities) -> bool {
        match self {
            Self::Tools => caps.tools_list_changed,
            Self::Resources => caps.resources_list_changed,
            Self::Prompts => caps.prompts_list_changed,
            Self::Roots => caps.roots_list_changed,
        }
    }
}

/// Routes notifications to subscribers registered per method.
///
/// Subscribers run synchronously on the dispatching task, in registration
/// order. The first failure stops the dispatch.
#[derive(Default)]
pub struct NotificationDispatcher {
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber for `method`
    pub fn subscribe<F>(&self, method: impl Into<String>, subscriber: F) -> SubscriptionId
    where
        F: Fn(&str, Option<&serde_json::Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(method.into())
            .or_default()
            .push((id, Arc::new(subscriber)));
        id
    }

    /// Remove a subscriber. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let mut removed = false;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|(sub_id, _)| *sub_id != id);
            removed |= list.len() != before;
        }
        subscribers.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn subscriber_count(&self, method: &str) -> usize {
        self.subscribers
            .read()
            .get(method)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Invoke every subscriber of `method` in order, stopping at the first
    /// failure.
    pub fn dispatch(&self, method: &str, params: Option<serde_json::Value>) -> McpResult<()> {
        // Snapshot so subscribers may subscribe or dispatch themselves
        let subscribers: Vec<Subscriber> = match self.subscribers.read().get(method) {
            Some(list) => list.iter().map(|(_, sub)| sub.clone()).collect(),
            None => return Ok(()),
        };

        tracing::debug!(method, subscribers = subscribers.len(), "dispatching notification");

        for subscriber in subscribers {
            subscriber(method, params.as_ref()).map_err(|source| McpError::SubscriberFailure {
                method: method.to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Dispatch a list changed notification if `caps` allows it.
    ///
    /// Unknown identifiers fail with `UnsupportedNotification`. A family
    /// whose capability flag is off is a silent no-op.
    pub fn notify_list_changed(&self, method: &str, caps: &ServerCapabilities) -> McpResult<()> {
        let kind = ListChangedKind::parse(method)
            .ok_or_else(|| McpError::UnsupportedNotification(method.to_string()))?;

        if !kind.is_enabled(caps) {
            tracing::trace!(method = kind.method(), "list change notification not negotiated");
            return Ok(());
        }
        self.dispatch(kind.method(), None)
    }

    pub fn notify_progress(
        &self,
        token: impl Into<ProgressToken>,
        progress: f64,
        total: Option<f64>,
    ) -> McpResult<()> {
        let params = ProgressParams {
            progress_token: token.into(),
            progress,
            total,
        };
        self.dispatch(notifications::PROGRESS, Some(serde_json::to_value(params)?))
    }

    /// An empty `logger` is omitted from the params
    pub fn notify_logging_message(
        &self,
        level: LoggingLevel,
        logger: &str,
        data: impl Serialize,
    ) -> McpResult<()> {
        let params = LoggingMessageParams {
            level,
            logger: (!logger.is_empty()).then(|| logger.to_string()),
            data: serde_json::to_value(data)?,
        };
        self.dispatch(notifications::MESSAGE, Some(serde_json::to_value(params)?))
    }

    pub fn notify_cancelled(
        &self,
        request_id: serde_json::Value,
        reason: Option<&str>,
    ) -> McpResult<()> {
        let params = CancelledParams {
            request_id,
            reason: reason.map(str::to_string),
        };
        self.dispatch(notifications::CANCELLED, Some(serde_json::to_value(params)?))
    }
}
