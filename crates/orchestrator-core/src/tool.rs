//! A concurrent registry of named tool handlers.
//!
//! Handlers are plain closures with no ownership relationship to the
//! registry -- registering, unregistering, and dispatching can all race
//! each other safely; a dispatch that races a registration observes either
//! the pre- or post-state for that name, never a torn value.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use orchestrator_types::tool::ToolResult;

/// A registered tool: given opaque argument text and a cancellation token,
/// produces a `ToolResult`. The registry never parses `args` itself.
pub type ToolHandler = Arc<
    dyn Fn(String, CancellationToken) -> Pin<Box<dyn Future<Output = ToolResult> + Send>>
        + Send
        + Sync,
>;

/// A concurrent map from tool name to handler.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: DashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Insert or replace the handler registered under `name`.
    pub fn register_tool(&self, name: impl Into<String>, handler: ToolHandler) {
        self.handlers.insert(name.into(), handler);
    }

    /// Remove the handler registered under `name`. Returns `true` if a
    /// handler was present.
    pub fn unregister_tool(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn registered_tools(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<ToolHandler> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }
}
