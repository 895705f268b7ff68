//! The result shape produced by a registered tool handler.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The outcome of dispatching a single named tool call.
///
/// A tool handler never returns a raw error to its caller -- failures
/// (including "no such tool") are represented as `ToolResult { ok: false,
/// .. }` so that `Orchestrator::dispatch_parallel` can always produce one
/// entry per submitted call, regardless of whether the tool existed or
/// succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub content: Option<String>,
    pub error: Option<String>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: Some(content.into()),
            error: None,
            metadata: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
