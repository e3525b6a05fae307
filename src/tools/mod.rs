//! Host-side tool seams.
//!
//! The catalogue of tools and their implementations live outside this crate.
//! Executions only see them through [`ToolCatalog`] (what can be called) and
//! [`ToolDispatcher`] (how a call is carried out).

mod command;

pub use command::CommandDispatcher;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ToolError;

/// A named host capability callable from guest scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique name, also the guest-callable identifier
    pub name: String,
    pub description: String,
    /// JSON-Schema-like object describing the call's params
    #[serde(rename = "parameterSchema", alias = "parameters", default)]
    pub parameter_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema: schema,
        }
    }
}

/// Result of one dispatched tool call.
///
/// `content` is a sequence of typed blocks (`{"type": "text", "text": ...}`
/// and friends) and is forwarded to the guest untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text_block(text)],
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// Concatenated text of all `text` blocks.
    #[cfg(test)]
    pub(crate) fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect()
    }
}

pub fn text_block(text: impl Into<String>) -> Value {
    json!({ "type": "text", "text": text.into() })
}

/// Provides the current tool list. Called once per execution.
pub trait ToolCatalog: Send + Sync {
    fn snapshot(&self) -> Vec<ToolDescriptor>;
}

/// Carries out a tool call on the host.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, name: &str, params: Value) -> Result<ToolOutput, ToolError>;
}

/// Fixed catalogue.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tools: Vec<ToolDescriptor>,
}

impl StaticCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }
}

impl ToolCatalog for StaticCatalog {
    fn snapshot(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }
}

/// Catalogue that can change while executions are in flight.
///
/// Running executions keep the snapshot they started with.
#[derive(Debug, Default)]
pub struct SharedCatalog {
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl SharedCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools: RwLock::new(tools),
        }
    }

    /// Add or replace a tool by name.
    pub fn register(&self, tool: ToolDescriptor) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        match tools.iter_mut().find(|t| t.name == tool.name) {
            Some(existing) => *existing = tool,
            None => tools.push(tool),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        let before = tools.len();
        tools.retain(|t| t.name != name);
        tools.len() != before
    }
}

impl ToolCatalog for SharedCatalog {
    fn snapshot(&self) -> Vec<ToolDescriptor> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

type ToolFn = Arc<dyn Fn(Value) -> Result<ToolOutput, ToolError> + Send + Sync>;

/// Dispatcher over in-process closures, keyed by tool name.
#[derive(Default, Clone)]
pub struct FnDispatcher {
    handlers: HashMap<String, ToolFn>,
}

impl FnDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Result<ToolOutput, ToolError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }
}

#[async_trait]
impl ToolDispatcher for FnDispatcher {
    async fn dispatch(&self, name: &str, params: Value) -> Result<ToolOutput, ToolError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| ToolError::new(format!("no handler registered for '{name}'")))?;
        handler(params)
    }
}
