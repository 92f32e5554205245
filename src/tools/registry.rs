//! Name → tool lookup and invocation

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::{Error, Result};

/// A callable the model can request by name
pub trait Tool: Send + Sync {
    /// Name the model uses to call the tool
    fn name(&self) -> &str;

    /// One-line description shown to the model
    fn description(&self) -> &str;

    /// JSON schema of the arguments object
    fn parameters(&self) -> serde_json::Value;

    /// Run the tool
    ///
    /// # Errors
    ///
    /// Returns error if the arguments are invalid or the tool fails
    fn call(&self, arguments: &serde_json::Value) -> Result<String>;
}

/// Tool schema in the chat-completions `function` shape
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Result of one tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Ok(String),
    Error(String),
}

/// A completed tool call, scoped to one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: String,
    pub result: ToolOutcome,
}

impl ToolInvocation {
    /// Whether the call failed
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.result, ToolOutcome::Error(_))
    }

    /// Text fed back to the model as the tool message
    #[must_use]
    pub fn content(&self) -> String {
        match &self.result {
            ToolOutcome::Ok(text) => text.clone(),
            ToolOutcome::Error(message) => format!("error: {message}"),
        }
    }
}

/// Registered tools, iterated in name order
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool replaced");
        }
    }

    /// Builder-style [`Self::register`]
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Look up a tool by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas for every registered tool
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Invoke `name` with the raw JSON argument string from the model
    ///
    /// Never fails: unknown tools, unparseable arguments and tool errors
    /// all come back as [`ToolOutcome::Error`]. An empty argument string is
    /// treated as `{}`.
    #[must_use]
    pub fn invoke(&self, name: &str, raw_arguments: &str) -> ToolInvocation {
        let result = match self.try_invoke(name, raw_arguments) {
            Ok(text) => ToolOutcome::Ok(text),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool call failed");
                ToolOutcome::Error(e.to_string())
            }
        };

        ToolInvocation {
            name: name.to_string(),
            arguments: raw_arguments.to_string(),
            result,
        }
    }

    fn try_invoke(&self, name: &str, raw_arguments: &str) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::Tool(format!("unknown tool: {name}")))?;

        let arguments = if raw_arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(raw_arguments)
                .map_err(|e| Error::Tool(format!("invalid arguments for {name}: {e}")))?
        };

        tracing::debug!(tool = name, arguments = %arguments, "invoking tool");
        tool.call(&arguments)
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
