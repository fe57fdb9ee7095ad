//! Language-model backend boundary.
//!
//! The runner talks to the model only through the [`Backend`] trait: it sends
//! the active agent's instructions, the conversation so far, and the tools and
//! handoff targets the agent may use, and receives exactly one
//! [`ModelResponse`] back. [`ChatCompletionsClient`] is the bundled
//! implementation for OpenAI-compatible endpoints.

mod error;
mod openai;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use openai::{handoff_tool_name, ChatCompletionsClient, HANDOFF_TOOL_PREFIX};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Calls requested by an assistant turn (tool or handoff).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` messages, the id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a plain text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant turn that requested a call and produced no text.
    pub fn assistant_call(call: ToolCall) -> Self {
        Message {
            tool_calls: vec![call],
            ..Self::new(Role::Assistant, "")
        }
    }

    /// The answer to a tool or handoff call.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// A call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        ToolCall {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.to_string(),
            },
        }
    }
}

/// Function call details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string. May be empty for no-argument functions.
    #[serde(default)]
    pub arguments: String,
}

/// Tool definition for the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function definition with schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A handoff target offered to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffDefinition {
    pub agent_name: String,
    pub description: String,
}

/// Everything the backend needs for one model step.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub agent_name: &'a str,
    pub instructions: &'a str,
    pub history: &'a [Message],
    pub tools: &'a [ToolDefinition],
    pub handoffs: &'a [HandoffDefinition],
}

/// What the model decided to do in one step.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    /// Final textual answer; ends the run.
    FinalOutput(String),
    /// Invoke a tool of the active agent.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Transfer control to another agent by name.
    Handoff { id: String, target: String },
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// The language-model inference provider.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one model step.
    async fn step(&self, request: ModelRequest<'_>) -> Result<ModelResponse, LlmError>;
}
