//! Agent definitions.
//!
//! An agent is a named bundle of instructions, tools and handoff targets.
//! Definitions are immutable and cheap to clone; variants such as "the same
//! agent with more tools" are new values that share the instruction template.
//! Handoff targets are held by reference, so an agent can only list agents
//! that were already built.

use std::fmt;
use std::sync::Arc;

use crate::llm::{handoff_tool_name, HandoffDefinition};
use crate::tools::ToolRegistry;

/// Guidance prepended to agents that take part in handoffs.
pub const HANDOFF_PROMPT_PREFIX: &str = "# System context\n\
You are part of a multi-agent system designed to make agent coordination and execution easy. \
Agents can hand off a conversation to another agent by calling a transfer function, named \
`transfer_to_<agent_name>`. Transfers between agents are handled seamlessly in the background; \
do not mention or draw attention to these transfers in your conversation with the user.\n";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent name must not be empty")]
    EmptyName,

    #[error("agent `{agent}` lists handoff target `{target}` more than once")]
    DuplicateHandoff { agent: String, target: String },

    /// Two targets would be offered to the model under the same transfer tool.
    #[error("agent `{agent}` lists `{first}` and `{second}`, which both hand off through `{tool}`")]
    HandoffNameCollision {
        agent: String,
        first: String,
        second: String,
        tool: String,
    },
}

struct AgentInner {
    name: String,
    handoff_description: String,
    instructions: Arc<str>,
    tools: ToolRegistry,
    handoffs: Vec<AgentDefinition>,
}

/// Immutable agent descriptor.
#[derive(Clone)]
pub struct AgentDefinition {
    inner: Arc<AgentInner>,
}

impl fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("name", &self.inner.name)
            .field("tools", &self.inner.tools)
            .field(
                "handoffs",
                &self.inner.handoffs.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl AgentDefinition {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder {
            name: name.into(),
            handoff_description: String::new(),
            instructions: String::new(),
            tools: ToolRegistry::default(),
            handoffs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Shown to other agents that may hand off to this one.
    pub fn handoff_description(&self) -> &str {
        &self.inner.handoff_description
    }

    /// The unrendered instruction template.
    pub fn instruction_template(&self) -> &str {
        &self.inner.instructions
    }

    /// Instructions with `{handoff_prefix}` and `{agent_name}` filled in.
    pub fn instructions(&self) -> String {
        self.inner
            .instructions
            .replace("{handoff_prefix}", HANDOFF_PROMPT_PREFIX)
            .replace("{agent_name}", &self.inner.name)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    pub fn handoffs(&self) -> &[AgentDefinition] {
        &self.inner.handoffs
    }

    /// Find a declared handoff target by name.
    pub fn handoff_target(&self, name: &str) -> Option<&AgentDefinition> {
        self.inner.handoffs.iter().find(|agent| agent.name() == name)
    }

    /// Handoff targets as offered to the model.
    pub fn handoff_definitions(&self) -> Vec<HandoffDefinition> {
        self.inner
            .handoffs
            .iter()
            .map(|agent| HandoffDefinition {
                agent_name: agent.name().to_string(),
                description: agent.handoff_description().to_string(),
            })
            .collect()
    }

    /// A copy of this agent with a different tool set.
    pub fn with_tools(&self, tools: ToolRegistry) -> AgentDefinition {
        AgentDefinition {
            inner: Arc::new(AgentInner {
                name: self.inner.name.clone(),
                handoff_description: self.inner.handoff_description.clone(),
                instructions: Arc::clone(&self.inner.instructions),
                tools,
                handoffs: self.inner.handoffs.clone(),
            }),
        }
    }

    /// A copy of this agent with different handoff targets.
    pub fn with_handoffs(&self, handoffs: Vec<AgentDefinition>) -> Result<AgentDefinition, AgentError> {
        check_unique_handoffs(&self.inner.name, &handoffs)?;
        Ok(AgentDefinition {
            inner: Arc::new(AgentInner {
                name: self.inner.name.clone(),
                handoff_description: self.inner.handoff_description.clone(),
                instructions: Arc::clone(&self.inner.instructions),
                tools: self.inner.tools.clone(),
                handoffs,
            }),
        })
    }

    /// True if both values share the same underlying definition.
    pub fn ptr_eq(&self, other: &AgentDefinition) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn check_unique_handoffs(agent: &str, handoffs: &[AgentDefinition]) -> Result<(), AgentError> {
    let tool_names: Vec<String> = handoffs.iter().map(|a| handoff_tool_name(a.name())).collect();
    for (i, target) in handoffs.iter().enumerate() {
        for (earlier, earlier_tool) in handoffs[..i].iter().zip(&tool_names) {
            if earlier.name() == target.name() {
                return Err(AgentError::DuplicateHandoff {
                    agent: agent.to_string(),
                    target: target.name().to_string(),
                });
            }
            if *earlier_tool == tool_names[i] {
                return Err(AgentError::HandoffNameCollision {
                    agent: agent.to_string(),
                    first: earlier.name().to_string(),
                    second: target.name().to_string(),
                    tool: tool_names[i].clone(),
                });
            }
        }
    }
    Ok(())
}

/// Builder for [`AgentDefinition`].
pub struct AgentBuilder {
    name: String,
    handoff_description: String,
    instructions: String,
    tools: ToolRegistry,
    handoffs: Vec<AgentDefinition>,
}

impl AgentBuilder {
    pub fn instructions(mut self, template: impl Into<String>) -> Self {
        self.instructions = template.into();
        self
    }

    pub fn handoff_description(mut self, description: impl Into<String>) -> Self {
        self.handoff_description = description.into();
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn handoff(mut self, target: &AgentDefinition) -> Self {
        self.handoffs.push(target.clone());
        self
    }

    pub fn build(self) -> Result<AgentDefinition, AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::EmptyName);
        }
        check_unique_handoffs(&self.name, &self.handoffs)?;
        Ok(AgentDefinition {
            inner: Arc::new(AgentInner {
                name: self.name,
                handoff_description: self.handoff_description,
                instructions: Arc::from(self.instructions),
                tools: self.tools,
                handoffs: self.handoffs,
            }),
        })
    }
}
