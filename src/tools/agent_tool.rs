//! Agents exposed as tools.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolError, ToolOutput, ToolRisk};
use crate::agent::AgentDefinition;
use crate::runner::{RunOutcome, Runner};

/// Runs another agent to completion and returns its final output.
///
/// The nested run shares the caller's [`RunContext`](crate::runner::RunContext)
/// and goes through the same guardrails. If it is blocked, the calling run is
/// blocked too.
pub struct AgentTool {
    agent: AgentDefinition,
    runner: Runner,
    name: String,
    description: String,
    risk: ToolRisk,
}

impl AgentTool {
    pub fn new(
        agent: AgentDefinition,
        runner: Runner,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            runner,
            name: name.into(),
            description: description.into(),
            risk: ToolRisk::Low,
        }
    }

    /// Also moderate the nested agent's output as tool output.
    pub fn high_risk(mut self) -> Self {
        self.risk = ToolRisk::High;
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "The request to send to the agent"
                }
            },
            "required": ["input"]
        })
    }

    fn risk(&self) -> ToolRisk {
        self.risk
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let input = args["input"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("`input` must be a string".to_string()))?
            .to_string();

        tracing::info!(agent = self.agent.name(), "Starting nested run");
        let result = self
            .runner
            .run(&self.agent, input, ctx.run.clone())
            .await
            .map_err(|e| {
                ToolError::Failed(
                    anyhow::Error::new(e).context(format!("nested run of {}", self.agent.name())),
                )
            })?;

        match result.outcome {
            RunOutcome::Completed { output } => Ok(ToolOutput::new(json!({
                "agent": result.last_agent,
                "output": output,
            }))),
            RunOutcome::Blocked(tripwire) => Err(ToolError::Blocked(tripwire)),
        }
    }
}
