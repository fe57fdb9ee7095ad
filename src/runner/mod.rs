//! The run loop.
//!
//! A run starts with one guardrail check over the entry agent's instructions
//! and the latest user message, then alternates model steps with tool calls
//! and handoffs until the model produces a final output. The final output is
//! checked once more before it is returned.
//!
//! ```text
//! INPUT_GUARDRAIL -> MODEL_STEP
//! MODEL_STEP -> TOOL_CALL -> MODEL_STEP
//! MODEL_STEP -> HANDOFF -> MODEL_STEP
//! MODEL_STEP -> OUTPUT_GUARDRAIL -> DONE
//! ```
//!
//! A guardrail block at any checkpoint ends the run with
//! [`RunOutcome::Blocked`]. Backend and moderation failures end it with a
//! [`RunError`].

mod history;


pub use history::ConversationHistory;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::AgentDefinition;
use crate::guardrails::{GuardrailEngine, GuardrailOutcome, Tripwire};
use crate::llm::{handoff_tool_name, Backend, LlmError, Message, ModelRequest, ModelResponse, ToolCall};
use crate::moderation::ModerationError;
use crate::tools::{ToolContext, ToolError, ToolInputError, ToolRisk};

/// Identity of one run, passed unchanged to every guardrail call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub user_id: String,
    pub session_id: String,
}

impl RunContext {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Context with a fresh session id for callers without their own.
    pub fn anonymous() -> Self {
        Self::new("anonymous", Uuid::new_v4().to_string())
    }
}

/// Limits and settings shared by every run of a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model: String,
    /// Maximum number of handoffs in one run.
    pub max_hops: usize,
    /// Maximum number of model steps in one run.
    pub max_turns: usize,
    /// Re-run the agent-start checkpoint after every handoff.
    pub recheck_on_handoff: bool,
    /// Root directory tool paths are resolved against.
    pub workspace_root: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_hops: 4,
            max_turns: 10,
            recheck_on_handoff: false,
            workspace_root: PathBuf::from("."),
        }
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { output: String },
    Blocked(Tripwire),
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub turns: usize,
    pub hops: usize,
    pub tool_calls: usize,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub history: ConversationHistory,
    /// Name of the agent that was active when the run ended.
    pub last_agent: String,
    pub stats: RunStats,
}

impl RunResult {
    pub fn final_output(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Completed { output } => Some(output),
            RunOutcome::Blocked(_) => None,
        }
    }

    pub fn tripwire(&self) -> Option<&Tripwire> {
        match &self.outcome {
            RunOutcome::Blocked(tripwire) => Some(tripwire),
            RunOutcome::Completed { .. } => None,
        }
    }
}

/// Fatal run failures. Guardrail blocks are not errors; see [`RunOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("moderation failed: {0}")]
    Moderation(#[from] ModerationError),

    #[error("backend failed: {0}")]
    Backend(#[from] LlmError),

    #[error("agent `{agent}` handed off to `{target}`, which is not one of its handoff targets")]
    InvalidHandoff { agent: String, target: String },

    #[error("handoff limit of {max_hops} exceeded ({agent} -> {target})")]
    MaxHopsExceeded {
        max_hops: usize,
        agent: String,
        target: String,
    },

    #[error("turn limit of {max_turns} exceeded")]
    MaxTurnsExceeded { max_turns: usize },

    #[error("tool `{tool}` failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Drives runs. Cheap to clone and safe to share between concurrent runs.
#[derive(Clone)]
pub struct Runner {
    backend: Arc<dyn Backend>,
    guardrails: GuardrailEngine,
    config: Arc<RunConfig>,
}

impl Runner {
    pub fn new(backend: Arc<dyn Backend>, guardrails: GuardrailEngine, config: RunConfig) -> Self {
        Self {
            backend,
            guardrails,
            config: Arc::new(config),
        }
    }

    /// Run `agent` on `input` until it completes, is blocked, or fails.
    pub async fn run(
        &self,
        agent: &AgentDefinition,
        input: impl Into<ConversationHistory>,
        ctx: RunContext,
    ) -> Result<RunResult, RunError> {
        let span = tracing::info_span!(
            "run",
            agent = agent.name(),
            user_id = %ctx.user_id,
            session_id = %ctx.session_id
        );
        let state = RunState {
            active: agent.clone(),
            history: input.into(),
            stats: RunStats::default(),
        };
        self.drive(state, ctx).instrument(span).await
    }

    async fn drive(&self, mut state: RunState, ctx: RunContext) -> Result<RunResult, RunError> {
        let instructions = state.active.instructions();
        let input_check = self
            .guardrails
            .check_agent_start(
                &ctx,
                state.active.name(),
                &instructions,
                state.history.latest_user_message(),
            )
            .await?;
        if let GuardrailOutcome::Blocked(tripwire) = input_check {
            tracing::warn!("Input blocked before the first model step");
            return Ok(state.finish(RunOutcome::Blocked(tripwire)));
        }

        loop {
            if state.stats.turns >= self.config.max_turns {
                tracing::error!("Turn limit of {} reached", self.config.max_turns);
                return Err(RunError::MaxTurnsExceeded {
                    max_turns: self.config.max_turns,
                });
            }
            state.stats.turns += 1;

            let instructions = state.active.instructions();
            let tools = state.active.tools().definitions();
            let handoffs = state.active.handoff_definitions();
            tracing::debug!(
                turn = state.stats.turns,
                agent = state.active.name(),
                history = state.history.len(),
                "Model step"
            );
            let response = self
                .backend
                .step(ModelRequest {
                    model: &self.config.model,
                    agent_name: state.active.name(),
                    instructions: &instructions,
                    history: state.history.as_slice(),
                    tools: &tools,
                    handoffs: &handoffs,
                })
                .await?;

            match response {
                ModelResponse::FinalOutput(output) => {
                    return self.finish_with_output(state, &ctx, output).await;
                }
                ModelResponse::ToolCall { id, name, arguments } => {
                    if let Some(tripwire) = self.call_tool(&mut state, &ctx, id, name, arguments).await? {
                        return Ok(state.finish(RunOutcome::Blocked(tripwire)));
                    }
                }
                ModelResponse::Handoff { id, target } => {
                    if let Some(tripwire) = self.hand_off(&mut state, &ctx, id, target).await? {
                        return Ok(state.finish(RunOutcome::Blocked(tripwire)));
                    }
                }
            }
        }
    }

    async fn finish_with_output(
        &self,
        mut state: RunState,
        ctx: &RunContext,
        output: String,
    ) -> Result<RunResult, RunError> {
        let check = self
            .guardrails
            .check_agent_end(ctx, state.active.name(), &output)
            .await?;
        if let GuardrailOutcome::Blocked(tripwire) = check {
            tracing::warn!("Final output blocked, discarding it");
            return Ok(state.finish(RunOutcome::Blocked(tripwire)));
        }

        tracing::info!(
            agent = state.active.name(),
            turns = state.stats.turns,
            hops = state.stats.hops,
            "Run completed"
        );
        state.history.push(Message::assistant(output.clone()));
        Ok(state.finish(RunOutcome::Completed { output }))
    }

    /// Execute one tool call and append the call and its result.
    /// Returns a tripwire when the tool's output was blocked.
    async fn call_tool(
        &self,
        state: &mut RunState,
        ctx: &RunContext,
        id: String,
        name: String,
        arguments: serde_json::Value,
    ) -> Result<Option<Tripwire>, RunError> {
        state.stats.tool_calls += 1;
        let call = Message::assistant_call(ToolCall::function(&id, &name, &arguments));

        let tool = match state.active.tools().validate(&name, &arguments) {
            Ok(tool) => Arc::clone(tool),
            Err(err) => {
                tracing::warn!(agent = state.active.name(), "Rejected tool call: {}", err);
                state.history.push(call);
                state.history.push(Message::tool(id, err.to_content()));
                return Ok(None);
            }
        };

        tracing::info!(agent = state.active.name(), tool = %name, "Calling tool");
        let tool_ctx = ToolContext {
            workspace_root: &self.config.workspace_root,
            run: ctx,
        };
        let content = match tool.execute(arguments, tool_ctx).await {
            Ok(output) => {
                if !output.warnings.is_empty() {
                    tracing::debug!(tool = %name, warnings = output.warnings.len(), "Tool reported warnings");
                }
                output.to_content()
            }
            Err(ToolError::InvalidInput(message)) => {
                tracing::warn!(tool = %name, "Tool rejected its input: {}", message);
                ToolInputError::InvalidArguments {
                    tool: name.clone(),
                    message,
                }
                .to_content()
            }
            Err(ToolError::Blocked(tripwire)) => return Ok(Some(tripwire)),
            Err(ToolError::Failed(source)) => {
                tracing::error!(tool = %name, "Tool failed: {:#}", source);
                return Err(RunError::Tool { tool: name, source });
            }
        };

        if tool.risk() == ToolRisk::High {
            let check = self
                .guardrails
                .check_tool_end(ctx, state.active.name(), &name, &content)
                .await?;
            if let GuardrailOutcome::Blocked(tripwire) = check {
                return Ok(Some(tripwire));
            }
        }

        state.history.push(call);
        state.history.push(Message::tool(id, content));
        Ok(None)
    }

    /// Switch the active agent. Returns a tripwire when the re-check after
    /// the handoff blocked.
    async fn hand_off(
        &self,
        state: &mut RunState,
        ctx: &RunContext,
        id: String,
        target: String,
    ) -> Result<Option<Tripwire>, RunError> {
        let Some(next) = state.active.handoff_target(&target).cloned() else {
            tracing::error!(agent = state.active.name(), target = %target, "Undeclared handoff target");
            return Err(RunError::InvalidHandoff {
                agent: state.active.name().to_string(),
                target,
            });
        };

        if state.stats.hops >= self.config.max_hops {
            tracing::error!("Handoff limit of {} reached", self.config.max_hops);
            return Err(RunError::MaxHopsExceeded {
                max_hops: self.config.max_hops,
                agent: state.active.name().to_string(),
                target,
            });
        }
        state.stats.hops += 1;

        tracing::info!(
            from = state.active.name(),
            to = %target,
            hop = state.stats.hops,
            "Handoff"
        );
        state.history.push(Message::assistant_call(ToolCall::function(
            &id,
            handoff_tool_name(&target),
            &json!({}),
        )));
        state
            .history
            .push(Message::tool(id, json!({ "assistant": target }).to_string()));
        state.active = next;

        if self.config.recheck_on_handoff {
            let instructions = state.active.instructions();
            let check = self
                .guardrails
                .check_agent_start(ctx, state.active.name(), &instructions, None)
                .await?;
            if let GuardrailOutcome::Blocked(tripwire) = check {
                return Ok(Some(tripwire));
            }
        }
        Ok(None)
    }
}

struct RunState {
    active: AgentDefinition,
    history: ConversationHistory,
    stats: RunStats,
}

impl RunState {
    fn finish(self, outcome: RunOutcome) -> RunResult {
        RunResult {
            outcome,
            last_agent: self.active.name().to_string(),
            history: self.history,
            stats: self.stats,
        }
    }
}
