//! Guardrail checkpoints.
//!
//! The engine wraps a [`Moderator`] and applies it at three points of a run:
//!
//! - **agent start**: the active agent's instructions plus the latest user
//!   message, before the first model step
//! - **agent end**: the final output, before it is returned
//! - **tool end**: the output of a high-risk tool, before it enters the history
//!
//! Every checkpoint returns a [`GuardrailOutcome`]. A block is a value, not an
//! error: the runner has to match on it and stop the run.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::OutagePolicy;
use crate::llm::Role;
use crate::moderation::{GuardrailVerdict, ModerationError, Moderator, ScanMessage, ScanRequest};
use crate::runner::RunContext;

/// Where in the run a check happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    AgentStart,
    AgentEnd,
    ToolEnd,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Checkpoint::AgentStart => "agent start",
            Checkpoint::AgentEnd => "agent end",
            Checkpoint::ToolEnd => "tool end",
        };
        f.write_str(label)
    }
}

/// The signal raised when a checkpoint blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tripwire {
    pub checkpoint: Checkpoint,
    pub agent: String,
    pub tool: Option<String>,
    pub verdict: GuardrailVerdict,
}

impl Tripwire {
    /// Human-readable reason built from flagged categories and findings.
    pub fn reason(&self) -> String {
        let mut reason = match &self.tool {
            Some(tool) => format!(
                "blocked at {} of tool `{}` (agent {})",
                self.checkpoint, tool, self.agent
            ),
            None => format!("blocked at {} of agent {}", self.checkpoint, self.agent),
        };

        let categories = self.verdict.flagged_categories();
        if !categories.is_empty() {
            reason.push_str(&format!("; categories: {}", categories.join(", ")));
        }
        if !self.verdict.findings.is_empty() {
            reason.push_str(&format!("; {} finding(s)", self.verdict.findings.len()));
        }
        reason
    }
}

impl fmt::Display for Tripwire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

/// Result of one checkpoint.
#[must_use = "a blocked checkpoint must stop the run"]
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailOutcome {
    /// Nothing to check; treated as allow without calling the service.
    Skipped,
    /// The service allowed the content.
    Allowed(GuardrailVerdict),
    /// The moderation service failed and the engine is configured to fail open.
    Unavailable,
    /// The service blocked the content.
    Blocked(Tripwire),
}

/// Labels reported to the moderation service with every scan.
#[derive(Debug, Clone)]
pub struct ScanLabels {
    pub service: String,
    pub model: String,
}

impl Default for ScanLabels {
    fn default() -> Self {
        Self {
            service: "openai".to_string(),
            model: "gpt-4o".to_string(),
        }
    }
}

/// Applies moderation at agent and tool boundaries.
#[derive(Clone)]
pub struct GuardrailEngine {
    moderator: Arc<dyn Moderator>,
    labels: ScanLabels,
    outage_policy: OutagePolicy,
}

impl GuardrailEngine {
    pub fn new(moderator: Arc<dyn Moderator>) -> Self {
        Self {
            moderator,
            labels: ScanLabels::default(),
            outage_policy: OutagePolicy::FailClosed,
        }
    }

    pub fn with_labels(mut self, labels: ScanLabels) -> Self {
        self.labels = labels;
        self
    }

    /// Choose how moderation outages are handled. Fail-closed unless set.
    pub fn with_outage_policy(mut self, policy: OutagePolicy) -> Self {
        self.outage_policy = policy;
        self
    }

    /// Check the agent's instructions and the latest user input.
    pub async fn check_agent_start(
        &self,
        ctx: &RunContext,
        agent: &str,
        instructions: &str,
        user_input: Option<&str>,
    ) -> Result<GuardrailOutcome, ModerationError> {
        let mut messages = Vec::with_capacity(2);
        if !instructions.trim().is_empty() {
            messages.push(ScanMessage::new(Role::System, instructions));
        }
        if let Some(input) = user_input.filter(|i| !i.trim().is_empty()) {
            messages.push(ScanMessage::new(Role::User, input));
        }
        self.check(ctx, Checkpoint::AgentStart, agent, None, messages).await
    }

    /// Check an agent's final output.
    pub async fn check_agent_end(
        &self,
        ctx: &RunContext,
        agent: &str,
        output: &str,
    ) -> Result<GuardrailOutcome, ModerationError> {
        self.check(ctx, Checkpoint::AgentEnd, agent, None, assistant_content(output))
            .await
    }

    /// Check what a tool returned.
    pub async fn check_tool_end(
        &self,
        ctx: &RunContext,
        agent: &str,
        tool: &str,
        output: &str,
    ) -> Result<GuardrailOutcome, ModerationError> {
        self.check(ctx, Checkpoint::ToolEnd, agent, Some(tool), assistant_content(output))
            .await
    }

    async fn check(
        &self,
        ctx: &RunContext,
        checkpoint: Checkpoint,
        agent: &str,
        tool: Option<&str>,
        messages: Vec<ScanMessage>,
    ) -> Result<GuardrailOutcome, ModerationError> {
        if messages.is_empty() {
            tracing::debug!(%checkpoint, agent, "Nothing to moderate, skipping checkpoint");
            return Ok(GuardrailOutcome::Skipped);
        }

        let request = ScanRequest {
            messages,
            service: self.labels.service.clone(),
            model: self.labels.model.clone(),
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
        };

        let verdict = match self.moderator.scan(&request).await {
            Ok(verdict) => verdict,
            Err(err) => match self.outage_policy {
                OutagePolicy::FailClosed => {
                    tracing::error!(%checkpoint, agent, "Moderation failed: {}", err);
                    return Err(err);
                }
                OutagePolicy::FailOpen => {
                    tracing::warn!(%checkpoint, agent, "Moderation failed, continuing (fail-open): {}", err);
                    return Ok(GuardrailOutcome::Unavailable);
                }
            },
        };

        if verdict.is_block() {
            let tripwire = Tripwire {
                checkpoint,
                agent: agent.to_string(),
                tool: tool.map(str::to_string),
                verdict,
            };
            tracing::warn!(%checkpoint, agent, "Guardrail tripped: {}", tripwire.reason());
            return Ok(GuardrailOutcome::Blocked(tripwire));
        }

        tracing::debug!(%checkpoint, agent, "Guardrail allowed");
        Ok(GuardrailOutcome::Allowed(verdict))
    }
}

fn assistant_content(content: &str) -> Vec<ScanMessage> {
    if content.trim().is_empty() {
        Vec::new()
    } else {
        vec![ScanMessage::new(Role::Assistant, content)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeModerator;

    fn ctx() -> RunContext {
        RunContext::new("user-1", "session-1")
    }

    #[tokio::test]
    async fn test_agent_start_sends_system_and_user() {
        let moderator = Arc::new(FakeModerator::allow_all());
        let engine = GuardrailEngine::new(moderator.clone());

        let outcome = engine
            .check_agent_start(&ctx(), "Context Agent", "You review code.", Some("check this diff"))
            .await
            .unwrap();
        assert!(matches!(outcome, GuardrailOutcome::Allowed(_)));

        let requests = moderator.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].messages,
            vec![
                ScanMessage::new(Role::System, "You review code."),
                ScanMessage::new(Role::User, "check this diff"),
            ]
        );
        assert_eq!(requests[0].user_id, "user-1");
        assert_eq!(requests[0].session_id, "session-1");
    }

    #[tokio::test]
    async fn test_empty_content_skips_the_service() {
        let moderator = Arc::new(FakeModerator::block_all());
        let engine = GuardrailEngine::new(moderator.clone());

        let start = engine.check_agent_start(&ctx(), "A", "", None).await.unwrap();
        let end = engine.check_agent_end(&ctx(), "A", "   ").await.unwrap();
        let tool = engine.check_tool_end(&ctx(), "A", "gather_full_code", "").await.unwrap();

        assert_eq!(start, GuardrailOutcome::Skipped);
        assert_eq!(end, GuardrailOutcome::Skipped);
        assert_eq!(tool, GuardrailOutcome::Skipped);
        assert_eq!(moderator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_block_becomes_tripwire() {
        let moderator = Arc::new(FakeModerator::block_all());
        let engine = GuardrailEngine::new(moderator);

        let outcome = engine
            .check_tool_end(&ctx(), "Code Gatherer", "gather_full_code", "1: secret = 'x'")
            .await
            .unwrap();
        match outcome {
            GuardrailOutcome::Blocked(tripwire) => {
                assert_eq!(tripwire.checkpoint, Checkpoint::ToolEnd);
                assert_eq!(tripwire.tool.as_deref(), Some("gather_full_code"));
                assert!(tripwire.reason().contains("gather_full_code"));
                assert!(tripwire.reason().contains("malicious_code"));
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outage_fails_closed_by_default() {
        let engine = GuardrailEngine::new(Arc::new(FakeModerator::unavailable()));
        let result = engine.check_agent_end(&ctx(), "A", "final answer").await;
        assert!(matches!(result, Err(ModerationError::Network(_))));
    }

    #[tokio::test]
    async fn test_outage_can_fail_open_explicitly() {
        let engine = GuardrailEngine::new(Arc::new(FakeModerator::unavailable()))
            .with_outage_policy(OutagePolicy::FailOpen);
        let outcome = engine.check_agent_end(&ctx(), "A", "final answer").await.unwrap();
        assert_eq!(outcome, GuardrailOutcome::Unavailable);
    }
}
