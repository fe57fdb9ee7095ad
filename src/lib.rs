//! # latio
//!
//! A guarded multi-agent orchestration runtime, built to drive code-review
//! agents.
//!
//! A run executes one agent against a conversation. The agent may call tools
//! or hand the conversation to another agent, and every boundary is checked
//! by an external moderation service that can stop the run.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │             Runner               │
//!        │  (input guardrail, step loop,    │
//!        │   output guardrail)              │
//!        └───────┬──────────┬──────────┬────┘
//!                │          │          │
//!                ▼          ▼          ▼
//!        ┌──────────┐ ┌──────────┐ ┌───────────────┐
//!        │ Backend  │ │  Tools   │ │ Guardrails    │
//!        │ (LLM)    │ │          │ │ -> Moderation │
//!        └──────────┘ └──────────┘ └───────────────┘
//! ```
//!
//! ## Run Flow
//! 1. Check the entry agent's instructions and the user input
//! 2. Ask the backend for one step: final output, tool call or handoff
//! 3. Run tools (moderating high-risk output) or switch agents, then repeat
//! 4. Check the final output and return it
//!
//! ## Modules
//! - `agent`: immutable agent definitions
//! - `agents`: the code-review agent graph
//! - `runner`: the run loop
//! - `guardrails`: moderation checkpoints
//! - `moderation`: moderation service client and verdicts
//! - `llm`: backend trait and chat-completions client
//! - `tools`: tool trait, registry and built-in tools

pub mod agent;
pub mod agents;
pub mod config;
pub mod guardrails;
pub mod llm;
pub mod moderation;
pub mod runner;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::AgentDefinition;
pub use config::Config;
pub use runner::{RunContext, RunError, RunOutcome, RunResult, Runner};
