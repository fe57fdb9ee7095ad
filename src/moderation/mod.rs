//! Moderation service boundary.
//!
//! [`Moderator`] is the seam the guardrail engine depends on; the bundled
//! [`ModerationClient`] performs one authenticated HTTP call per scan.
//! Responses are decoded into [`ScanResponse`] and immediately normalized into
//! a single [`GuardrailVerdict`].

mod client;
mod verdict;

pub use client::ModerationClient;
pub use verdict::{Action, GuardrailVerdict, RawVerdict, ScanResponse};

use async_trait::async_trait;
use serde::Serialize;

use crate::llm::Role;

/// Failure talking to the moderation service.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("moderation API returned error: {status}: {body}")]
    Api { status: u16, body: String },

    #[error("error connecting to moderation API: {0}")]
    Network(String),

    #[error("could not decode moderation response: {0}")]
    Decode(String),
}

/// One message submitted for scanning.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanMessage {
    pub role: Role,
    pub content: String,
}

impl ScanMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Request body sent to the moderation service.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanRequest {
    pub messages: Vec<ScanMessage>,
    pub service: String,
    pub model: String,
    pub user_id: String,
    pub session_id: String,
}

/// A moderation service.
#[async_trait]
pub trait Moderator: Send + Sync {
    /// Scan messages and return the effective verdict.
    async fn scan(&self, request: &ScanRequest) -> Result<GuardrailVerdict, ModerationError>;
}
