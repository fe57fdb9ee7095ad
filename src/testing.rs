//! Fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{Backend, LlmError, Message, ModelRequest, ModelResponse};
use crate::moderation::{GuardrailVerdict, ModerationError, Moderator, ScanRequest};

type BlockRule = Box<dyn Fn(&ScanRequest) -> bool + Send + Sync>;

enum ModeratorMode {
    Verdicts(BlockRule),
    Unavailable,
}

/// Moderator that records every request and blocks according to a rule.
pub struct FakeModerator {
    mode: ModeratorMode,
    requests: Mutex<Vec<ScanRequest>>,
}

impl FakeModerator {
    pub fn allow_all() -> Self {
        Self::block_when(|_| false)
    }

    pub fn block_all() -> Self {
        Self::block_when(|_| true)
    }

    /// Block requests whose messages contain `needle`.
    pub fn block_containing(needle: &'static str) -> Self {
        Self::block_when(move |request| request.messages.iter().any(|m| m.content.contains(needle)))
    }

    pub fn block_when(rule: impl Fn(&ScanRequest) -> bool + Send + Sync + 'static) -> Self {
        Self {
            mode: ModeratorMode::Verdicts(Box::new(rule)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every scan fails with a network error.
    pub fn unavailable() -> Self {
        Self {
            mode: ModeratorMode::Unavailable,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ScanRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Moderator for FakeModerator {
    async fn scan(&self, request: &ScanRequest) -> Result<GuardrailVerdict, ModerationError> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.mode {
            ModeratorMode::Unavailable => Err(ModerationError::Network("connection refused".to_string())),
            ModeratorMode::Verdicts(rule) if rule(request) => {
                let mut verdict = GuardrailVerdict::block();
                verdict.categories.insert("malicious_code".to_string(), json!(true));
                verdict
                    .findings
                    .push(json!({ "category": "malicious_code", "text": "backdoor" }));
                Ok(verdict)
            }
            ModeratorMode::Verdicts(_) => Ok(GuardrailVerdict::allow()),
        }
    }
}

/// What the backend saw on one step.
#[derive(Debug, Clone)]
pub struct RecordedStep {
    pub agent: String,
    pub instructions: String,
    pub history: Vec<Message>,
    pub tools: Vec<String>,
    pub handoffs: Vec<String>,
}

type Responder = Box<dyn Fn(&ModelRequest<'_>) -> Result<ModelResponse, LlmError> + Send + Sync>;

/// Backend driven by a fixed script or a closure.
pub struct ScriptedBackend {
    respond: Responder,
    steps: Mutex<Vec<RecordedStep>>,
}

impl ScriptedBackend {
    /// Answer each step with the next response; fail once the script runs out.
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        let script = Mutex::new(VecDeque::from(responses));
        Self::from_fn(move |_| {
            script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::parse_error("script exhausted".to_string()))
        })
    }

    pub fn from_fn(
        respond: impl Fn(&ModelRequest<'_>) -> Result<ModelResponse, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            steps: Mutex::new(Vec::new()),
        }
    }

    pub fn steps(&self) -> Vec<RecordedStep> {
        self.steps.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.steps.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn step(&self, request: ModelRequest<'_>) -> Result<ModelResponse, LlmError> {
        self.steps.lock().unwrap().push(RecordedStep {
            agent: request.agent_name.to_string(),
            instructions: request.instructions.to_string(),
            history: request.history.to_vec(),
            tools: request.tools.iter().map(|t| t.function.name.clone()).collect(),
            handoffs: request.handoffs.iter().map(|h| h.agent_name.clone()).collect(),
        });
        // Yield so concurrent runs interleave.
        tokio::task::yield_now().await;
        (self.respond)(&request)
    }
}

pub fn final_output(text: &str) -> ModelResponse {
    ModelResponse::FinalOutput(text.to_string())
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ModelResponse {
    ModelResponse::ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

pub fn handoff(id: &str, target: &str) -> ModelResponse {
    ModelResponse::Handoff {
        id: id.to_string(),
        target: target.to_string(),
    }
}
