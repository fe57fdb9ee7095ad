//! OpenAI-compatible chat-completions backend with automatic retry for
//! transient errors.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use crate::config::ConfigError;

use super::{
    Backend, HandoffDefinition, Message, ModelRequest, ModelResponse, Role, TokenUsage, ToolCall,
    ToolDefinition,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// Prefix of the function tools that stand for handoffs. Regular tools may
/// not use it.
pub const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Chat-completions client. Handoffs are offered to the model as
/// `transfer_to_<agent>` function tools and mapped back on the way out.
pub struct ChatCompletionsClient {
    client: Client,
    api_key: String,
    base_url: String,
    retry_config: RetryConfig,
}

impl ChatCompletionsClient {
    /// Create a client for the default endpoint with default retry configuration.
    pub fn new(api_key: String) -> Result<Self, ConfigError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    /// Create a client for any OpenAI-compatible endpoint.
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_config: RetryConfig::default(),
        })
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    fn create_error(status: reqwest::StatusCode, body: &str, retry_after: Option<Duration>) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => LlmError::client_error(status_code, body.to_string()),
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &CompletionRequest) -> Result<CompletionMessage, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(LlmError::network_error(format!("Request timeout: {}", e)))
            }
            Err(e) if e.is_connect() => {
                return Err(LlmError::network_error(format!("Connection failed: {}", e)))
            }
            Err(e) => return Err(LlmError::network_error(format!("Request failed: {}", e))),
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        if let Some(usage) = parsed.usage {
            let usage = TokenUsage::new(usage.prompt_tokens, usage.completion_tokens);
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Backend usage"
            );
        }

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))
    }

    /// Execute a request with automatic retry for transient errors.
    async fn execute_with_retry(&self, request: &CompletionRequest) -> Result<CompletionMessage, LlmError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            let error = match self.execute_request(request).await {
                Ok(message) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Request succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(message);
                }
                Err(error) => error,
            };

            let should_retry =
                self.retry_config.should_retry(&error) && attempt < self.retry_config.max_retries;
            if !should_retry {
                if attempt > 0 {
                    tracing::error!("Request failed after {} retries: {}", attempt, error);
                } else {
                    tracing::error!("Request failed (non-retryable): {}", error);
                }
                return Err(error);
            }

            let remaining = self
                .retry_config
                .max_retry_duration
                .saturating_sub(start.elapsed());
            let delay = error.suggested_delay(attempt).min(remaining);
            if delay.is_zero() {
                tracing::warn!("Retry attempt {} failed, no time remaining: {}", attempt + 1, error);
                return Err(error);
            }

            tracing::warn!(
                "Retry attempt {} failed with {}, retrying in {:?}: {}",
                attempt + 1,
                error.kind,
                delay,
                error.message
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Backend for ChatCompletionsClient {
    async fn step(&self, request: ModelRequest<'_>) -> Result<ModelResponse, LlmError> {
        let mut tools: Vec<ToolDefinition> = request.tools.to_vec();
        tools.extend(request.handoffs.iter().map(handoff_tool_definition));

        let mut messages = Vec::with_capacity(request.history.len() + 1);
        if !request.instructions.is_empty() {
            messages.push(WireMessage::from(&Message::system(request.instructions)));
        }
        messages.extend(request.history.iter().map(WireMessage::from));

        let body = CompletionRequest {
            model: request.model.to_string(),
            messages,
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            tools: (!tools.is_empty()).then_some(tools),
        };

        tracing::debug!(
            "Sending request to chat completions: model={}, agent={}",
            request.model,
            request.agent_name
        );

        let message = self.execute_with_retry(&body).await?;
        Ok(interpret(message, request.tools, request.handoffs))
    }
}

/// Name of the function tool that represents a handoff to `agent_name`.
pub fn handoff_tool_name(agent_name: &str) -> String {
    let slug: String = agent_name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("{}{}", HANDOFF_TOOL_PREFIX, slug)
}

fn handoff_tool_definition(handoff: &HandoffDefinition) -> ToolDefinition {
    let description = if handoff.description.is_empty() {
        format!("Handoff to the {} agent to handle the request.", handoff.agent_name)
    } else {
        format!(
            "Handoff to the {} agent to handle the request. {}",
            handoff.agent_name, handoff.description
        )
    };
    ToolDefinition::function(
        handoff_tool_name(&handoff.agent_name),
        description,
        json!({ "type": "object", "properties": {}, "additionalProperties": false }),
    )
}

/// Reduce a chat-completions message to exactly one model decision.
///
/// A `transfer_to_` call that matches no declared handoff and no offered tool
/// is still reported as a handoff, so the runner can reject the target.
fn interpret(
    message: CompletionMessage,
    tools: &[ToolDefinition],
    handoffs: &[HandoffDefinition],
) -> ModelResponse {
    let mut calls = message.tool_calls.unwrap_or_default().into_iter();
    let Some(call) = calls.next() else {
        return ModelResponse::FinalOutput(message.content.unwrap_or_default());
    };

    let ignored = calls.count();
    if ignored > 0 {
        tracing::warn!("Model requested {} additional calls in one step; ignoring them", ignored);
    }

    let name = call.function.name;
    if let Some(handoff) = handoffs
        .iter()
        .find(|h| handoff_tool_name(&h.agent_name) == name)
    {
        return ModelResponse::Handoff {
            id: call.id,
            target: handoff.agent_name.clone(),
        };
    }
    let offered = tools.iter().any(|tool| tool.function.name == name);
    if let Some(target) = name.strip_prefix(HANDOFF_TOOL_PREFIX).filter(|_| !offered) {
        return ModelResponse::Handoff {
            id: call.id,
            target: target.to_string(),
        };
    }

    let raw = call.function.arguments;
    let arguments = if raw.trim().is_empty() {
        json!({})
    } else {
        // Unparseable arguments are passed through as a string so that schema
        // validation reports them back to the model.
        serde_json::from_str(&raw).unwrap_or(Value::String(raw))
    };

    ModelResponse::ToolCall {
        id: call.id,
        name,
        arguments,
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let has_calls = !message.tool_calls.is_empty();
        WireMessage {
            role: message.role,
            content: if has_calls && message.content.is_empty() {
                None
            } else {
                Some(message.content.clone())
            },
            tool_calls: has_calls.then(|| message.tool_calls.clone()),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FunctionCall;

    fn handoffs() -> Vec<HandoffDefinition> {
        vec![HandoffDefinition {
            agent_name: "Security Agent".to_string(),
            description: "Specialist in security issues.".to_string(),
        }]
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    #[test]
    fn test_handoff_tool_name() {
        assert_eq!(handoff_tool_name("Security Agent"), "transfer_to_security_agent");
        assert_eq!(
            handoff_tool_name("Full Context Agent Code Gatherer"),
            "transfer_to_full_context_agent_code_gatherer"
        );
    }

    #[test]
    fn test_text_is_final_output() {
        let message = CompletionMessage {
            content: Some("looks good".to_string()),
            tool_calls: None,
        };
        assert_eq!(
            interpret(message, &[], &handoffs()),
            ModelResponse::FinalOutput("looks good".to_string())
        );
    }

    #[test]
    fn test_transfer_call_maps_back_to_agent_name() {
        let message = CompletionMessage {
            content: None,
            tool_calls: Some(vec![call("transfer_to_security_agent", "{}")]),
        };
        assert_eq!(
            interpret(message, &[], &handoffs()),
            ModelResponse::Handoff {
                id: "call_1".to_string(),
                target: "Security Agent".to_string()
            }
        );
    }

    #[test]
    fn test_offered_tool_with_transfer_prefix_stays_a_tool_call() {
        let tools = vec![ToolDefinition::function(
            "transfer_to_archive",
            "Move a finding to the archive",
            json!({ "type": "object" }),
        )];
        let message = CompletionMessage {
            content: None,
            tool_calls: Some(vec![call("transfer_to_archive", r#"{"id":7}"#)]),
        };
        assert_eq!(
            interpret(message, &tools, &handoffs()),
            ModelResponse::ToolCall {
                id: "call_1".to_string(),
                name: "transfer_to_archive".to_string(),
                arguments: json!({ "id": 7 }),
            }
        );
    }

    #[test]
    fn test_unknown_transfer_is_still_a_handoff() {
        let message = CompletionMessage {
            content: None,
            tool_calls: Some(vec![call("transfer_to_billing_agent", "")]),
        };
        match interpret(message, &[], &handoffs()) {
            ModelResponse::Handoff { target, .. } => assert_eq!(target, "billing_agent"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_arguments_are_parsed() {
        let message = CompletionMessage {
            content: None,
            tool_calls: Some(vec![
                call("gather_full_code", r#"{"changed_files":["a.py"]}"#),
                call("gather_full_code", "{}"),
            ]),
        };
        assert_eq!(
            interpret(message, &[], &handoffs()),
            ModelResponse::ToolCall {
                id: "call_1".to_string(),
                name: "gather_full_code".to_string(),
                arguments: json!({ "changed_files": ["a.py"] }),
            }
        );
    }

    #[test]
    fn test_malformed_arguments_pass_through_as_string() {
        let message = CompletionMessage {
            content: None,
            tool_calls: Some(vec![call("gather_full_code", "{not json")]),
        };
        match interpret(message, &[], &handoffs()) {
            ModelResponse::ToolCall { arguments, .. } => {
                assert_eq!(arguments, Value::String("{not json".to_string()))
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_assistant_call_serializes_without_content() {
        let message = Message::assistant_call(ToolCall::function("c1", "list_workspace_files", &json!({})));
        let wire = serde_json::to_value(WireMessage::from(&message)).unwrap();
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "list_workspace_files");
    }

    mod http {
        use super::*;
        use axum::http::StatusCode;
        use axum::routing::post;
        use axum::{Json, Router};
        use std::collections::VecDeque;
        use std::sync::{Arc, Mutex};

        type Requests = Arc<Mutex<Vec<Value>>>;

        /// Serve the scripted replies in order, recording every request body.
        async fn serve(replies: Vec<(StatusCode, Value)>) -> (String, Requests) {
            let replies = Arc::new(Mutex::new(VecDeque::from(replies)));
            let requests: Requests = Arc::default();
            let sink = requests.clone();
            let app = Router::new().route(
                "/v1/chat/completions",
                post(move |Json(body): Json<Value>| {
                    let sink = sink.clone();
                    let replies = replies.clone();
                    async move {
                        sink.lock().unwrap().push(body);
                        let (status, reply) = replies
                            .lock()
                            .unwrap()
                            .pop_front()
                            .unwrap_or((StatusCode::GONE, json!({ "error": "script exhausted" })));
                        (status, Json(reply))
                    }
                }),
            );
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{}/v1/", addr), requests)
        }

        fn completion(text: &str) -> Value {
            json!({
                "choices": [{ "message": { "role": "assistant", "content": text } }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
            })
        }

        async fn step(client: &ChatCompletionsClient) -> Result<ModelResponse, LlmError> {
            let history = vec![Message::user("review app/api.py")];
            let handoffs = handoffs();
            client
                .step(ModelRequest {
                    model: "gpt-4o",
                    agent_name: "Context Agent",
                    instructions: "You are Context Agent.",
                    history: &history,
                    tools: &[],
                    handoffs: &handoffs,
                })
                .await
        }

        #[tokio::test]
        async fn test_server_error_is_retried_once_then_succeeds() {
            let (base_url, requests) = serve(vec![
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": "overloaded" })),
                (StatusCode::OK, completion("looks good")),
            ])
            .await;
            let client = ChatCompletionsClient::with_base_url("sk-test".to_string(), base_url).unwrap();

            let response = step(&client).await.unwrap();
            assert_eq!(response, ModelResponse::FinalOutput("looks good".to_string()));

            let requests = requests.lock().unwrap();
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[0], requests[1]);
            assert_eq!(requests[0]["messages"][0]["role"], "system");
            assert_eq!(requests[0]["messages"][1]["content"], "review app/api.py");
            assert_eq!(requests[0]["tools"][0]["function"]["name"], "transfer_to_security_agent");
            assert_eq!(requests[0]["tool_choice"], "auto");
        }

        #[tokio::test]
        async fn test_client_error_is_not_retried() {
            let (base_url, requests) = serve(vec![
                (StatusCode::BAD_REQUEST, json!({ "error": "unknown model" })),
                (StatusCode::OK, completion("unreachable")),
            ])
            .await;
            let client = ChatCompletionsClient::with_base_url("sk-test".to_string(), base_url).unwrap();

            let err = step(&client).await.unwrap_err();
            assert_eq!(err.kind, LlmErrorKind::ClientError);
            assert_eq!(err.status_code, Some(400));
            assert!(err.message.contains("unknown model"));
            assert_eq!(requests.lock().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_disabled_retries_surface_the_first_server_error() {
            let (base_url, requests) = serve(vec![
                (StatusCode::BAD_GATEWAY, json!({ "error": "upstream" })),
                (StatusCode::OK, completion("unreachable")),
            ])
            .await;
            let client = ChatCompletionsClient::with_base_url("sk-test".to_string(), base_url)
                .unwrap()
                .with_retry_config(RetryConfig::disabled());

            let err = step(&client).await.unwrap_err();
            assert_eq!(err.kind, LlmErrorKind::ServerError);
            assert_eq!(err.status_code, Some(502));
            assert_eq!(requests.lock().unwrap().len(), 1);
        }
    }
}
