//! HTTP moderation client.

use async_trait::async_trait;
use reqwest::Client;

use super::{GuardrailVerdict, ModerationError, Moderator, ScanRequest, ScanResponse};
use crate::config::{ConfigError, ModerationConfig};

/// Stateless client for the moderation service.
///
/// Credentials are checked when the client is built, so a misconfigured
/// process fails at startup rather than inside a run.
#[derive(Debug, Clone)]
pub struct ModerationClient {
    client: Client,
    app_id: String,
    api_key: String,
    endpoint: String,
}

impl ModerationClient {
    pub fn new(config: &ModerationConfig) -> Result<Self, ConfigError> {
        let app_id = required(config.app_id.as_deref(), "moderation app id", "MODERATION_APP_ID")?;
        let api_key = required(config.api_key.as_deref(), "moderation API key", "MODERATION_API_KEY")?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            app_id,
            api_key,
            endpoint: config.endpoint.clone(),
        })
    }
}

fn required(value: Option<&str>, name: &'static str, env: &'static str) -> Result<String, ConfigError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::MissingCredential { name, env })
}

#[async_trait]
impl Moderator for ModerationClient {
    async fn scan(&self, request: &ScanRequest) -> Result<GuardrailVerdict, ModerationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-App-Id", &self.app_id)
            .header("X-Api-Key", &self.api_key)
            .header("Content-Type", "application/json")
            // Ask for an immediate verdict so the caller can block on it.
            .header("async", "false")
            .json(request)
            .send()
            .await
            .map_err(|e| ModerationError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ModerationError::Network(e.to_string()))?;

        if !status.is_success() {
            tracing::warn!("Moderation API returned {}", status);
            return Err(ModerationError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ScanResponse =
            serde_json::from_str(&body).map_err(|e| ModerationError::Decode(e.to_string()))?;
        parsed.into_verdict()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::moderation::ScanMessage;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Captured = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

    async fn serve(status: StatusCode, reply: Value) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let sink = captured.clone();
        let app = Router::new().route(
            "/sessions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let sink = sink.clone();
                let reply = reply.clone();
                async move {
                    sink.lock().unwrap().push((headers, body));
                    (status, Json(reply))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/sessions", addr), captured)
    }

    fn config(endpoint: String) -> ModerationConfig {
        ModerationConfig {
            app_id: Some("app-123".to_string()),
            api_key: Some("key-456".to_string()),
            endpoint,
            ..ModerationConfig::default()
        }
    }

    fn request() -> ScanRequest {
        ScanRequest {
            messages: vec![ScanMessage::new(Role::User, "please review")],
            service: "openai".to_string(),
            model: "gpt-4o".to_string(),
            user_id: "u-1".to_string(),
            session_id: "s-1".to_string(),
        }
    }

    #[test]
    fn test_missing_credentials_fail_at_construction() {
        let mut missing_key = config("http://localhost".to_string());
        missing_key.api_key = None;
        assert!(matches!(
            ModerationClient::new(&missing_key),
            Err(ConfigError::MissingCredential { env: "MODERATION_API_KEY", .. })
        ));

        let mut blank_id = config("http://localhost".to_string());
        blank_id.app_id = Some("  ".to_string());
        assert!(matches!(
            ModerationClient::new(&blank_id),
            Err(ConfigError::MissingCredential { env: "MODERATION_APP_ID", .. })
        ));
    }

    #[tokio::test]
    async fn test_scan_sends_credentials_and_body() {
        let (endpoint, captured) = serve(
            StatusCode::OK,
            json!([{ "action": "allow" }, { "action": "block", "categories": { "secrets": true } }]),
        )
        .await;
        let client = ModerationClient::new(&config(endpoint)).unwrap();

        let verdict = client.scan(&request()).await.unwrap();
        assert!(verdict.is_block());

        let captured = captured.lock().unwrap();
        let (headers, body) = &captured[0];
        assert_eq!(headers["x-app-id"], "app-123");
        assert_eq!(headers["x-api-key"], "key-456");
        assert_eq!(headers["async"], "false");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "please review");
        assert_eq!(body["user_id"], "u-1");
        assert_eq!(body["session_id"], "s-1");
        assert_eq!(body["service"], "openai");
    }

    #[tokio::test]
    async fn test_non_success_status_is_api_error() {
        let (endpoint, _) = serve(StatusCode::UNAUTHORIZED, json!({ "detail": "bad key" })).await;
        let client = ModerationClient::new(&config(endpoint)).unwrap();

        match client.scan(&request()).await {
            Err(ModerationError::Api { status, body }) => {
                assert_eq!(status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_is_network_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = config(format!("http://{}/sessions", addr));
        cfg.timeout = Duration::from_secs(2);
        let client = ModerationClient::new(&cfg).unwrap();

        assert!(matches!(
            client.scan(&request()).await,
            Err(ModerationError::Network(_))
        ));
    }
}
