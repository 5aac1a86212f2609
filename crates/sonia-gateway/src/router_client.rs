//! Model router client.
//!
//! The routing contract only: `POST /chat` with a task type, messages,
//! and a routing policy; the router picks the provider and model. The
//! trait exists so the pipeline can be driven by stubs in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use sonia_core::{CoreError, CoreResult};

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A structured tool call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// The tool to invoke.
    pub tool_name: String,
    /// Tool arguments.
    #[serde(default)]
    pub args: HashMap<String, JsonValue>,
}

/// Request body for `POST /chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Routing task type (profile).
    pub task_type: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Output token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Routing policy name.
    pub policy: String,
}

/// Response body of `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Assistant text.
    #[serde(default)]
    pub text: String,
    /// Structured tool calls, when the model emitted any.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    /// The model that answered.
    #[serde(default)]
    pub model: String,
    /// The provider that answered.
    #[serde(default)]
    pub provider: String,
}

/// Capability interface over the model router.
#[async_trait]
pub trait ModelRouter: Send + Sync {
    /// Run one chat completion through the router.
    async fn chat(&self, request: &ChatRequest) -> CoreResult<ChatResponse>;
}

/// HTTP client for the model router service.
#[derive(Debug)]
pub struct HttpModelRouter {
    http: reqwest::Client,
    base_url: String,
}

impl HttpModelRouter {
    /// Client for the router at `base_url` with the given call timeout.
    #[must_use]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ModelRouter for HttpModelRouter {
    async fn chat(&self, request: &ChatRequest) -> CoreResult<ChatResponse> {
        let url = format!("{}/chat", self.base_url);
        debug!(task_type = request.task_type, url, "model router call");
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout {
                        stage: "model".to_string(),
                        timeout_ms: 0,
                    }
                } else {
                    CoreError::Transient(format!("model router unreachable: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Transient(format!(
                "model router returned HTTP {}",
                response.status()
            )));
        }
        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| CoreError::Transient(format!("model router response invalid: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_request_serialization() {
        let request = ChatRequest {
            task_type: "chat_low_latency".to_string(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            temperature: None,
            max_tokens: Some(256),
            policy: "latency_first".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["task_type"], "chat_low_latency");
        assert_eq!(value["messages"][1]["role"], "user");
        assert!(value.get("temperature").is_none());
    }

    #[test]
    fn test_chat_response_defaults() {
        let response: ChatResponse =
            serde_json::from_value(json!({"text": "hello"})).unwrap();
        assert_eq!(response.text, "hello");
        assert!(response.tool_calls.is_empty());

        let with_tools: ChatResponse = serde_json::from_value(json!({
            "text": "",
            "tool_calls": [{"tool_name": "file.read", "args": {"path": "a.txt"}}],
        }))
        .unwrap();
        assert_eq!(with_tools.tool_calls[0].tool_name, "file.read");
    }
}
