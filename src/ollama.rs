use crate::error::ClientError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reply text used when the server answers without any message content.
pub const NO_RESPONSE_TEXT: &str = "Sorry, no response.";

/// The two calls the controller needs from an inference server.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ClientError>;

    /// Sends a non-streaming chat request and returns the full reply text.
    async fn chat(&self, request: &ChatRequest) -> Result<String, ClientError>;
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessageRequest {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessageRequest {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            images: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessageRequest>,
    pub stream: bool,
    pub temperature: f64,
    // Ollama reads sampling parameters from `options`; the top-level field
    // is kept for servers that accept it there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<HashMap<String, Value>>,
}

impl ChatRequest {
    pub fn new(model: &str, temperature: f64, messages: Vec<ChatMessageRequest>) -> Self {
        let mut options = HashMap::new();
        options.insert("temperature".to_string(), serde_json::json!(temperature));
        Self {
            model: model.to_string(),
            messages,
            stream: false,
            temperature,
            options: Some(options),
        }
    }
}

/// One entry of `/api/tags`. Servers report the identifier as `name`, `model`
/// or both.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ModelDescriptor {
    #[cfg(test)]
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            model: None,
        }
    }

    /// `name` if present and non-empty, else `model`.
    pub fn identifier(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| self.model.as_deref().filter(|m| !m.is_empty()))
    }
}

impl OllamaClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::builder().build().unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ClientError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Network(format!(
                "list models failed: {}",
                response.status()
            )));
        }

        let body = response.json::<Value>().await?;
        let models = body
            .get("models")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ClientError::Protocol("invalid response format: \"models\" array missing".into())
            })?;

        let descriptors: Vec<ModelDescriptor> = models
            .iter()
            .filter_map(|entry| serde_json::from_value::<ModelDescriptor>(entry.clone()).ok())
            .filter(|d| d.identifier().is_some())
            .collect();

        tracing::info!(count = descriptors.len(), "model catalog fetched");
        Ok(descriptors)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(request)
            .send()
            .await?;

        // Error statuses still carry a JSON body; a body without a string
        // `message.content` falls through to the no-response text.
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, model = %request.model, "chat request returned error status");
        }

        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| ClientError::Protocol(format!("invalid chat response: {}", e)))?;

        Ok(body["message"]["content"]
            .as_str()
            .filter(|c| !c.is_empty())
            .unwrap_or(NO_RESPONSE_TEXT)
            .to_string())
    }
}
