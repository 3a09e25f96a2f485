//! Ollama inference client (OpenAI-compatible API)

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::infrastructure::ports::{InferenceError, InferencePort, InferenceRequest};

/// Default Ollama base URL.
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434";

/// Timeout for health checks and model listing.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for Ollama's OpenAI-compatible API
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    /// `address` may omit the scheme (`localhost:11434`).
    pub fn new(address: &str) -> Self {
        // Per-call deadlines come from the request; only bound connecting here.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: normalize_address(address),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send_chat(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let api_request = OpenAIChatRequest {
            model: request.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: Some(request.prompt.clone()),
            }],
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .timeout(request.timeout)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| map_send_error(e, request.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(map_status(status, &request.model, error_text));
        }

        let api_response: OpenAIChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(request.timeout)
            } else {
                InferenceError::model(format!("invalid response: {e}"))
            }
        })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::model("no choices in response"))?;

        Ok(choice.message.content.unwrap_or_default())
    }

    async fn fetch_tags(&self) -> Result<OllamaTagsResponse, InferenceError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| InferenceError::unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::unavailable(format!(
                "health check returned {status}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| InferenceError::unavailable(format!("invalid tags response: {e}")))
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_BASE_URL)
    }
}

#[async_trait]
impl InferencePort for OllamaClient {
    async fn generate(&self, request: InferenceRequest) -> Result<String, InferenceError> {
        // Dropping the future on expiry aborts the HTTP request.
        match tokio::time::timeout(request.timeout, self.send_chat(&request)).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout(request.timeout)),
        }
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        self.fetch_tags().await.map(|_| ())
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let tags = self.fetch_tags().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

/// Whether `model` is among `available`, treating a missing tag as `:latest`.
pub fn model_is_listed(model: &str, available: &[String]) -> bool {
    available.iter().any(|name| {
        name == model || (!model.contains(':') && name.strip_suffix(":latest") == Some(model))
    })
}

fn normalize_address(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

fn map_send_error(error: reqwest::Error, timeout: Duration) -> InferenceError {
    if error.is_timeout() {
        InferenceError::Timeout(timeout)
    } else {
        InferenceError::unavailable(error.to_string())
    }
}

fn map_status(status: StatusCode, model: &str, body: String) -> InferenceError {
    let lowered = body.to_lowercase();
    if status == StatusCode::NOT_FOUND || (lowered.contains("model") && lowered.contains("not found"))
    {
        return InferenceError::model(format!("model '{model}' not found: {body}"));
    }
    if status.is_server_error() {
        return InferenceError::unavailable(format!("{status}: {body}"));
    }
    InferenceError::model(format!("{status}: {body}"))
}

// =============================================================================
// OpenAI API types
// =============================================================================

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

// =============================================================================
// Ollama native API types
// =============================================================================

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Behavior of the fake backend for chat completions.
    #[derive(Clone)]
    enum ChatReply {
        Text(&'static str),
        Status(u16, &'static str),
        Hang,
    }

    #[derive(Clone)]
    struct FakeBackend {
        reply: ChatReply,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    async fn chat(
        State(backend): State<FakeBackend>,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        backend.seen.lock().await.push(body);
        match backend.reply {
            ChatReply::Text(text) => (
                AxumStatus::OK,
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": text}}]
                })),
            ),
            ChatReply::Status(code, message) => (
                AxumStatus::from_u16(code).unwrap(),
                Json(json!({"error": message})),
            ),
            ChatReply::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                (AxumStatus::OK, Json(json!({"choices": []})))
            }
        }
    }

    async fn tags() -> Json<Value> {
        Json(json!({"models": [{"name": "gemma3:latest"}, {"name": "llama3.2:3b"}]}))
    }

    async fn spawn_backend(reply: ChatReply) -> (String, FakeBackend) {
        let backend = FakeBackend {
            reply,
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(chat))
            .route("/api/tags", get(tags))
            .with_state(backend.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.to_string(), backend)
    }

    fn request(timeout: Duration) -> InferenceRequest {
        InferenceRequest::new("Greet npc_42", "gemma3", timeout)
    }

    #[tokio::test]
    async fn generate_returns_first_choice_text() {
        let (addr, backend) = spawn_backend(ChatReply::Text("Well met, traveller.")).await;
        let client = OllamaClient::new(&addr);

        let text = client.generate(request(Duration::from_secs(5))).await.unwrap();
        assert_eq!(text, "Well met, traveller.");

        let seen = backend.seen.lock().await;
        assert_eq!(seen[0]["model"], "gemma3");
        assert_eq!(seen[0]["messages"][0]["role"], "user");
        assert_eq!(seen[0]["messages"][0]["content"], "Greet npc_42");
        assert_eq!(seen[0]["stream"], false);
    }

    #[tokio::test]
    async fn not_found_is_model_error() {
        let (addr, _) = spawn_backend(ChatReply::Status(404, "model 'gemma3' not found")).await;
        let client = OllamaClient::new(&addr);

        let err = client.generate(request(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, InferenceError::ModelError(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn server_error_is_backend_unavailable() {
        let (addr, _) = spawn_backend(ChatReply::Status(503, "loading")).await;
        let client = OllamaClient::new(&addr);

        let err = client.generate(request(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, InferenceError::BackendUnavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let (addr, _) = spawn_backend(ChatReply::Hang).await;
        let client = OllamaClient::new(&addr);

        let err = client
            .generate(request(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err, InferenceError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = OllamaClient::new(&addr);

        let err = client.generate(request(Duration::from_secs(2))).await.unwrap_err();
        assert!(matches!(err, InferenceError::BackendUnavailable(_)), "got {err:?}");
        assert!(client.health_check().await.is_err());
    }

    #[tokio::test]
    async fn lists_models_and_checks_health() {
        let (addr, _) = spawn_backend(ChatReply::Text("unused")).await;
        let client = OllamaClient::new(&format!("http://{addr}/"));

        client.health_check().await.unwrap();
        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["gemma3:latest", "llama3.2:3b"]);
    }

    #[test]
    fn model_listing_accepts_implicit_latest_tag() {
        let available = vec!["gemma3:latest".to_string(), "llama3.2:3b".to_string()];
        assert!(model_is_listed("gemma3", &available));
        assert!(model_is_listed("gemma3:latest", &available));
        assert!(model_is_listed("llama3.2:3b", &available));
        assert!(!model_is_listed("llama3.2", &available));
        assert!(!model_is_listed("mistral", &available));
    }

    #[test]
    fn address_without_scheme_gets_http() {
        assert_eq!(normalize_address("localhost:11434"), "http://localhost:11434");
        assert_eq!(normalize_address("https://gpu-box:11434/"), "https://gpu-box:11434");
    }
}
