//! Minimal client for the Gemini `generateContent` and `streamGenerateContent` endpoints.
//!
//! Only the pieces this application needs are modelled: text parts, a system
//! instruction, and the generation config used for structured output.

use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

use crate::constants;

/// Lazy, finite stream of reply text chunks for one request.
pub type TextStream = BoxStream<'static, Result<String, GeminiError>>;

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("Gemini API key is not configured")]
    MissingApiKey,
    #[error("request to Gemini failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Gemini API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode Gemini response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Gemini response contained no text")]
    EmptyResponse,
    #[error("reply stream interrupted: {0}")]
    Stream(String),
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            // An empty variable counts as unset.
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model: constants::DEFAULT_MODEL.to_string(),
            base_url: constants::DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Some("user"), text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::with_role(Some("model"), text)
    }

    /// Content without a role, as used for `systemInstruction`.
    pub fn instruction(text: impl Into<String>) -> Self {
        Self::with_role(None, text)
    }

    fn with_role(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: Some(text.into()),
            }],
        }
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Set when the API reports a failure inside a 200 body, e.g. mid-stream.
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl From<ApiErrorBody> for GeminiError {
    fn from(error: ApiErrorBody) -> Self {
        GeminiError::Api {
            status: error.code,
            body: match error.status {
                Some(status) => format!("{}: {}", status, error.message),
                None => error.message,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Text of the first candidate, or an empty string.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(Content::text)
            .unwrap_or_default()
    }
}

/// Called once with the full reply text when a stream ends cleanly.
type CompletionHook = Box<dyn FnOnce(String) + Send>;

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn api_key(&self) -> Result<&str, GeminiError> {
        self.config
            .api_key
            .as_deref()
            .ok_or(GeminiError::MissingApiKey)
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            method
        )
    }

    async fn post(
        &self,
        url: &str,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, GeminiError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", self.api_key()?)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %body, "Gemini API request failed");
            return Err(GeminiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    #[instrument(skip(self, request), fields(model = %self.config.model))]
    pub async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GeminiError> {
        let url = self.endpoint("generateContent");
        let response = self.post(&url, request).await?;
        let body = response.text().await?;
        debug!(bytes = body.len(), "Received Gemini response");
        let mut response: GenerateContentResponse = serde_json::from_str(&body)?;
        if let Some(error) = response.error.take() {
            return Err(error.into());
        }
        Ok(response)
    }

    /// Opens a streaming request and returns the reply as text chunks in arrival order.
    /// `on_complete` gets the whole reply only if the stream ends cleanly.
    #[instrument(skip(self, request, on_complete), fields(model = %self.config.model))]
    async fn open_stream(
        &self,
        request: &GenerateContentRequest,
        on_complete: CompletionHook,
    ) -> Result<TextStream, GeminiError> {
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let response = self.post(&url, request).await?;

        let (tx, rx) = mpsc::channel(constants::STREAM_CHANNEL_CAPACITY);
        tokio::spawn(forward_sse(response, tx, on_complete));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    /// Creates a conversational session. Purely local: no request is made until the first turn.
    pub fn start_chat(&self, system_instruction: &str) -> Result<GeminiChatSession, GeminiError> {
        self.api_key()?;
        Ok(GeminiChatSession {
            client: self.clone(),
            system_instruction: Content::instruction(system_instruction),
            history: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

/// A chat with remembered history. Clones share the same history.
#[derive(Clone)]
pub struct GeminiChatSession {
    client: GeminiClient,
    system_instruction: Content,
    history: Arc<Mutex<Vec<Content>>>,
}

impl GeminiChatSession {
    pub fn history(&self) -> Vec<Content> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sends one user turn. The turn and the reply join the history only if the
    /// reply stream completes without error.
    pub async fn stream_message(&self, message: String) -> Result<TextStream, GeminiError> {
        let user_turn = Content::user(message);
        let mut contents = self.history();
        contents.push(user_turn.clone());

        let request = GenerateContentRequest {
            contents,
            system_instruction: Some(self.system_instruction.clone()),
            generation_config: None,
        };

        let history = Arc::clone(&self.history);
        let on_complete: CompletionHook = Box::new(move |reply| {
            let mut history = history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            history.push(user_turn);
            history.push(Content::model(reply));
        });

        self.client.open_stream(&request, on_complete).await
    }
}

async fn forward_sse(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<String, GeminiError>>,
    on_complete: CompletionHook,
) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut reply = String::new();

    loop {
        let events = match body.next().await {
            Some(Ok(bytes)) => decoder.push(&bytes),
            Some(Err(e)) => {
                warn!("Reply stream broke: {}", e);
                let _ = tx.send(Err(GeminiError::Stream(e.to_string()))).await;
                return;
            }
            None => decoder.finish(),
        };
        let finished = decoder.is_finished();

        for data in events {
            match chunk_text(&data) {
                Ok(Some(text)) => {
                    reply.push_str(&text);
                    if tx.send(Ok(text)).await.is_err() {
                        debug!("Reply consumer went away, stopping stream");
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Reply stream failed: {}", e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        if finished {
            break;
        }
    }

    // A blocked or empty reply must not enter the history.
    if reply.is_empty() {
        warn!("Reply stream ended without any text");
        let _ = tx.send(Err(GeminiError::EmptyResponse)).await;
        return;
    }
    on_complete(reply);
}

/// Text carried by one SSE `data:` payload, `None` when it has no text.
/// An `error` payload fails the stream.
fn chunk_text(data: &str) -> Result<Option<String>, GeminiError> {
    if data.trim() == "[DONE]" {
        return Ok(None);
    }
    let mut response: GenerateContentResponse = serde_json::from_str(data)?;
    if let Some(error) = response.error.take() {
        return Err(error.into());
    }
    let text = response.text();
    Ok((!text.is_empty()).then_some(text))
}

/// Incremental Server-Sent Events decoder yielding the `data` of each event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    finished: bool,
}

impl SseDecoder {
    /// Feeds raw bytes and returns every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    /// Flushes a trailing line and any event not closed by a blank line.
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        self.dispatch(&mut events);
        self.finished = true;
        events
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            self.dispatch(events);
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // Comments, `event:`, `id:` and `retry:` lines carry nothing we use.
    }

    fn dispatch(&mut self, events: &mut Vec<String>) {
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
            self.data.clear();
        }
    }
}
