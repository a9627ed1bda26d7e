//! `SessionProvider` over the Gemini `streamGenerateContent` REST endpoint.
//!
//! The backend is stateless, so a session keeps its own [`HistoryLog`] and replays it
//! with every request, together with the system instruction and generation config.
//! Replies arrive as server-sent events, one JSON chunk per `data:` line.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    error::{FlowError, Result},
    model::ModelDescriptor,
    session::{
        ChatSession, FragmentStream, HistoryLog, Part, Role, SessionProvider, Turn,
        record_exchange,
    },
};

const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: WireContent,
    contents: Vec<WireContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireBlob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

fn to_wire_part(part: &Part) -> WirePart {
    match part {
        Part::Text(text) => WirePart {
            text: Some(text.clone()),
            inline_data: None,
        },
        Part::InlineData { mime_type, data } => WirePart {
            text: None,
            inline_data: Some(WireBlob {
                mime_type: mime_type.clone(),
                data: data.clone(),
            }),
        },
    }
}

fn to_wire_content(turn: &Turn) -> WireContent {
    let role = match turn.role {
        Role::User => "user",
        Role::Model => "model",
    };
    WireContent {
        role: Some(role.to_string()),
        parts: turn.parts.iter().map(to_wire_part).collect(),
    }
}

/// Maps an HTTP failure to an error kind, keeping the backend's message as-is.
pub fn classify(status: StatusCode, body: &str) -> FlowError {
    let api_error = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|e| e.error);
    let fallback = || {
        Some(body.trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| status.to_string())
    };
    match api_error {
        Some(e) if !e.message.is_empty() => kind_for(status.as_u16(), &e.status, e.message),
        Some(e) => kind_for(status.as_u16(), &e.status, fallback()),
        None => kind_for(status.as_u16(), "", fallback()),
    }
}

fn kind_for(code: u16, api_status: &str, message: String) -> FlowError {
    match code {
        401 | 403 => FlowError::Auth(message),
        429 => FlowError::Quota(message),
        400 | 404 | 413 if is_invalid_key(&message) => FlowError::Auth(message),
        400 | 404 | 413 => FlowError::BadRequest(message),
        _ if api_status == "RESOURCE_EXHAUSTED" => FlowError::Quota(message),
        _ => FlowError::Transport(message),
    }
}

fn is_invalid_key(message: &str) -> bool {
    message.contains("API key not valid") || message.contains("API_KEY_INVALID")
}

fn classify_stream_error(error: ApiError) -> FlowError {
    let message = if error.message.is_empty() {
        error.status.clone()
    } else {
        error.message
    };
    kind_for(error.code, &error.status, message)
}

/// Text carried by one server-sent-event line, if any.
fn parse_sse_line(line: &str) -> Result<Option<String>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| FlowError::Transport(format!("malformed stream chunk: {e}")))?;
    if let Some(error) = chunk.error {
        return Err(classify_stream_error(error));
    }
    if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(FlowError::BadRequest(format!("prompt blocked: {reason}")));
    }

    let text: String = chunk
        .candidates
        .into_iter()
        .take(1)
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .filter_map(|p| p.text)
        .collect();
    Ok(Some(text).filter(|t| !t.is_empty()))
}

fn line_error(err: LinesCodecError) -> FlowError {
    match err {
        LinesCodecError::Io(io) => FlowError::Transport(io.to_string()),
        LinesCodecError::MaxLineLengthExceeded => {
            FlowError::Transport("stream line exceeds maximum length".to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    endpoint: String,
    max_output_tokens: u32,
}

impl GeminiProvider {
    pub fn new(
        endpoint: impl Into<String>,
        max_output_tokens: u32,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FlowError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            max_output_tokens,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.endpoint.clone(),
            settings.max_output_tokens,
            settings.timeout(),
        )
    }
}

#[async_trait]
impl SessionProvider for GeminiProvider {
    async fn open_with_history(
        &self,
        api_key: &str,
        model: &ModelDescriptor,
        system_instruction: &str,
        history: Vec<Turn>,
    ) -> Result<Box<dyn ChatSession>> {
        if api_key.trim().is_empty() {
            return Err(FlowError::Auth("API key is empty".to_string()));
        }
        debug!(model = %model.id, history_turns = history.len(), "Opening Gemini session");
        Ok(Box::new(GeminiSession {
            client: self.client.clone(),
            url: format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.endpoint, model.id
            ),
            api_key: api_key.to_string(),
            model: model.clone(),
            system_instruction: system_instruction.to_string(),
            max_output_tokens: self.max_output_tokens,
            history: HistoryLog::new(history),
        }))
    }
}

struct GeminiSession {
    client: Client,
    url: String,
    api_key: String,
    model: ModelDescriptor,
    system_instruction: String,
    max_output_tokens: u32,
    history: HistoryLog,
}

impl GeminiSession {
    fn request_body(&self, user_turn: &Turn) -> GenerateRequest {
        let contents = self
            .history
            .snapshot()
            .iter()
            .chain(std::iter::once(user_turn))
            .map(to_wire_content)
            .collect();
        GenerateRequest {
            system_instruction: WireContent {
                role: None,
                parts: vec![to_wire_part(&Part::text(self.system_instruction.clone()))],
            },
            contents,
            generation_config: GenerationConfig {
                max_output_tokens: self.max_output_tokens,
            },
        }
    }
}

#[async_trait]
impl ChatSession for GeminiSession {
    fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    async fn history(&self) -> Result<Vec<Turn>> {
        Ok(self.history.snapshot())
    }

    async fn send_message_stream(&mut self, parts: Vec<Part>) -> Result<FragmentStream> {
        let user_turn = Turn::user(parts);
        let body = self.request_body(&user_turn);
        info!(
            model = %self.model.id,
            turns = body.contents.len(),
            "Requesting streamed generation"
        );

        let response = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FlowError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify(status, &text);
            warn!(model = %self.model.id, status = status.as_u16(), error = %err, "Generation request rejected");
            return Err(err);
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );
        let fragments = lines.filter_map(|line| async move {
            match line {
                Ok(line) => parse_sse_line(&line).transpose(),
                Err(e) => Some(Err(line_error(e))),
            }
        });

        Ok(record_exchange(
            Box::pin(fragments),
            self.history.clone(),
            user_turn,
        ))
    }
}
