//! OpenAI-compatible endpoints.

use std::convert::Infallible;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::State,
    response::{sse::Event, IntoResponse, Response, Sse},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use kraal_core::{ChatMessage, InferenceParams, DONE_SENTINEL};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub max_completion_tokens: Option<usize>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub seed: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    pub content: InboundContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Parts(Vec<InboundContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundContentPart {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Serialize)]
struct ChatChoice {
    index: usize,
    message: AssistantMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct AssistantMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatChunk {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
struct ChunkChoice {
    index: usize,
    delta: Delta,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn flatten_content(content: InboundContent) -> String {
    match content {
        InboundContent::Text(text) => text,
        InboundContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn to_core_messages(messages: Vec<InboundMessage>) -> Result<Vec<ChatMessage>, ApiError> {
    messages
        .into_iter()
        .map(|message| {
            let role = message.role.trim().to_ascii_lowercase();
            match role.as_str() {
                "system" | "user" | "assistant" => {}
                other => {
                    return Err(ApiError::bad_request(
                        "invalid_role",
                        format!("Unsupported chat message role: {}", other),
                    ))
                }
            }
            Ok(ChatMessage::new(role, flatten_content(message.content)))
        })
        .collect()
}

fn to_params(req: &ChatCompletionRequest) -> InferenceParams {
    let mut params = InferenceParams::default();
    if let Some(max) = req.max_completion_tokens.or(req.max_tokens) {
        params.max_tokens = max.clamp(1, 4096);
    }
    if let Some(temperature) = req.temperature {
        params.temperature = temperature;
    }
    if let Some(top_p) = req.top_p {
        params.top_p = top_p;
    }
    if let Some(seed) = req.seed {
        params.seed = seed;
    }
    params
}

async fn validate_model(state: &AppState, model: &str) -> Result<(), ApiError> {
    if model.is_empty() {
        return Err(ApiError::bad_request("model_required", "model is required"));
    }
    if !state.has_model(model).await {
        return Err(ApiError::not_found("model_not_found", "model not found"));
    }
    Ok(())
}

/// `GET /v1/models` - the synced router registry.
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .model_ids()
        .await
        .into_iter()
        .map(|id| serde_json::json!({"id": id, "object": "model"}))
        .collect();
    Json(serde_json::json!({"object": "list", "data": data}))
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if req.n.unwrap_or(1) != 1 {
        return Err(ApiError::bad_request(
            "invalid_request",
            "This server currently supports only `n=1` for chat completions",
        ));
    }

    validate_model(&state, &req.model).await?;

    let messages = to_core_messages(req.messages.clone())?;
    if messages.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_request",
            "Chat request must include at least one message",
        ));
    }

    if req.stream.unwrap_or(false) {
        let stream_response = chat_stream(state, req, messages).await?;
        return Ok(stream_response.into_response());
    }

    let params = to_params(&req);
    let _permit = state.acquire_permit().await;
    let _active = state.begin_request();

    let output = state
        .coordinator
        .chat(messages, &req.model, params)
        .await
        .map_err(ApiError::from)?;

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion",
        created: now_unix_secs(),
        model: req.model,
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content: output,
            },
            finish_reason: "stop",
        }],
    };

    Ok(Json(response).into_response())
}

async fn chat_stream(
    state: AppState,
    req: ChatCompletionRequest,
    messages: Vec<ChatMessage>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Streaming cannot change its mind after the first byte, so the repair
    // gate runs before the SSE response starts.
    state
        .coordinator
        .ensure_servable(&req.model)
        .await
        .map_err(ApiError::from)?;

    let params = to_params(&req);
    let completion_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let created = now_unix_secs();
    let model_id = req.model.clone();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();

    let task_state = state.clone();
    let task_model = model_id.clone();
    let task_id = completion_id.clone();
    tokio::spawn(async move {
        let _permit = task_state.acquire_permit().await;
        let _active = task_state.begin_request();

        let start_chunk = ChatChunk {
            id: task_id.clone(),
            object: "chat.completion.chunk",
            created,
            model: task_model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: Some("assistant"),
                    content: None,
                },
                finish_reason: None,
            }],
        };
        let _ = event_tx.send(serde_json::to_string(&start_chunk).unwrap_or_default());

        let delta_tx = event_tx.clone();
        let delta_id = task_id.clone();
        let delta_model = task_model.clone();
        let result = task_state
            .coordinator
            .chat_stream(messages, &task_model, params, move |piece| {
                if piece == DONE_SENTINEL {
                    return;
                }
                let chunk = ChatChunk {
                    id: delta_id.clone(),
                    object: "chat.completion.chunk",
                    created,
                    model: delta_model.clone(),
                    choices: vec![ChunkChoice {
                        index: 0,
                        delta: Delta {
                            role: None,
                            content: Some(piece.to_string()),
                        },
                        finish_reason: None,
                    }],
                };
                let _ = delta_tx.send(serde_json::to_string(&chunk).unwrap_or_default());
            })
            .await;

        match result {
            Ok(_) => {
                let final_chunk = ChatChunk {
                    id: task_id,
                    object: "chat.completion.chunk",
                    created,
                    model: task_model,
                    choices: vec![ChunkChoice {
                        index: 0,
                        delta: Delta {
                            role: None,
                            content: None,
                        },
                        finish_reason: Some("stop"),
                    }],
                };
                let _ = event_tx.send(serde_json::to_string(&final_chunk).unwrap_or_default());
            }
            Err(err) => {
                let _ = event_tx.send(
                    serde_json::json!({
                        "error": {
                            "message": err.to_string(),
                            "type": "server_error"
                        }
                    })
                    .to_string(),
                );
            }
        }

        let _ = event_tx.send(DONE_SENTINEL.to_string());
    });

    let stream = async_stream::stream! {
        while let Some(event) = event_rx.recv().await {
            yield Ok(Event::default().data(event.clone()));
            if event == DONE_SENTINEL {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub seed: Option<u32>,
}

/// `POST /v1/completions`
pub async fn completions(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    validate_model(&state, &req.model).await?;

    let mut params = InferenceParams::default();
    if let Some(max) = req.max_tokens {
        params.max_tokens = max.clamp(1, 4096);
    }
    if let Some(temperature) = req.temperature {
        params.temperature = temperature;
    }
    if let Some(seed) = req.seed {
        params.seed = seed;
    }

    let _permit = state.acquire_permit().await;
    let _active = state.begin_request();

    let output = state
        .coordinator
        .completion(req.prompt, &req.model, params)
        .await
        .map_err(ApiError::from)?;

    let response = serde_json::json!({
        "id": format!("cmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "text_completion",
        "created": now_unix_secs(),
        "model": req.model,
        "choices": [{"text": output, "index": 0, "finish_reason": "stop"}]
    });
    Ok(Json(response).into_response())
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// `POST /v1/embeddings` - placeholder vector, as the native backend does
/// not expose an embedding head.
pub async fn embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingsRequest>,
) -> Result<Response, ApiError> {
    validate_model(&state, &req.model).await?;

    let input_len = req.input.to_string().len();
    let response = serde_json::json!({
        "object": "list",
        "data": [{"object": "embedding", "embedding": [1.0, 0.0, -1.0], "index": 0}],
        "model": req.model,
        "usage": {"prompt_tokens": input_len, "total_tokens": input_len}
    });
    Ok(Json(response).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_text_parts_content() {
        let flattened = flatten_content(InboundContent::Parts(vec![
            InboundContentPart {
                kind: Some("text".to_string()),
                text: Some("hello".to_string()),
            },
            InboundContentPart {
                kind: Some("text".to_string()),
                text: Some("world".to_string()),
            },
        ]));
        assert_eq!(flattened, "hello\nworld");
    }

    #[test]
    fn rejects_unknown_roles() {
        let err = to_core_messages(vec![InboundMessage {
            role: "robot".into(),
            content: InboundContent::Text("hi".into()),
        }])
        .unwrap_err();
        assert!(err.message.contains("robot"));
    }

    #[test]
    fn params_clamp_max_tokens() {
        let req = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![],
            max_tokens: Some(100_000),
            max_completion_tokens: None,
            stream: None,
            n: None,
            temperature: Some(0.2),
            top_p: None,
            seed: Some(7),
        };
        let params = to_params(&req);
        assert_eq!(params.max_tokens, 4096);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.seed, 7);
    }
}
