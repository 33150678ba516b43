//! Inference pipeline: tokenize, prefill, sample, post-process.

pub mod params;
pub mod postprocess;
pub mod template;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::backend::{ChatMessage, SamplerParams, TokenId};
use crate::error::{Error, Result};
use crate::manager::LlamaManager;
use crate::storage::ModelStorage;

pub use params::InferenceParams;
pub use template::TemplateKind;

/// End-of-stream sentinel emitted through streaming callbacks.
pub const DONE_SENTINEL: &str = "[DONE]";

struct PipelineDeps {
    storage: Arc<ModelStorage>,
    manager: Arc<LlamaManager>,
}

/// Blocking generation pipeline. Callers on async runtimes run it under
/// `spawn_blocking`; a generation holds its entry's context lease for the
/// whole call.
pub struct InferencePipeline {
    deps: Option<PipelineDeps>,
}

impl InferencePipeline {
    pub fn new(storage: Arc<ModelStorage>, manager: Arc<LlamaManager>) -> Self {
        Self {
            deps: Some(PipelineDeps { storage, manager }),
        }
    }

    /// Pipeline without a backend: echoes the last message. Used in tests
    /// and when no native backend is wired up.
    pub fn stub() -> Self {
        Self { deps: None }
    }

    pub fn is_stub(&self) -> bool {
        self.deps.is_none()
    }

    /// Generate a chat response.
    pub fn generate_chat(
        &self,
        messages: &[ChatMessage],
        model_name: &str,
        params: &InferenceParams,
    ) -> Result<String> {
        let Some(deps) = &self.deps else {
            warn!("Inference pipeline running in stub mode");
            return Ok(stub_response(messages));
        };
        self.run(deps, messages, model_name, params, None)
    }

    /// Generate a completion: chat with a single user message.
    pub fn generate_completion(
        &self,
        prompt: &str,
        model_name: &str,
        params: &InferenceParams,
    ) -> Result<String> {
        let messages = [ChatMessage::new("user", prompt)];
        self.generate_chat(&messages, model_name, params)
    }

    /// Streaming chat generation. Each produced piece goes through
    /// `on_piece`, followed by the `[DONE]` sentinel.
    pub fn generate_chat_stream<F>(
        &self,
        messages: &[ChatMessage],
        model_name: &str,
        params: &InferenceParams,
        mut on_piece: F,
    ) -> Result<String>
    where
        F: FnMut(&str),
    {
        let Some(deps) = &self.deps else {
            warn!("Inference pipeline running in stub mode for streaming");
            let text = stub_response(messages);
            for word in text.split_whitespace().take(params.max_tokens) {
                on_piece(word);
            }
            on_piece(DONE_SENTINEL);
            return Ok(text);
        };

        let output = self.run(deps, messages, model_name, params, Some(&mut on_piece))?;
        on_piece(DONE_SENTINEL);
        Ok(output)
    }

    fn run(
        &self,
        deps: &PipelineDeps,
        messages: &[ChatMessage],
        model_name: &str,
        params: &InferenceParams,
        mut on_piece: Option<&mut dyn FnMut(&str)>,
    ) -> Result<String> {
        // Resolve the model path; the fixed models directory is the only
        // source consulted.
        let path = deps
            .storage
            .resolve(model_name)
            .ok_or_else(|| Error::ModelNotFound(model_name.to_string()))?;

        let lease = deps.manager.acquire(&path)?;
        let model = lease.model.as_ref();

        // gpt-oss detection looks at the architecture, the model's embedded
        // template, and the template stored in metadata.json.
        let mut kind = TemplateKind::detect(model);
        if kind == TemplateKind::ChatMl {
            if let Some(stored) = deps.storage.chat_template(model_name) {
                if stored.contains("<|start|>") || stored.contains("<|message|>") {
                    kind = TemplateKind::GptOss;
                }
            }
        }
        let prompt = template::build_prompt(model, kind, messages);
        debug!("Prompt: {} chars, template {:?}", prompt.len(), kind);

        // gpt-oss templates carry their own specials: skip BOS insertion and
        // let the tokenizer parse the control tokens.
        let is_gptoss = kind == TemplateKind::GptOss;
        let (add_special, parse_special) = if is_gptoss { (false, true) } else { (true, false) };

        let mut tokens: Vec<TokenId> = vec![0; prompt.len() + 128];
        let mut n_tokens = model.tokenize(&prompt, &mut tokens, add_special, parse_special);
        if n_tokens < 0 {
            tokens.resize(n_tokens.unsigned_abs() as usize, 0);
            n_tokens = model.tokenize(&prompt, &mut tokens, add_special, parse_special);
        }
        if n_tokens < 0 {
            return Err(Error::Inference("failed to tokenize prompt".to_string()));
        }
        tokens.truncate(n_tokens as usize);
        debug!("Tokenized prompt: {} tokens", n_tokens);

        let mut ctx = lease.context.lock().unwrap();

        // Prefill in n_batch chunks.
        let batch_size = ctx.n_batch().max(1) as usize;
        for chunk in tokens.chunks(batch_size) {
            ctx.decode(chunk)
                .map_err(|err| Error::Inference(format!("prompt decode failed: {}", err)))?;
        }

        let seed = if params.seed == 0 { clock_seed() } else { params.seed };
        ctx.start_sampler(&SamplerParams {
            top_k: params.top_k,
            top_p: params.top_p,
            min_keep: 1,
            temperature: params.temperature,
            penalty_last_n: 64,
            repeat_penalty: params.repeat_penalty,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed,
        })
        .map_err(|err| Error::Inference(format!("sampler init failed: {}", err)))?;

        let mut output = String::new();
        let mut stopped = false;

        for position in 0..params.max_tokens {
            let token = ctx
                .sample()
                .map_err(|err| Error::Inference(format!("sampling failed: {}", err)))?;
            if model.is_eog(token) {
                debug!("EOG token at position {}", position);
                break;
            }

            let piece = model.token_to_piece(token);
            if !piece.is_empty() {
                output.push_str(&piece);

                if let Some(callback) = on_piece.as_deref_mut() {
                    // Stop detection runs on the accumulated buffer so a
                    // stop sequence straddling two pieces is still caught.
                    if let Some((pos, stop)) = postprocess::find_stop(&output) {
                        debug!("Streaming hit stop sequence '{}' at {}", stop, pos);
                        let piece_start = output.len() - piece.len();
                        if pos > piece_start {
                            // The stop begins inside this piece: emit only
                            // the prefix before it.
                            callback(&piece[..pos - piece_start]);
                        }
                        output.truncate(pos);
                        stopped = true;
                        break;
                    }
                    callback(&piece);
                }
            }

            ctx.accept(token);
            if let Err(err) = ctx.decode(&[token]) {
                warn!("Decode failed during generation: {}", err);
                break;
            }
        }
        drop(ctx);

        let mut text = if stopped {
            output
        } else {
            postprocess::truncate_at_stop(&output).to_string()
        };

        // Streamed pieces were already delivered raw; cleanup only applies
        // to the buffered response.
        if is_gptoss && on_piece.is_none() {
            text = postprocess::postprocess_gpt_oss(&text);
        }

        Ok(text)
    }
}

fn stub_response(messages: &[ChatMessage]) -> String {
    match messages.last() {
        Some(message) => format!("Response to: {}", message.content),
        None => String::new(),
    }
}

fn clock_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() & 0xFFFF_FFFF) as u32)
        .unwrap_or(1)
}
