//! Native inference backend seam.
//!
//! The llama-style backend is an external collaborator: it can load a model
//! file, create a decoding context, tokenize, decode batches, run a sampler
//! chain and detokenize. These traits capture exactly that surface so the
//! cache and pipeline stay independent of the concrete implementation. The
//! backend handle is created once at startup and handed to the model cache;
//! there are no ambient backend singletons.

pub mod stub;

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

/// A token id in the model's vocabulary.
pub type TokenId = i32;

/// Chat message role/content pair, as fed to chat templates.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Context creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
        }
    }
}

/// Sampler chain parameters, applied in a fixed order: top-k, top-p,
/// temperature, repetition penalties, then the seeded distribution sampler.
#[derive(Debug, Clone, Copy)]
pub struct SamplerParams {
    pub top_k: i32,
    pub top_p: f32,
    pub min_keep: usize,
    pub temperature: f32,
    pub penalty_last_n: i32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub seed: u32,
}

/// Handle to the native backend. Created at startup, dropped at shutdown.
pub trait Backend: Send + Sync {
    /// Backend identifier for logs.
    fn name(&self) -> &str;

    /// Load a model file, offloading `gpu_layers` layers to the GPU.
    fn load_model(&self, path: &Path, gpu_layers: u32) -> Result<Arc<dyn LoadedModel>>;
}

/// A loaded model. Shared read-only between requests; contexts are not.
pub trait LoadedModel: Send + Sync {
    /// Native-reported weight size in bytes.
    fn size_bytes(&self) -> u64;

    /// Architecture string from the model metadata, e.g. `gptoss`.
    fn architecture(&self) -> Option<String>;

    /// Chat template embedded in the model, if any.
    fn chat_template(&self) -> Option<String>;

    /// Apply the model's own chat template to a message sequence, opening
    /// the assistant turn. `None` when the model has no usable template.
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Option<String>;

    /// Create a fresh decoding context.
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn ModelContext>>;

    /// Tokenize `text` into `out`. Returns the number of tokens written, or
    /// a negative value whose magnitude is the required buffer length.
    fn tokenize(&self, text: &str, out: &mut [TokenId], add_special: bool, parse_special: bool)
        -> i32;

    /// Detokenize a single token.
    fn token_to_piece(&self, token: TokenId) -> String;

    /// Whether the token ends generation.
    fn is_eog(&self, token: TokenId) -> bool;
}

/// A decoding context. Never shared between concurrent generations; the
/// cache wraps each context in a lease that serializes access.
pub trait ModelContext: Send {
    /// Batch size the context was created with.
    fn n_batch(&self) -> u32;

    /// Decode a batch of tokens, extending the context state.
    fn decode(&mut self, tokens: &[TokenId]) -> Result<()>;

    /// Install a fresh sampler chain for the coming generation.
    fn start_sampler(&mut self, params: &SamplerParams) -> Result<()>;

    /// Sample the next token from the last decoded position.
    fn sample(&mut self) -> Result<TokenId>;

    /// Accept a sampled token into the sampler state.
    fn accept(&mut self, token: TokenId);
}
