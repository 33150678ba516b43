//! Deterministic stub backend.
//!
//! Stands in for the native llama backend in tests and backend-less
//! deployments: loading only checks that the file exists, tokenization is
//! whitespace splitting, and generation replays a configured script of
//! pieces followed by an end-of-generation token.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::backend::{
    Backend, ChatMessage, ContextParams, LoadedModel, ModelContext, SamplerParams, TokenId,
};
use crate::error::{Error, Result};

const EOG_TOKEN: TokenId = 0;
const SCRIPT_BASE: TokenId = 1_000_000;

/// Backend that loads any existing file and generates a fixed script.
pub struct StubBackend {
    script: Vec<String>,
    architecture: Option<String>,
    chat_template: Option<String>,
    fail_load: bool,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            architecture: None,
            chat_template: None,
            fail_load: false,
        }
    }

    /// Pieces emitted, in order, by every generation.
    pub fn with_script<I, S>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = pieces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    pub fn with_chat_template(mut self, template: impl Into<String>) -> Self {
        self.chat_template = Some(template.into());
        self
    }

    /// Make every load fail, for exercising the repair-and-retry path.
    pub fn failing(mut self) -> Self {
        self.fail_load = true;
        self
    }
}

impl Backend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn load_model(&self, path: &Path, _gpu_layers: u32) -> Result<Arc<dyn LoadedModel>> {
        if self.fail_load {
            return Err(Error::LoadFailed(format!(
                "stub backend refusing to load {}",
                path.display()
            )));
        }
        let meta = std::fs::metadata(path)
            .map_err(|err| Error::LoadFailed(format!("{}: {}", path.display(), err)))?;
        Ok(Arc::new(StubModel {
            size_bytes: meta.len(),
            architecture: self.architecture.clone(),
            chat_template: self.chat_template.clone(),
            script: Arc::new(self.script.clone()),
            vocab: Mutex::new(Vocab::default()),
        }))
    }
}

#[derive(Default)]
struct Vocab {
    ids: HashMap<String, TokenId>,
    pieces: Vec<String>,
}

impl Vocab {
    fn intern(&mut self, word: &str) -> TokenId {
        if let Some(id) = self.ids.get(word) {
            return *id;
        }
        self.pieces.push(word.to_string());
        // Ids start at 1; 0 is reserved for end-of-generation.
        let id = self.pieces.len() as TokenId;
        self.ids.insert(word.to_string(), id);
        id
    }

    fn piece(&self, id: TokenId) -> Option<&str> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.pieces.get(idx).map(String::as_str)
    }
}

struct StubModel {
    size_bytes: u64,
    architecture: Option<String>,
    chat_template: Option<String>,
    script: Arc<Vec<String>>,
    vocab: Mutex<Vocab>,
}

impl LoadedModel for StubModel {
    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn architecture(&self) -> Option<String> {
        self.architecture.clone()
    }

    fn chat_template(&self) -> Option<String> {
        self.chat_template.clone()
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Option<String> {
        self.chat_template.as_ref()?;
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str(&format!(
                "<|im_start|>{}\n{}<|im_end|>\n",
                message.role, message.content
            ));
        }
        prompt.push_str("<|im_start|>assistant\n");
        Some(prompt)
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn ModelContext>> {
        Ok(Box::new(StubContext {
            n_batch: params.n_batch,
            script: self.script.clone(),
            cursor: 0,
            decoded: 0,
        }))
    }

    fn tokenize(
        &self,
        text: &str,
        out: &mut [TokenId],
        _add_special: bool,
        _parse_special: bool,
    ) -> i32 {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() > out.len() {
            return -(words.len() as i32);
        }
        let mut vocab = self.vocab.lock().unwrap();
        for (slot, word) in out.iter_mut().zip(&words) {
            *slot = vocab.intern(word);
        }
        words.len() as i32
    }

    fn token_to_piece(&self, token: TokenId) -> String {
        if token >= SCRIPT_BASE {
            let idx = (token - SCRIPT_BASE) as usize;
            return self.script.get(idx).cloned().unwrap_or_default();
        }
        self.vocab
            .lock()
            .unwrap()
            .piece(token)
            .map(|p| p.to_string())
            .unwrap_or_default()
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }
}

struct StubContext {
    n_batch: u32,
    script: Arc<Vec<String>>,
    cursor: usize,
    decoded: usize,
}

impl ModelContext for StubContext {
    fn n_batch(&self) -> u32 {
        self.n_batch
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<()> {
        self.decoded += tokens.len();
        Ok(())
    }

    fn start_sampler(&mut self, _params: &SamplerParams) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn sample(&mut self) -> Result<TokenId> {
        if self.cursor >= self.script.len() {
            return Ok(EOG_TOKEN);
        }
        let token = SCRIPT_BASE + self.cursor as TokenId;
        self.cursor += 1;
        Ok(token)
    }

    fn accept(&mut self, _token: TokenId) {}
}
