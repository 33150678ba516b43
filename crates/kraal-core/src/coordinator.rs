//! Request coordinator: glue between storage, repair, cache and pipeline.
//!
//! Stateless orchestration for one request: resolve the model, gate on
//! repair state, then hand off to the blocking pipeline. A corrupt model
//! kicks off a background repair and surfaces the distinct `Repairing`
//! signal instead of blocking a worker; a failed native load retries once
//! after an inline repair when auto-repair is enabled.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::ChatMessage;
use crate::engine::{InferencePipeline, InferenceParams};
use crate::error::{Error, Result};
use crate::repair::{self, RepairCoordinator, RepairStatus};
use crate::storage::ModelStorage;

/// Wires the per-request flow. The downloader never sees the cache and the
/// cache never sees the downloader; this is the only place they meet.
pub struct RequestCoordinator {
    storage: Arc<ModelStorage>,
    pipeline: Arc<InferencePipeline>,
    repair: Option<Arc<RepairCoordinator>>,
    repair_timeout: Duration,
}

impl RequestCoordinator {
    pub fn new(storage: Arc<ModelStorage>, pipeline: Arc<InferencePipeline>) -> Self {
        Self {
            storage,
            pipeline,
            repair: None,
            repair_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_repair(mut self, repair: Arc<RepairCoordinator>, timeout: Duration) -> Self {
        self.repair = Some(repair);
        self.repair_timeout = timeout;
        self
    }

    pub fn auto_repair_enabled(&self) -> bool {
        self.repair.is_some()
    }

    /// Serve one chat request.
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model_name: &str,
        params: InferenceParams,
    ) -> Result<String> {
        self.gate_on_repair(model_name).await?;

        match self.run_chat(messages.clone(), model_name, params, None).await {
            Ok(output) => Ok(output),
            Err(err) => {
                // When the load failed and auto-repair is on, repair once
                // and rerun the request.
                let Some(repair) = &self.repair else {
                    return Err(err);
                };
                if !err.is_repairable() {
                    return Err(err);
                }
                info!(
                    "Inference failed with repairable error ({}), repairing {}",
                    err, model_name
                );
                let outcome = repair.repair(model_name, self.repair_timeout, None).await;
                if outcome.status != RepairStatus::Success {
                    return Err(err);
                }
                self.run_chat(messages, model_name, params, None).await
            }
        }
    }

    /// Serve one streaming chat request. `on_piece` receives each produced
    /// piece and finally the `[DONE]` sentinel.
    pub async fn chat_stream<F>(
        &self,
        messages: Vec<ChatMessage>,
        model_name: &str,
        params: InferenceParams,
        on_piece: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.gate_on_repair(model_name).await?;
        // No transparent retry here: pieces may already be on the wire.
        self.run_chat(messages, model_name, params, Some(Box::new(on_piece)))
            .await
    }

    /// Serve one completion request.
    pub async fn completion(
        &self,
        prompt: String,
        model_name: &str,
        params: InferenceParams,
    ) -> Result<String> {
        let messages = vec![ChatMessage::new("user", prompt)];
        self.chat(messages, model_name, params).await
    }

    /// Pre-flight check for transports that cannot switch responses once
    /// streaming has begun.
    pub async fn ensure_servable(&self, model_name: &str) -> Result<()> {
        self.gate_on_repair(model_name).await
    }

    /// Check the on-disk state before touching the cache. A model already
    /// under repair answers `Repairing` immediately; a corrupt model starts
    /// a background repair and answers the same way.
    async fn gate_on_repair(&self, model_name: &str) -> Result<()> {
        let Some(repair) = &self.repair else {
            return Ok(());
        };

        if repair.is_repairing(model_name) {
            return Err(Error::Repairing {
                model: model_name.to_string(),
            });
        }

        if let Some(path) = self.storage.resolve(model_name) {
            if repair::needs_repair(&path) {
                info!(
                    "Model {} fails corruption checks, starting background repair",
                    model_name
                );
                let repair = repair.clone();
                let name = model_name.to_string();
                let timeout = self.repair_timeout;
                tokio::spawn(async move {
                    let result = repair.repair(&name, timeout, None).await;
                    if result.status != RepairStatus::Success {
                        warn!(
                            "Background repair of {} failed: {}",
                            name,
                            result.error.unwrap_or_default()
                        );
                    }
                });
                return Err(Error::Repairing {
                    model: model_name.to_string(),
                });
            }
        }

        Ok(())
    }

    async fn run_chat(
        &self,
        messages: Vec<ChatMessage>,
        model_name: &str,
        params: InferenceParams,
        on_piece: Option<Box<dyn FnMut(&str) + Send>>,
    ) -> Result<String> {
        let pipeline = self.pipeline.clone();
        let model_name = model_name.to_string();
        tokio::task::spawn_blocking(move || match on_piece {
            Some(mut callback) => pipeline.generate_chat_stream(
                &messages,
                &model_name,
                &params,
                move |piece| callback(piece),
            ),
            None => pipeline.generate_chat(&messages, &model_name, &params),
        })
        .await
        .map_err(|err| Error::Inference(format!("inference task failed: {}", err)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::StubBackend;
    use crate::manager::LlamaManager;
    use std::io::Write;

    fn write_gguf(dir: &std::path::Path, dir_name: &str, magic: &[u8]) {
        let model_dir = dir.join(dir_name);
        std::fs::create_dir_all(&model_dir).unwrap();
        let mut body = magic.to_vec();
        body.resize(4096, 0);
        std::fs::File::create(model_dir.join("model.gguf"))
            .unwrap()
            .write_all(&body)
            .unwrap();
    }

    fn coordinator(dir: &std::path::Path, backend: StubBackend) -> RequestCoordinator {
        let storage = Arc::new(ModelStorage::new(dir));
        let manager = Arc::new(LlamaManager::new(dir, Arc::new(backend)));
        let pipeline = Arc::new(InferencePipeline::new(storage.clone(), manager));
        RequestCoordinator::new(storage, pipeline)
    }

    #[tokio::test]
    async fn chat_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        write_gguf(tmp.path(), "gpt-oss_7b", b"GGUF");
        let coordinator = coordinator(tmp.path(), StubBackend::new().with_script(["pong"]));

        let out = coordinator
            .chat(
                vec![ChatMessage::new("user", "ping")],
                "gpt-oss:7b",
                InferenceParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, "pong");
    }

    #[tokio::test]
    async fn missing_model_surfaces_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(tmp.path(), StubBackend::new());

        let err = coordinator
            .chat(
                vec![ChatMessage::new("user", "hi")],
                "missing:1b",
                InferenceParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn completion_delegates_to_chat() {
        let tmp = tempfile::tempdir().unwrap();
        write_gguf(tmp.path(), "gpt-oss_7b", b"GGUF");
        let coordinator = coordinator(tmp.path(), StubBackend::new().with_script(["done"]));

        let out = coordinator
            .completion("say done".into(), "gpt-oss:7b", InferenceParams::default())
            .await
            .unwrap();
        assert_eq!(out, "done");
    }
}
