//! Kraal Core - model lifecycle and inference for a GGUF worker node
//!
//! This crate is the serving core of a kraal node: it keeps the local model
//! set in sync with a router catalog, loads GGUF models on demand through a
//! pluggable native backend, repairs corrupt files, and runs the chat /
//! completion pipeline.
//!
//! # Architecture
//!
//! Leaves first: checksum and path layout feed storage; the downloader and
//! sync engine maintain the models directory; the cache owns loaded models
//! and their contexts; the pipeline borrows a context per call; the request
//! coordinator wires repair, cache and pipeline for one request. Layers
//! never reach back up - the downloader knows nothing about the cache, and
//! the cache knows nothing about the downloader.

pub mod backend;
pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod engine;
pub mod error;
pub mod manager;
pub mod repair;
pub mod storage;

pub use backend::{Backend, ChatMessage, LoadedModel, ModelContext};
pub use config::{CacheConfig, DownloadConfig, NodeConfig};
pub use coordinator::RequestCoordinator;
pub use download::{
    BlobDownloader, DownloadOptions, Manifest, ManifestFile, ModelSync, ProgressCallback,
    RemoteModel, SyncOutcome, SyncState, SyncStatus,
};
pub use engine::{InferenceParams, InferencePipeline, DONE_SENTINEL};
pub use error::{Error, Result};
pub use manager::{LlamaManager, ModelLease};
pub use repair::{needs_repair, RepairCoordinator, RepairResult, RepairStatus};
pub use storage::{ModelRecord, ModelStorage};
