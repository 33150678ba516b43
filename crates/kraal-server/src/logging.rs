//! Logging initialization with a runtime-adjustable level.

use std::sync::{Arc, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, reload, EnvFilter, Registry};

/// Handle to the active log filter, driven by `/log/level`.
pub struct LogLevel {
    handle: reload::Handle<EnvFilter, Registry>,
    current: RwLock<String>,
}

impl LogLevel {
    pub fn get(&self) -> String {
        self.current.read().unwrap().clone()
    }

    pub fn set(&self, level: &str) -> Result<(), String> {
        let level = level.trim().to_ascii_lowercase();
        match level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("unknown log level: {}", other)),
        }
        self.handle
            .reload(EnvFilter::new(&level))
            .map_err(|err| err.to_string())?;
        *self.current.write().unwrap() = level;
        Ok(())
    }
}

/// Install the global subscriber. The initial filter comes from `RUST_LOG`,
/// defaulting to `info`.
pub fn init() -> Arc<LogLevel> {
    let initial = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let (filter, handle) = reload::Layer::new(EnvFilter::new(&initial));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Arc::new(LogLevel {
        handle,
        current: RwLock::new(initial),
    })
}
