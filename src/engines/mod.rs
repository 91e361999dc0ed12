//! Recognition engine implementations
//!
//! Concrete engines are conditionally compiled behind feature flags; the
//! registry also accepts arbitrary trait objects so tests can wire in stubs.

#[cfg(feature = "engine-accurate")]
pub mod accurate;

#[cfg(feature = "engine-fast")]
pub mod fast;

use std::sync::Arc;

use serde::Serialize;

use crate::engine::RecognitionEngine;
use crate::error::RecognitionError;
use crate::model::EngineKind;

/// Information about an available engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub kind: EngineKind,
    pub description: String,
    pub supported_languages: Vec<String>,
}

/// Registry of available recognition engines, one per [`EngineKind`] slot.
pub struct EngineRegistry {
    engines: Vec<Arc<dyn RecognitionEngine>>,
}

impl EngineRegistry {
    /// Build every engine compiled into this binary.
    pub fn from_enabled_features() -> Result<Self, RecognitionError> {
        #[allow(unused_mut)]
        let mut engines: Vec<Arc<dyn RecognitionEngine>> = Vec::new();

        #[cfg(feature = "engine-accurate")]
        {
            tracing::info!("Initializing accurate (learned-model) engine...");
            engines.push(Arc::new(accurate::AccurateEngine::new()?));
        }

        #[cfg(feature = "engine-fast")]
        {
            tracing::info!("Initializing fast (pattern-based) engine...");
            engines.push(Arc::new(fast::FastEngine::new()?));
        }

        if engines.is_empty() {
            return Err(RecognitionError::Initialization(
                "No recognition engines available. Build with --features engine-accurate or --features engine-fast".to_string()
            ));
        }

        Ok(Self { engines })
    }

    /// Registry over explicit engine instances. Used by tests and embedders.
    pub fn with_engines(engines: Vec<Arc<dyn RecognitionEngine>>) -> Self {
        Self { engines }
    }

    /// Look up the engine filling a slot.
    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn RecognitionEngine>> {
        self.engines.iter().find(|e| e.kind() == kind).cloned()
    }

    /// Kinds with a registered implementation.
    pub fn kinds(&self) -> Vec<EngineKind> {
        self.engines.iter().map(|e| e.kind()).collect()
    }

    /// Info about every registered engine.
    pub fn info(&self) -> Vec<EngineInfo> {
        self.engines
            .iter()
            .map(|e| EngineInfo {
                kind: e.kind(),
                description: e.description().to_string(),
                supported_languages: e.supported_languages(),
            })
            .collect()
    }
}
