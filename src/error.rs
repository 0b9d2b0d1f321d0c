//! Error handling for vrloop
//!
//! This module defines the crate-level error type and a Result alias. Queue and
//! DAG subsystems have their own error enums which convert into [`VrError`].

use crate::pipeline::DagError;
use crate::queue::QueueError;
use thiserror::Error;

/// Main error type for vrloop operations
#[derive(Error, Debug)]
pub enum VrError {
    /// Errors related to settings loading or validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised by shared-memory or metadata queues
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Errors raised while building, starting or stopping the DAG
    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    /// Errors related to writing run artefacts
    #[error("Artefact error: {0}")]
    Artefact(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<VrError>,
    },
}

impl VrError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        VrError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True when the root cause is a configuration problem.
    pub fn is_config(&self) -> bool {
        match self {
            VrError::Config(_) => true,
            VrError::WithContext { source, .. } => source.is_config(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for VrError {
    fn from(err: serde_json::Error) -> Self {
        VrError::Serialization(err.to_string())
    }
}

/// Result type alias for vrloop operations
pub type Result<T> = std::result::Result<T, VrError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| VrError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| VrError::Io(e).with_context(f()))
    }
}
