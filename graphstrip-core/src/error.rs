//! Error types for the graphstrip-core crate.
//!
//! Uses `thiserror` for the public error types: a top-level [`StripError`]
//! plus structured [`GraphError`] and [`PruneError`] for the graph stages.

use std::path::PathBuf;

/// Top-level error type for graphstrip operations.
#[derive(Debug, thiserror::Error)]
pub enum StripError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Prune error: {0}")]
    Prune(#[from] PruneError),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Prediction error: {0}")]
    Prediction(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Python runtime error: {0}")]
    Python(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl StripError {
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    pub fn prediction(msg: impl Into<String>) -> Self {
        Self::Prediction(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

/// Errors from decoding or inspecting a serialized graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("failed to decode graph from {source_name}: {message}")]
    Decode {
        source_name: String,
        message: String,
    },

    #[error("failed to read graph file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("duplicate node name '{name}'")]
    DuplicateNode { name: String },

    #[error("node '{node}' references missing input '{input}'")]
    DanglingInput { node: String, input: String },

    #[error("invalid tensor reference '{reference}'")]
    InvalidTensorRef { reference: String },
}

/// Errors from validating or applying a prune request.
#[derive(Debug, thiserror::Error)]
pub enum PruneError {
    #[error("prune request needs at least one input and one output node")]
    EmptySpec,

    #[error("input node '{name}' not found in graph")]
    UnknownInput { name: String },

    #[error("output node '{name}' not found in graph")]
    UnknownOutput { name: String },

    #[error("output node '{output}' does not depend on any declared input")]
    OutputUnreachable { output: String },
}
