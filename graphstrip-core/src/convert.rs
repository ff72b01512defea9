//! Model format conversion (delegates to the external Python converter).

use crate::error::StripError;
use crate::persistence::sha256_file;
use crate::runtime::PythonRuntime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

const COREML_CONVERT_SCRIPT: &str = include_str!("scripts/convert_coreml.py");

/// What to convert and how the converted model's interface looks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    /// Input tensor name (`node:port`) to static shape.
    pub input_shapes: BTreeMap<String, Vec<usize>>,
    /// Output tensor names (`node:port`).
    pub output_tensors: Vec<String>,
}

impl ConversionRequest {
    fn check(&self) -> Result<(), StripError> {
        if !self.source_path.exists() {
            return Err(StripError::not_found(format!(
                "source model {}",
                self.source_path.display()
            )));
        }
        if self.input_shapes.is_empty() {
            return Err(StripError::conversion("no input shapes declared"));
        }
        if self.output_tensors.is_empty() {
            return Err(StripError::conversion("no output tensors declared"));
        }
        Ok(())
    }
}

/// Result of a model conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub target_format: String,
    pub source_size_bytes: u64,
    pub output_size_bytes: u64,
    pub compression_ratio: f64,
    pub output_sha256: String,
}

impl ConversionResult {
    /// Describe a finished conversion by looking at both files.
    pub fn from_files(request: &ConversionRequest, target_format: &str) -> Result<Self, StripError> {
        if !request.output_path.exists() {
            return Err(StripError::conversion(format!(
                "converter reported success but {} was not written",
                request.output_path.display()
            )));
        }
        let source_size_bytes = std::fs::metadata(&request.source_path)?.len();
        let output_size_bytes = std::fs::metadata(&request.output_path)?.len();
        let compression_ratio = if output_size_bytes == 0 {
            0.0
        } else {
            source_size_bytes as f64 / output_size_bytes as f64
        };
        Ok(Self {
            source_path: request.source_path.clone(),
            output_path: request.output_path.clone(),
            target_format: target_format.to_string(),
            source_size_bytes,
            output_size_bytes,
            compression_ratio,
            output_sha256: sha256_file(&request.output_path)?,
        })
    }
}

/// Maps a pruned graph to another model format.
#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    async fn convert(&self, request: &ConversionRequest) -> Result<ConversionResult, StripError>;
}

/// Converts frozen TensorFlow graphs to Core ML through `tfcoreml`.
pub struct PythonConverter {
    runtime: PythonRuntime,
}

impl PythonConverter {
    pub fn new(runtime: PythonRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Converter for PythonConverter {
    fn name(&self) -> &str {
        "tfcoreml"
    }

    async fn convert(&self, request: &ConversionRequest) -> Result<ConversionResult, StripError> {
        request.check()?;
        if let Some(parent) = request.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(
            source = %request.source_path.display(),
            output = %request.output_path.display(),
            "Converting model"
        );

        let payload = serde_json::to_value(request)?;
        self.runtime
            .run_script(COREML_CONVERT_SCRIPT, &payload)
            .await
            .map_err(|e| match e {
                StripError::Python(msg) => StripError::conversion(msg),
                other => other,
            })?;

        let result = ConversionResult::from_files(request, "coreml")?;
        info!(
            output_size_bytes = result.output_size_bytes,
            sha256 = %result.output_sha256,
            "Model converted"
        );
        Ok(result)
    }
}
