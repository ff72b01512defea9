//! Cross-runtime validation: run one input through both models and compare.

pub mod compare;
pub mod predictor;

pub use compare::{max_relative_error, tensor_max_relative_error};
pub use predictor::{CoreMlPredictor, Predictor, TfPredictor, coreml_feature_name};

use crate::error::StripError;
use crate::tensor::{TensorLayout, TensorMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Comparison of one output between the two runtimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputComparison {
    pub name: String,
    pub source_shape: Vec<usize>,
    pub target_shape: Vec<usize>,
    /// Written as `null` when the error is not a finite number.
    #[serde(with = "non_finite_as_null")]
    pub max_relative_error: f32,
    pub passed: bool,
}

/// Outcome of a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub source_runtime: String,
    pub target_runtime: String,
    pub tolerance: f32,
    pub comparisons: Vec<OutputComparison>,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

impl ValidationReport {
    /// The largest error across all outputs (NaN if any output was NaN).
    pub fn worst_error(&self) -> f32 {
        let mut worst = 0.0f32;
        for c in &self.comparisons {
            if c.max_relative_error.is_nan() {
                return f32::NAN;
            }
            worst = worst.max(c.max_relative_error);
        }
        worst
    }
}

/// Runs the same inputs through a source and a target runtime.
pub struct DualRuntimeValidator<'a> {
    source: &'a dyn Predictor,
    target: &'a dyn Predictor,
    tolerance: f32,
}

impl<'a> DualRuntimeValidator<'a> {
    pub fn new(source: &'a dyn Predictor, target: &'a dyn Predictor, tolerance: f32) -> Self {
        Self {
            source,
            target,
            tolerance,
        }
    }

    /// Compare `outputs` for channel-last `inputs`.
    ///
    /// Each target output is brought into the source output's shape before
    /// the error is computed. An output passes when its error is finite and
    /// within the tolerance.
    pub async fn validate(
        &self,
        inputs: &TensorMap,
        outputs: &[String],
    ) -> Result<ValidationReport, StripError> {
        if outputs.is_empty() {
            return Err(StripError::validation("no outputs to compare"));
        }

        let source_out = self
            .source
            .predict(&to_layout(inputs, self.source.layout())?, outputs)
            .await?;
        let target_out = self
            .target
            .predict(&to_layout(inputs, self.target.layout())?, outputs)
            .await?;

        let mut comparisons = Vec::with_capacity(outputs.len());
        for name in outputs {
            let expected = source_out.get(name).ok_or_else(|| {
                StripError::validation(format!("{} returned no '{name}'", self.source.name()))
            })?;
            let actual = target_out.get(name).ok_or_else(|| {
                StripError::validation(format!("{} returned no '{name}'", self.target.name()))
            })?;

            let source_aligned = expected.align_to(self.source.layout(), expected.shape())?;
            let target_aligned = actual.align_to(self.target.layout(), expected.shape())?;
            let error = tensor_max_relative_error(&source_aligned, &target_aligned)?;
            let passed = error.is_finite() && error <= self.tolerance;
            if passed {
                info!(output = %name, max_relative_error = error, "Output matches");
            } else {
                warn!(
                    output = %name,
                    max_relative_error = error,
                    tolerance = self.tolerance,
                    "Output differs between runtimes"
                );
            }
            comparisons.push(OutputComparison {
                name: name.clone(),
                source_shape: expected.shape().to_vec(),
                target_shape: actual.shape().to_vec(),
                max_relative_error: error,
                passed,
            });
        }

        let passed = comparisons.iter().all(|c| c.passed);
        Ok(ValidationReport {
            source_runtime: self.source.name().to_string(),
            target_runtime: self.target.name().to_string(),
            tolerance: self.tolerance,
            comparisons,
            passed,
            timestamp: Utc::now(),
        })
    }
}

/// JSON has no NaN: a non-finite error is stored as `null` and read back as NaN.
mod non_finite_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f32(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
    }
}

fn to_layout(inputs: &TensorMap, layout: TensorLayout) -> Result<TensorMap, StripError> {
    inputs
        .iter()
        .map(|(name, t)| Ok((name.clone(), t.to_layout(layout)?)))
        .collect()
}
