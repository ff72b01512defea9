//! Runtimes that can execute a model on named input tensors.

use crate::error::StripError;
use crate::runtime::PythonRuntime;
use crate::tensor::{RawTensor, Tensor, TensorLayout, TensorMap};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

const TF_PREDICT_SCRIPT: &str = include_str!("../scripts/predict_tf.py");
const COREML_PREDICT_SCRIPT: &str = include_str!("../scripts/predict_coreml.py");

/// A model runtime.
///
/// Inputs and outputs are keyed by the source graph's tensor names
/// (`node:port`) and arrive in the predictor's own [`TensorLayout`]; any
/// renaming the runtime needs happens inside the implementation.
#[async_trait]
pub trait Predictor: Send + Sync {
    fn name(&self) -> &str;

    fn layout(&self) -> TensorLayout;

    async fn predict(
        &self,
        inputs: &TensorMap,
        outputs: &[String],
    ) -> Result<TensorMap, StripError>;
}

/// Feature name the converter gives a TensorFlow tensor (`a/b:0` -> `a__b__0`).
pub fn coreml_feature_name(tensor_name: &str) -> String {
    tensor_name.replace(['/', ':'], "__")
}

/// Script response. Tensors stay unchecked until they are picked out, so a
/// bad shape surfaces as [`StripError::Shape`]; non-finite values arrive as
/// `null`.
#[derive(Debug, Deserialize)]
struct ScriptOutput {
    outputs: BTreeMap<String, RawTensor>,
}

fn encode_inputs<F>(inputs: &TensorMap, rename: F) -> serde_json::Value
where
    F: Fn(&str) -> String,
{
    let map: serde_json::Map<String, serde_json::Value> = inputs
        .iter()
        .map(|(name, t)| {
            (
                rename(name),
                json!({"shape": t.shape(), "data": t.data()}),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

/// Pull `outputs` out of a script response, mapping runtime names back.
fn decode_outputs<F>(
    value: serde_json::Value,
    outputs: &[String],
    rename: F,
) -> Result<TensorMap, StripError>
where
    F: Fn(&str) -> String,
{
    let mut parsed: ScriptOutput = serde_json::from_value(value)
        .map_err(|e| StripError::prediction(format!("unexpected script output: {e}")))?;
    let mut result = TensorMap::new();
    for name in outputs {
        let runtime_name = rename(name);
        let raw = parsed.outputs.remove(&runtime_name).ok_or_else(|| {
            StripError::prediction(format!("runtime did not return output '{runtime_name}'"))
        })?;
        result.insert(name.clone(), Tensor::try_from(raw)?);
    }
    Ok(result)
}

/// Runs the frozen graph with TensorFlow.
pub struct TfPredictor {
    runtime: PythonRuntime,
    graph_path: PathBuf,
}

impl TfPredictor {
    pub fn new(runtime: PythonRuntime, graph_path: PathBuf) -> Self {
        Self {
            runtime,
            graph_path,
        }
    }
}

#[async_trait]
impl Predictor for TfPredictor {
    fn name(&self) -> &str {
        "tensorflow"
    }

    fn layout(&self) -> TensorLayout {
        TensorLayout::ChannelLast
    }

    async fn predict(
        &self,
        inputs: &TensorMap,
        outputs: &[String],
    ) -> Result<TensorMap, StripError> {
        let request = json!({
            "graph_path": self.graph_path.display().to_string(),
            "inputs": encode_inputs(inputs, str::to_string),
            "outputs": outputs,
        });
        let response = self
            .runtime
            .run_script(TF_PREDICT_SCRIPT, &request)
            .await
            .map_err(|e| StripError::prediction(format!("tensorflow: {e}")))?;
        decode_outputs(response, outputs, str::to_string)
    }
}

/// Runs the converted model with coremltools.
pub struct CoreMlPredictor {
    runtime: PythonRuntime,
    model_path: PathBuf,
    cpu_only: bool,
}

impl CoreMlPredictor {
    pub fn new(runtime: PythonRuntime, model_path: PathBuf, cpu_only: bool) -> Self {
        Self {
            runtime,
            model_path,
            cpu_only,
        }
    }
}

#[async_trait]
impl Predictor for CoreMlPredictor {
    fn name(&self) -> &str {
        "coreml"
    }

    fn layout(&self) -> TensorLayout {
        TensorLayout::Rank5
    }

    async fn predict(
        &self,
        inputs: &TensorMap,
        outputs: &[String],
    ) -> Result<TensorMap, StripError> {
        let feature_outputs: Vec<String> =
            outputs.iter().map(|o| coreml_feature_name(o)).collect();
        let request = json!({
            "model_path": self.model_path.display().to_string(),
            "inputs": encode_inputs(inputs, coreml_feature_name),
            "outputs": feature_outputs,
            "cpu_only": self.cpu_only,
        });
        let response = self
            .runtime
            .run_script(COREML_PREDICT_SCRIPT, &request)
            .await
            .map_err(|e| StripError::prediction(format!("coreml: {e}")))?;
        decode_outputs(response, outputs, coreml_feature_name)
    }
}
