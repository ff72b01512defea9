//! End-to-end workflow: fetch, prune, convert and validate one model.

use crate::config::StripConfig;
use crate::convert::{ConversionRequest, ConversionResult, Converter, PythonConverter};
use crate::error::StripError;
use crate::fetch::{ArchiveFetcher, FetchedArchive, locate_file};
use crate::graph::{Graph, TensorRef};
use crate::persistence::{atomic_write_json, sha256_file};
use crate::prune::{PruneSpec, prune};
use crate::runtime::PythonRuntime;
use crate::tensor::{Tensor, TensorMap};
use crate::validate::{CoreMlPredictor, DualRuntimeValidator, Predictor, TfPredictor, ValidationReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Where each artifact of a run lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub model_dir: PathBuf,
    pub pruned_graph: PathBuf,
    pub converted_model: PathBuf,
    pub report: PathBuf,
}

/// What the prune stage did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneReport {
    pub source_graph: PathBuf,
    pub source_sha256: String,
    pub source_nodes: usize,
    pub pruned_graph: PathBuf,
    pub pruned_sha256: String,
    pub pruned_nodes: usize,
    pub removed_nodes: usize,
}

/// JSON record of a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub url: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub prune: PruneReport,
    pub conversion: ConversionResult,
    pub validation: ValidationReport,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    pub fn passed(&self) -> bool {
        self.validation.passed
    }
}

/// The configured workflow with its external collaborators.
pub struct Pipeline {
    config: StripConfig,
    paths: ArtifactPaths,
    converter: Box<dyn Converter>,
    source: Box<dyn Predictor>,
    target: Box<dyn Predictor>,
}

impl Pipeline {
    /// A pipeline backed by the Python converter and runtimes.
    pub fn new(config: StripConfig, workspace: &Path) -> Self {
        let paths = artifact_paths(&config, workspace);
        let runtime = PythonRuntime::from_config(&config.python, workspace.to_path_buf());
        let converter = Box::new(PythonConverter::new(runtime.clone()));
        let source = Box::new(TfPredictor::new(runtime.clone(), paths.pruned_graph.clone()));
        let target = Box::new(CoreMlPredictor::new(
            runtime,
            paths.converted_model.clone(),
            config.validate.cpu_only,
        ));
        Self {
            config,
            paths,
            converter,
            source,
            target,
        }
    }

    pub fn with_converter(mut self, converter: Box<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_predictors(mut self, source: Box<dyn Predictor>, target: Box<dyn Predictor>) -> Self {
        self.source = source;
        self.target = target;
        self
    }

    pub fn config(&self) -> &StripConfig {
        &self.config
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    /// Download and extract the configured archive.
    pub async fn fetch(&self) -> Result<FetchedArchive, StripError> {
        let fetcher = ArchiveFetcher::new(
            Duration::from_secs(self.config.fetch.timeout_secs),
            self.config.fetch.reuse_existing,
        )?;
        fetcher
            .fetch(&self.config.fetch.url, &self.paths.model_dir)
            .await
    }

    /// Path of the frozen graph, preferring the freshly extracted copy.
    pub fn locate_graph(&self, fetched: Option<&FetchedArchive>) -> Result<PathBuf, StripError> {
        let name = &self.config.fetch.graph_file;
        match fetched.and_then(|f| f.find(name)) {
            Some(path) => Ok(path.to_path_buf()),
            None => locate_file(&self.paths.model_dir, name),
        }
    }

    pub fn prune_spec(&self) -> Result<PruneSpec, StripError> {
        let mut spec = PruneSpec::new(&self.config.prune.input_nodes, &self.config.prune.output_nodes)?
            .with_dtype(self.config.prune.placeholder_dtype);
        for (tensor, dims) in &self.config.convert.input_shapes {
            let node = TensorRef::parse(tensor)?.node;
            if spec.input_nodes.contains(&node) {
                spec = spec.with_input_shape(&node, dims.iter().map(|&d| d as i64).collect());
            }
        }
        Ok(spec)
    }

    /// Prune `graph_path` and write the result to the pruned graph path.
    pub fn prune(&self, graph_path: &Path) -> Result<PruneReport, StripError> {
        let graph = Graph::load(graph_path)?;
        let outcome = prune(&graph, &self.prune_spec()?)?;
        if let Some(parent) = self.paths.pruned_graph.parent() {
            std::fs::create_dir_all(parent)?;
        }
        outcome.graph.save(&self.paths.pruned_graph)?;
        info!(
            output = %self.paths.pruned_graph.display(),
            kept = outcome.kept,
            removed = outcome.removed,
            "Pruned graph written"
        );
        Ok(PruneReport {
            source_graph: graph_path.to_path_buf(),
            source_sha256: sha256_file(graph_path)?,
            source_nodes: graph.len(),
            pruned_graph: self.paths.pruned_graph.clone(),
            pruned_sha256: sha256_file(&self.paths.pruned_graph)?,
            pruned_nodes: outcome.kept,
            removed_nodes: outcome.removed,
        })
    }

    pub fn conversion_request(&self) -> ConversionRequest {
        ConversionRequest {
            source_path: self.paths.pruned_graph.clone(),
            output_path: self.paths.converted_model.clone(),
            input_shapes: self.config.convert.input_shapes.clone(),
            output_tensors: self.config.convert.output_tensors.clone(),
        }
    }

    /// Convert the pruned graph with the configured converter.
    pub async fn convert(&self) -> Result<ConversionResult, StripError> {
        info!(converter = self.converter.name(), "Starting conversion");
        self.converter.convert(&self.conversion_request()).await
    }

    /// Channel-last validation inputs, one per declared input tensor.
    ///
    /// With an input file there must be exactly one declared input; the file
    /// is reshaped to its declared shape. Otherwise inputs are drawn from
    /// `[-1, 1)` with the configured seed.
    pub fn validation_inputs(&self) -> Result<TensorMap, StripError> {
        let shapes = &self.config.convert.input_shapes;
        if shapes.is_empty() {
            return Err(StripError::validation("no input shapes declared"));
        }
        if let Some(file) = &self.config.validate.input_file {
            let (name, shape) = match shapes.iter().collect::<Vec<_>>().as_slice() {
                [(name, shape)] => (*name, *shape),
                _ => {
                    return Err(StripError::validation(format!(
                        "an input file feeds exactly one input, {} are declared",
                        shapes.len()
                    )));
                }
            };
            let tensor = Tensor::load_json(file)?.reshape(shape)?;
            return Ok(TensorMap::from([(name.clone(), tensor)]));
        }

        let seed = self.config.validate.seed;
        shapes
            .iter()
            .enumerate()
            .map(|(i, (name, shape))| {
                let tensor =
                    Tensor::random_uniform(shape.clone(), -1.0, 1.0, seed.wrapping_add(i as u64))?;
                Ok((name.clone(), tensor))
            })
            .collect()
    }

    /// Compare the pruned graph and the converted model on one input.
    pub async fn validate(&self) -> Result<ValidationReport, StripError> {
        let inputs = self.validation_inputs()?;
        let validator = DualRuntimeValidator::new(
            self.source.as_ref(),
            self.target.as_ref(),
            self.config.validate.tolerance,
        );
        validator
            .validate(&inputs, &self.config.convert.output_tensors)
            .await
    }

    /// Run every stage and write the report.
    pub async fn run(&self) -> Result<PipelineReport, StripError> {
        let started_at = Utc::now();
        let fetched = self.fetch().await?;
        let graph_path = self.locate_graph(Some(&fetched))?;
        self.finish(
            started_at,
            Some(self.config.fetch.url.clone()),
            Some(fetched.archive_path),
            &graph_path,
        )
        .await
    }

    /// Run every stage after acquisition, starting from a graph on disk.
    pub async fn run_from_graph(&self, graph_path: &Path) -> Result<PipelineReport, StripError> {
        self.finish(Utc::now(), None, None, graph_path).await
    }

    async fn finish(
        &self,
        started_at: DateTime<Utc>,
        url: Option<String>,
        archive_path: Option<PathBuf>,
        graph_path: &Path,
    ) -> Result<PipelineReport, StripError> {
        let prune = self.prune(graph_path)?;
        let conversion = self.convert().await?;
        let validation = self.validate().await?;

        let report = PipelineReport {
            url,
            archive_path,
            prune,
            conversion,
            validation,
            started_at,
            finished_at: Utc::now(),
        };
        atomic_write_json(&self.paths.report, &report)?;
        info!(
            report = %self.paths.report.display(),
            passed = report.passed(),
            worst_error = report.validation.worst_error(),
            "Pipeline finished"
        );
        Ok(report)
    }
}

/// Artifact locations for `config` relative to `workspace`.
pub fn artifact_paths(config: &StripConfig, workspace: &Path) -> ArtifactPaths {
    let model_dir = config.model_dir(workspace);
    ArtifactPaths {
        pruned_graph: model_dir.join(&config.prune.output_file),
        converted_model: model_dir.join(&config.convert.output_file),
        report: model_dir.join(&config.report_file),
        model_dir,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_paths() {
        let config = StripConfig::default();
        let paths = artifact_paths(&config, Path::new("/ws"));
        assert_eq!(paths.model_dir, PathBuf::from("/ws/models"));
        assert_eq!(paths.pruned_graph, PathBuf::from("/ws/models/ssd_mobilenet.pb"));
        assert_eq!(
            paths.converted_model,
            PathBuf::from("/ws/models/ssd_mobilenet.mlmodel")
        );
        assert_eq!(paths.report, PathBuf::from("/ws/models/report.json"));
    }

    #[test]
    fn test_prune_spec_carries_declared_shapes() {
        let pipeline = Pipeline::new(StripConfig::default(), Path::new("/ws"));
        let spec = pipeline.prune_spec().unwrap();
        assert_eq!(spec.input_nodes, vec!["Preprocessor/sub"]);
        assert_eq!(spec.output_nodes, vec!["concat", "concat_1"]);
        assert_eq!(
            spec.input_shapes.get("Preprocessor/sub"),
            Some(&vec![1, 300, 300, 3])
        );
    }

    #[test]
    fn test_conversion_request() {
        let pipeline = Pipeline::new(StripConfig::default(), Path::new("/ws"));
        let request = pipeline.conversion_request();
        assert_eq!(request.source_path, PathBuf::from("/ws/models/ssd_mobilenet.pb"));
        assert_eq!(request.output_tensors, vec!["concat:0", "concat_1:0"]);
    }

    #[test]
    fn test_generated_inputs_are_seeded() {
        let mut config = StripConfig::default();
        config.convert.input_shapes = BTreeMap::from([("x:0".to_string(), vec![1, 4, 4, 3])]);
        let pipeline = Pipeline::new(config.clone(), Path::new("/ws"));
        let a = pipeline.validation_inputs().unwrap();
        let b = Pipeline::new(config, Path::new("/ws"))
            .validation_inputs()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a["x:0"].shape(), &[1, 4, 4, 3]);
    }

    #[test]
    fn test_input_file_is_reshaped() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("input.json");
        std::fs::write(&file, r#"{"shape": [6], "data": [1, 2, 3, 4, 5, 6]}"#).unwrap();

        let mut config = StripConfig::default();
        config.convert.input_shapes = BTreeMap::from([("x:0".to_string(), vec![1, 2, 3])]);
        config.validate.input_file = Some(file);
        let inputs = Pipeline::new(config.clone(), dir.path())
            .validation_inputs()
            .unwrap();
        assert_eq!(inputs["x:0"].shape(), &[1, 2, 3]);

        config.convert.input_shapes.insert("y:0".into(), vec![6]);
        let err = Pipeline::new(config, dir.path())
            .validation_inputs()
            .unwrap_err();
        assert!(matches!(err, StripError::Validation(_)));
    }

    #[test]
    fn test_locate_graph_without_fetch() {
        let dir = TempDir::new().unwrap();
        let config = StripConfig::default();
        let pipeline = Pipeline::new(config.clone(), dir.path());
        assert!(pipeline.locate_graph(None).is_err());

        let nested = dir.path().join("models").join("export");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join(&config.fetch.graph_file), b"").unwrap();
        assert_eq!(
            pipeline.locate_graph(None).unwrap(),
            nested.join(&config.fetch.graph_file)
        );
    }
}
