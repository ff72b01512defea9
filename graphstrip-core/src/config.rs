//! Configuration for graphstrip.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> explicit file -> environment. The defaults describe
//! the SSD MobileNet v1 export, so a bare `graphstrip run` works end to end.

use crate::graph::DataType;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripConfig {
    /// File name of the JSON run report, placed in the model directory.
    #[serde(default = "default_report_file")]
    pub report_file: String,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
    #[serde(default)]
    pub validate: ValidateConfig,
    #[serde(default)]
    pub python: PythonConfig,
}

impl Default for StripConfig {
    fn default() -> Self {
        Self {
            report_file: default_report_file(),
            fetch: FetchConfig::default(),
            prune: PruneConfig::default(),
            convert: ConvertConfig::default(),
            validate: ValidateConfig::default(),
            python: PythonConfig::default(),
        }
    }
}

fn default_report_file() -> String {
    "report.json".to_string()
}

/// Archive acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// URL of the zip archive holding the frozen graph.
    #[serde(default = "default_url")]
    pub url: String,
    /// Directory for the archive, extracted files and produced artifacts.
    #[serde(default = "default_model_dir")]
    pub dir: PathBuf,
    /// File name of the frozen graph inside the archive.
    #[serde(default = "default_graph_file")]
    pub graph_file: String,
    /// HTTP request timeout (seconds).
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// Skip the download when the archive is already on disk.
    #[serde(default = "default_true")]
    pub reuse_existing: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            dir: default_model_dir(),
            graph_file: default_graph_file(),
            timeout_secs: default_fetch_timeout(),
            reuse_existing: true,
        }
    }
}

fn default_url() -> String {
    "https://storage.googleapis.com/download.tensorflow.org/models/object_detection/ssd_mobilenet_v1_android_export.zip".to_string()
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_graph_file() -> String {
    "ssd_mobilenet_v1_android_export.pb".to_string()
}

fn default_fetch_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Graph pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    #[serde(default = "default_input_nodes")]
    pub input_nodes: Vec<String>,
    #[serde(default = "default_output_nodes")]
    pub output_nodes: Vec<String>,
    #[serde(default = "default_placeholder_dtype")]
    pub placeholder_dtype: DataType,
    /// File name of the pruned graph, written to the model directory.
    #[serde(default = "default_pruned_file")]
    pub output_file: String,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            input_nodes: default_input_nodes(),
            output_nodes: default_output_nodes(),
            placeholder_dtype: default_placeholder_dtype(),
            output_file: default_pruned_file(),
        }
    }
}

fn default_input_nodes() -> Vec<String> {
    vec!["Preprocessor/sub".to_string()]
}

fn default_output_nodes() -> Vec<String> {
    vec!["concat".to_string(), "concat_1".to_string()]
}

fn default_placeholder_dtype() -> DataType {
    DataType::DtFloat
}

fn default_pruned_file() -> String {
    "ssd_mobilenet.pb".to_string()
}

/// Format conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    /// File name of the converted model, written to the model directory.
    #[serde(default = "default_model_file")]
    pub output_file: String,
    /// Output tensor names (`node:port`).
    #[serde(default = "default_output_tensors")]
    pub output_tensors: Vec<String>,
    /// Input tensor name (`node:port`) to shape.
    #[serde(default = "default_input_shapes")]
    pub input_shapes: BTreeMap<String, Vec<usize>>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            output_file: default_model_file(),
            output_tensors: default_output_tensors(),
            input_shapes: default_input_shapes(),
        }
    }
}

fn default_model_file() -> String {
    "ssd_mobilenet.mlmodel".to_string()
}

fn default_input_shapes() -> BTreeMap<String, Vec<usize>> {
    BTreeMap::from([("Preprocessor/sub:0".to_string(), vec![1, 300, 300, 3])])
}

fn default_output_tensors() -> Vec<String> {
    vec!["concat:0".to_string(), "concat_1:0".to_string()]
}

/// Cross-runtime validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateConfig {
    /// Maximum accepted relative error per output.
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
    /// Seed for the generated input when no input file is given.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// JSON tensor (`{"shape": [...], "data": [...]}`) used as input.
    #[serde(default)]
    pub input_file: Option<PathBuf>,
    /// Restrict the converted model's runtime to the CPU.
    #[serde(default = "default_true")]
    pub cpu_only: bool,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            seed: default_seed(),
            input_file: None,
            cpu_only: true,
        }
    }
}

fn default_tolerance() -> f32 {
    1e-2
}

fn default_seed() -> u64 {
    42
}

/// Python runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonConfig {
    /// Path to the Python executable (`python3` if not set).
    #[serde(default)]
    pub python_path: Option<PathBuf>,
    /// Path to a virtual environment.
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// Timeout for a single script run (seconds).
    #[serde(default = "default_python_timeout")]
    pub timeout_secs: u64,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            venv_path: None,
            timeout_secs: default_python_timeout(),
        }
    }
}

fn default_python_timeout() -> u64 {
    600
}

impl StripConfig {
    /// Resolve the model directory against `workspace` when relative.
    pub fn model_dir(&self, workspace: &Path) -> PathBuf {
        if self.fetch.dir.is_absolute() {
            self.fetch.dir.clone()
        } else {
            workspace.join(&self.fetch.dir)
        }
    }
}

/// Workspace-level config file location.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".graphstrip").join("config.toml")
}

/// User-level config file location, if the platform has one.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "graphstrip", "graphstrip")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`GRAPHSTRIP_VALIDATE__TOLERANCE`, ...)
/// 2. Explicit config file
/// 3. Workspace config (`.graphstrip/config.toml`)
/// 4. User config (`~/.config/graphstrip/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<StripConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(StripConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Box::new(figment::Error::from(format!(
                "config file not found: {}",
                path.display()
            ))));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("GRAPHSTRIP_").split("__"));

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = StripConfig::default();
        assert_eq!(config.prune.input_nodes, vec!["Preprocessor/sub"]);
        assert_eq!(config.prune.output_nodes, vec!["concat", "concat_1"]);
        assert_eq!(
            config.convert.input_shapes.get("Preprocessor/sub:0"),
            Some(&vec![1, 300, 300, 3])
        );
        assert!(config.validate.cpu_only);
        assert_eq!(config.report_file, "report.json");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = StripConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("placeholder_dtype = \"float\""));
        let parsed: StripConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.fetch.url, config.fetch.url);
        assert_eq!(parsed.convert.input_shapes, config.convert.input_shapes);
        assert_eq!(parsed.prune.placeholder_dtype, DataType::DtFloat);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let parsed: StripConfig = toml::from_str("[validate]\ntolerance = 0.5\n").unwrap();
        assert_eq!(parsed.validate.tolerance, 0.5);
        assert_eq!(parsed.validate.seed, 42);
        assert_eq!(parsed.prune.output_file, "ssd_mobilenet.pb");
    }

    #[test]
    fn test_load_config_from_workspace_and_explicit_file() {
        let dir = TempDir::new().unwrap();
        let ws_config = workspace_config_path(dir.path());
        std::fs::create_dir_all(ws_config.parent().unwrap()).unwrap();
        std::fs::write(
            &ws_config,
            "[prune]\ninput_nodes = [\"input\"]\noutput_nodes = [\"logits\"]\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.prune.input_nodes, vec!["input"]);
        assert_eq!(config.prune.output_nodes, vec!["logits"]);

        let explicit = dir.path().join("override.toml");
        std::fs::write(&explicit, "[prune]\noutput_nodes = [\"probs\"]\n").unwrap();
        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.prune.input_nodes, vec!["input"]);
        assert_eq!(config.prune.output_nodes, vec!["probs"]);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_config(Some(dir.path()), Some(&missing)).is_err());
    }

    #[test]
    fn test_model_dir_resolution() {
        let mut config = StripConfig::default();
        assert_eq!(
            config.model_dir(Path::new("/ws")),
            PathBuf::from("/ws/models")
        );
        config.fetch.dir = PathBuf::from("/abs/models");
        assert_eq!(
            config.model_dir(Path::new("/ws")),
            PathBuf::from("/abs/models")
        );
    }
}
