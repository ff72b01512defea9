//! # graphstrip core
//!
//! Library behind the `graphstrip` CLI. It takes a frozen TensorFlow graph
//! from a downloaded archive, prunes it to the subgraph between declared
//! input and output nodes, hands the result to an external converter and
//! checks that the converted model agrees with the source graph.
//!
//! The graph codec, pruner, tensor layout handling and error metric live
//! here; the converter and both inference engines are Python processes
//! driven through [`runtime::PythonRuntime`].

pub mod config;
pub mod convert;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod persistence;
pub mod pipeline;
pub mod prune;
pub mod runtime;
pub mod tensor;
pub mod validate;

pub use config::{StripConfig, load_config};
pub use convert::{ConversionRequest, ConversionResult, Converter, PythonConverter};
pub use error::{GraphError, PruneError, StripError};
pub use fetch::{ArchiveFetcher, FetchedArchive, extract_zip, locate_file};
pub use graph::{Graph, GraphSummary, TensorRef};
pub use pipeline::{Pipeline, PipelineReport};
pub use prune::{PruneOutcome, PruneSpec, prune};
pub use runtime::{PythonInfo, PythonRuntime};
pub use tensor::{Tensor, TensorLayout, TensorMap};
pub use validate::{
    DualRuntimeValidator, OutputComparison, Predictor, ValidationReport, max_relative_error,
};
