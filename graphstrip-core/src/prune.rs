//! Graph pruning: strip everything the declared outputs don't need.
//!
//! Input nodes are rewritten as `Placeholder`s first, so the backward walk
//! from the outputs stops at them and whatever fed the inputs (decoders,
//! preprocessing) falls away together with unrelated branches.

use crate::error::{GraphError, PruneError, StripError};
use crate::graph::{AttrValue, DataType, Graph, NodeDef, TensorRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Which part of a graph to keep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneSpec {
    pub input_nodes: Vec<String>,
    pub output_nodes: Vec<String>,
    #[serde(default = "default_dtype")]
    pub placeholder_dtype: DataType,
    /// Optional static shapes for the rewritten input placeholders.
    #[serde(default)]
    pub input_shapes: BTreeMap<String, Vec<i64>>,
}

fn default_dtype() -> DataType {
    DataType::DtFloat
}

impl PruneSpec {
    /// Build a spec, normalizing tensor names (`node:0`) to node names.
    pub fn new<I, O>(inputs: I, outputs: O) -> Result<Self, GraphError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        O: IntoIterator,
        O::Item: AsRef<str>,
    {
        Ok(Self {
            input_nodes: normalize(inputs)?,
            output_nodes: normalize(outputs)?,
            placeholder_dtype: default_dtype(),
            input_shapes: BTreeMap::new(),
        })
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.placeholder_dtype = dtype;
        self
    }

    /// Declare the static shape of the placeholder for input node `node`.
    pub fn with_input_shape(mut self, node: &str, dims: Vec<i64>) -> Self {
        self.input_shapes.insert(node.to_string(), dims);
        self
    }
}

/// Node names for `names`, in order, without blanks or repeats.
fn normalize<I>(names: I) -> Result<Vec<String>, GraphError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();
    for name in names {
        let name = name.as_ref().trim();
        if name.is_empty() {
            continue;
        }
        let node = TensorRef::parse(name)?.node;
        if seen.insert(node.clone()) {
            nodes.push(node);
        }
    }
    Ok(nodes)
}

/// The pruned graph plus what happened to the original.
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    pub graph: Graph,
    pub kept: usize,
    pub removed: usize,
}

/// Reduce `graph` to the nodes needed to compute `spec.output_nodes` from
/// `spec.input_nodes`.
///
/// Fails when a named node is missing, when a kept node references a node
/// that doesn't exist, or when an output doesn't depend on any declared
/// input. Kept nodes stay in their original order.
pub fn prune(graph: &Graph, spec: &PruneSpec) -> Result<PruneOutcome, StripError> {
    let inputs = normalize(&spec.input_nodes)?;
    let outputs = normalize(&spec.output_nodes)?;
    if inputs.is_empty() || outputs.is_empty() {
        return Err(PruneError::EmptySpec.into());
    }
    for name in &inputs {
        if !graph.contains(name) {
            return Err(PruneError::UnknownInput { name: name.clone() }.into());
        }
    }
    for name in &outputs {
        if !graph.contains(name) {
            return Err(PruneError::UnknownOutput { name: name.clone() }.into());
        }
    }

    let input_set: HashSet<&str> = inputs.iter().map(String::as_str).collect();
    let rewritten: Vec<NodeDef> = graph
        .nodes()
        .iter()
        .map(|node| {
            if input_set.contains(node.name.as_str()) {
                as_placeholder(node, spec)
            } else {
                node.clone()
            }
        })
        .collect();
    let rewritten = Graph::with_nodes(graph.def(), rewritten)?;

    let mut keep: HashSet<String> = HashSet::new();
    for output in &outputs {
        let reached = reachable_from(&rewritten, output)?;
        if !reached.iter().any(|n| input_set.contains(n.as_str())) {
            return Err(PruneError::OutputUnreachable {
                output: output.clone(),
            }
            .into());
        }
        keep.extend(reached);
    }

    for input in &inputs {
        if !keep.contains(input) {
            tracing::warn!(input = %input, "Declared input is not needed by any output");
        }
    }

    let kept_nodes: Vec<NodeDef> = rewritten
        .nodes()
        .iter()
        .filter(|n| keep.contains(&n.name))
        .cloned()
        .collect();
    let kept = kept_nodes.len();
    let removed = graph.len() - kept;
    let pruned = Graph::with_nodes(graph.def(), kept_nodes)?;

    tracing::info!(original = graph.len(), kept, removed, "Pruned graph");

    Ok(PruneOutcome {
        graph: pruned,
        kept,
        removed,
    })
}

/// Names of every node `start` depends on, `start` included.
fn reachable_from(graph: &Graph, start: &str) -> Result<HashSet<String>, GraphError> {
    let mut visited = HashSet::new();
    let mut stack = vec![start.to_string()];
    while let Some(name) = stack.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let node = graph.node(&name).ok_or_else(|| GraphError::DanglingInput {
            node: start.to_string(),
            input: name.clone(),
        })?;
        for input in &node.input {
            let producer = TensorRef::parse(input)?.node;
            if !graph.contains(&producer) {
                return Err(GraphError::DanglingInput {
                    node: node.name.clone(),
                    input: input.clone(),
                });
            }
            if !visited.contains(&producer) {
                stack.push(producer);
            }
        }
    }
    Ok(visited)
}

fn as_placeholder(node: &NodeDef, spec: &PruneSpec) -> NodeDef {
    let mut attr = BTreeMap::new();
    attr.insert("dtype".to_string(), AttrValue::from_type(spec.placeholder_dtype));
    if let Some(dims) = spec.input_shapes.get(&node.name) {
        attr.insert("shape".to_string(), AttrValue::from_shape(dims));
    } else if let Some(shape) = node.attr.get("shape") {
        attr.insert("shape".to_string(), shape.clone());
    }
    if let Some(shapes) = node.attr.get("_output_shapes") {
        attr.insert("_output_shapes".to_string(), shapes.clone());
    }
    NodeDef {
        name: node.name.clone(),
        op: "Placeholder".to_string(),
        attr,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::{graph, node};
    use pretty_assertions::assert_eq;

    fn ssd_like() -> Graph {
        graph(vec![
            node("image_tensor", "Placeholder", &[]),
            node("ToFloat", "Cast", &["image_tensor"]),
            node("Preprocessor/sub", "Sub", &["ToFloat", "Preprocessor/mean"]),
            node("Preprocessor/mean", "Const", &[]),
            node("conv/weights", "Const", &[]),
            node("conv", "Conv2D", &["Preprocessor/sub", "conv/weights"]),
            node("concat", "ConcatV2", &["conv", "conv", "axis"]),
            node("axis", "Const", &[]),
            node("concat_1", "Identity", &["conv"]),
            node("Postprocessor/nms", "NonMaxSuppressionV3", &["concat", "concat_1"]),
            node("detection_boxes", "Identity", &["Postprocessor/nms"]),
        ])
    }

    #[test]
    fn test_prune_strips_preprocessing_and_postprocessing() {
        let g = ssd_like();
        let spec = PruneSpec::new(["Preprocessor/sub:0"], ["concat:0", "concat_1"]).unwrap();
        let outcome = prune(&g, &spec).unwrap();

        assert_eq!(
            outcome.graph.node_names(),
            vec!["Preprocessor/sub", "conv/weights", "conv", "concat", "axis", "concat_1"]
        );
        assert_eq!(outcome.kept, 6);
        assert_eq!(outcome.removed, 5);

        let input = outcome.graph.node("Preprocessor/sub").unwrap();
        assert_eq!(input.op, "Placeholder");
        assert!(input.input.is_empty());
        assert_eq!(
            input.attr.get("dtype").and_then(AttrValue::as_type),
            Some(DataType::DtFloat)
        );
    }

    #[test]
    fn test_three_node_chain_drops_unreferenced_node() {
        let mut add = node("add", "AddConst", &["input"]);
        add.attr.insert(
            "value".into(),
            AttrValue {
                value: Some(crate::graph::proto::attr_value::Value::F(1.0)),
            },
        );
        let g = graph(vec![
            node("input", "Placeholder", &[]),
            add,
            node("identity", "Identity", &["add"]),
            node("unused", "Const", &[]),
        ]);
        let outcome = prune(&g, &PruneSpec::new(["input"], ["identity"]).unwrap()).unwrap();
        assert_eq!(outcome.graph.node_names(), vec!["input", "add", "identity"]);
        assert_eq!(outcome.removed, 1);
    }

    #[test]
    fn test_constant_feeding_the_add_is_kept() {
        let g = graph(vec![
            node("input", "Placeholder", &[]),
            node("bias", "Const", &[]),
            node("add", "AddV2", &["input", "bias"]),
            node("identity", "Identity", &["add"]),
            node("unused", "Const", &[]),
        ]);
        let outcome = prune(&g, &PruneSpec::new(["input"], ["identity"]).unwrap()).unwrap();
        assert_eq!(
            outcome.graph.node_names(),
            vec!["input", "bias", "add", "identity"]
        );
    }

    #[test]
    fn test_control_dependencies_are_followed() {
        let g = graph(vec![
            node("input", "Placeholder", &[]),
            node("assert", "Assert", &[]),
            node("out", "Identity", &["input", "^assert"]),
        ]);
        let outcome = prune(&g, &PruneSpec::new(["input"], ["out"]).unwrap()).unwrap();
        assert!(outcome.graph.contains("assert"));
    }

    #[test]
    fn test_prune_is_idempotent() {
        let g = ssd_like();
        let spec = PruneSpec::new(["Preprocessor/sub"], ["concat", "concat_1"]).unwrap();
        let once = prune(&g, &spec).unwrap().graph;
        let twice = prune(&once, &spec).unwrap();
        assert_eq!(twice.graph.node_names(), once.node_names());
        assert_eq!(twice.graph.to_bytes(), once.to_bytes());
        assert_eq!(twice.removed, 0);
    }

    #[test]
    fn test_declared_shape_is_applied() {
        let g = ssd_like();
        let spec = PruneSpec::new(["Preprocessor/sub"], ["concat"])
            .unwrap()
            .with_input_shape("Preprocessor/sub", vec![1, 300, 300, 3]);
        let pruned = prune(&g, &spec).unwrap().graph;
        let shape = pruned
            .node("Preprocessor/sub")
            .and_then(|n| n.attr.get("shape"))
            .and_then(AttrValue::as_shape)
            .unwrap();
        assert_eq!(shape.dims(), vec![1, 300, 300, 3]);
    }

    #[test]
    fn test_unknown_names_fail() {
        let g = ssd_like();
        let err = prune(&g, &PruneSpec::new(["missing"], ["concat"]).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            StripError::Prune(PruneError::UnknownInput { ref name }) if name == "missing"
        ));

        let err = prune(&g, &PruneSpec::new(["Preprocessor/sub"], ["nope"]).unwrap()).unwrap_err();
        assert!(matches!(err, StripError::Prune(PruneError::UnknownOutput { .. })));

        let err = prune(&g, &PruneSpec::new(Vec::<String>::new(), ["concat"]).unwrap()).unwrap_err();
        assert!(matches!(err, StripError::Prune(PruneError::EmptySpec)));
    }

    #[test]
    fn test_output_not_depending_on_inputs_fails() {
        let g = ssd_like();
        let err = prune(&g, &PruneSpec::new(["Preprocessor/sub"], ["axis"]).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            StripError::Prune(PruneError::OutputUnreachable { ref output }) if output == "axis"
        ));
    }

    #[test]
    fn test_dangling_input_fails() {
        let g = graph(vec![
            node("input", "Placeholder", &[]),
            node("out", "Add", &["input", "ghost:1"]),
        ]);
        let err = prune(&g, &PruneSpec::new(["input"], ["out"]).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            StripError::Graph(GraphError::DanglingInput { ref input, .. }) if input == "ghost:1"
        ));
    }

    #[test]
    fn test_malformed_names_fail() {
        let err = PruneSpec::new(["input"], ["odd:name"]).unwrap_err();
        assert!(matches!(
            err,
            GraphError::InvalidTensorRef { ref reference } if reference == "odd:name"
        ));

        let g = ssd_like();
        let mut spec = PruneSpec::new(["Preprocessor/sub"], ["concat"]).unwrap();
        spec.output_nodes.push("concat:x".into());
        let err = prune(&g, &spec).unwrap_err();
        assert!(matches!(
            err,
            StripError::Graph(GraphError::InvalidTensorRef { .. })
        ));
    }

    #[test]
    fn test_prune_spec_serde() {
        let spec = PruneSpec::new(["a:0"], ["b", "b:0", "^b"])
            .unwrap()
            .with_dtype(DataType::DtUint8);
        assert_eq!(spec.output_nodes, vec!["b".to_string()]);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"uint8\""));
        let parsed: PruneSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, spec);
    }
}
