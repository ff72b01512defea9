//! In-memory computation graph: decoding, lookup, summary and encoding.
//!
//! A [`Graph`] wraps a decoded [`GraphDef`] and keeps a name index over its
//! nodes. Node order is preserved exactly as it appears in the file, which
//! keeps pruning and re-encoding deterministic.

pub mod proto;

pub use proto::{AttrValue, DataType, GraphDef, NodeDef, TensorShapeProto};

use crate::error::GraphError;
use crate::persistence::atomic_write;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

/// A parsed node input reference: `node`, `node:port` or `^node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorRef {
    pub node: String,
    pub port: u32,
    pub control: bool,
}

impl TensorRef {
    pub fn parse(reference: &str) -> Result<Self, GraphError> {
        let invalid = || GraphError::InvalidTensorRef {
            reference: reference.to_string(),
        };
        if let Some(node) = reference.strip_prefix('^') {
            if node.is_empty() || node.contains(':') {
                return Err(invalid());
            }
            return Ok(Self {
                node: node.to_string(),
                port: 0,
                control: true,
            });
        }
        match reference.rsplit_once(':') {
            Some((node, port)) => {
                let port = port.parse::<u32>().map_err(|_| invalid())?;
                if node.is_empty() {
                    return Err(invalid());
                }
                Ok(Self {
                    node: node.to_string(),
                    port,
                    control: false,
                })
            }
            None if reference.is_empty() => Err(invalid()),
            None => Ok(Self {
                node: reference.to_string(),
                port: 0,
                control: false,
            }),
        }
    }

    /// The `node:port` tensor name for a data reference.
    pub fn tensor_name(&self) -> String {
        format!("{}:{}", self.node, self.port)
    }
}

impl fmt::Display for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.control {
            write!(f, "^{}", self.node)
        } else if self.port == 0 {
            write!(f, "{}", self.node)
        } else {
            write!(f, "{}:{}", self.node, self.port)
        }
    }
}

/// A decoded computation graph with a node-name index.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    def: GraphDef,
    index: HashMap<String, usize>,
}

impl Graph {
    /// Build a graph from a decoded `GraphDef`, rejecting duplicate names and
    /// malformed input references.
    pub fn from_def(def: GraphDef) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(def.node.len());
        for (i, node) in def.node.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode {
                    name: node.name.clone(),
                });
            }
            for input in &node.input {
                TensorRef::parse(input)?;
            }
        }
        Ok(Self { def, index })
    }

    /// Build a graph from nodes, keeping the version info of `template`.
    pub(crate) fn with_nodes(template: &GraphDef, nodes: Vec<NodeDef>) -> Result<Self, GraphError> {
        Self::from_def(GraphDef {
            node: nodes,
            library: template.library.clone(),
            version: template.version,
            versions: template.versions.clone(),
            debug_info: template.debug_info.clone(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GraphError> {
        Self::decode_named(bytes, "bytes")
    }

    fn decode_named(bytes: &[u8], source_name: &str) -> Result<Self, GraphError> {
        let def = GraphDef::decode(bytes).map_err(|e| GraphError::Decode {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        Self::from_def(def)
    }

    /// Read and decode a serialized graph file.
    pub fn load(path: &Path) -> Result<Self, GraphError> {
        let bytes = std::fs::read(path).map_err(|source| GraphError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let graph = Self::decode_named(&bytes, &path.display().to_string())?;
        tracing::debug!(path = %path.display(), nodes = graph.len(), "Loaded graph");
        Ok(graph)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.def.encode_to_vec()
    }

    /// Atomically write the serialized graph.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        atomic_write(path, &self.to_bytes())
    }

    pub fn def(&self) -> &GraphDef {
        &self.def
    }

    pub fn nodes(&self) -> &[NodeDef] {
        &self.def.node
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.index.get(name).map(|&i| &self.def.node[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.def.node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.def.node.is_empty()
    }

    /// Node names in file order.
    pub fn node_names(&self) -> Vec<&str> {
        self.def.node.iter().map(|n| n.name.as_str()).collect()
    }

    /// Parsed input references of `node`, in declaration order.
    pub fn inputs_of<'a>(&'a self, node: &'a NodeDef) -> impl Iterator<Item = TensorRef> + 'a {
        // Every reference was parsed once already in `from_def`.
        node.input
            .iter()
            .filter_map(|input| TensorRef::parse(input).ok())
    }

    /// Edges as `(producer, consumer)` node-name pairs, control edges included.
    pub fn edges(&self) -> BTreeSet<(String, String)> {
        self.def
            .node
            .iter()
            .flat_map(|n| self.inputs_of(n).map(move |r| (r.node, n.name.clone())))
            .collect()
    }

    pub fn summary(&self) -> GraphSummary {
        let mut op_counts = BTreeMap::new();
        let mut consumed = BTreeSet::new();
        for node in &self.def.node {
            *op_counts.entry(node.op.clone()).or_insert(0) += 1;
            consumed.extend(self.inputs_of(node).map(|r| r.node));
        }
        let placeholders = self
            .def
            .node
            .iter()
            .filter(|n| n.op == "Placeholder")
            .map(|n| n.name.clone())
            .collect();
        let terminals = self
            .def
            .node
            .iter()
            .filter(|n| !consumed.contains(&n.name) && n.op != "NoOp")
            .map(|n| n.name.clone())
            .collect();

        GraphSummary {
            node_count: self.def.node.len(),
            producer: self.def.versions.as_ref().map(|v| v.producer),
            op_counts,
            placeholders,
            terminals,
        }
    }
}

/// Overview of a graph, used to discover candidate input and output nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub node_count: usize,
    pub producer: Option<i32>,
    pub op_counts: BTreeMap<String, usize>,
    pub placeholders: Vec<String>,
    /// Nodes no other node consumes; the usual output candidates.
    pub terminals: Vec<String>,
}


#[cfg(test)]
mod tests {
    use super::test_support::{graph, node};
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_tensor_ref_parse() {
        assert_eq!(
            TensorRef::parse("Preprocessor/sub:0").unwrap(),
            TensorRef {
                node: "Preprocessor/sub".into(),
                port: 0,
                control: false
            }
        );
        let r = TensorRef::parse("concat_1:2").unwrap();
        assert_eq!((r.node.as_str(), r.port), ("concat_1", 2));
        let r = TensorRef::parse("^init").unwrap();
        assert!(r.control);
        assert_eq!(r.to_string(), "^init");
        assert_eq!(TensorRef::parse("add").unwrap().tensor_name(), "add:0");

        assert!(TensorRef::parse("").is_err());
        assert!(TensorRef::parse("^").is_err());
        assert!(TensorRef::parse("x:y").is_err());
        assert!(TensorRef::parse(":0").is_err());
    }

    #[test]
    fn test_malformed_input_reference_rejected() {
        let def = GraphDef {
            node: vec![
                node("odd", "Const", &[]),
                node("out", "Identity", &["odd:name"]),
            ],
            ..Default::default()
        };
        let err = Graph::from_def(def.clone()).unwrap_err();
        assert!(matches!(
            err,
            GraphError::InvalidTensorRef { ref reference } if reference == "odd:name"
        ));

        let err = Graph::from_bytes(&def.encode_to_vec()).unwrap_err();
        assert!(matches!(err, GraphError::InvalidTensorRef { .. }));
    }

    #[test]
    fn test_edges_use_parsed_references() {
        let g = graph(vec![
            node("a/b", "Const", &[]),
            node("init", "NoOp", &[]),
            node("split", "Split", &["a/b"]),
            node("out", "AddV2", &["split:1", "split:0", "^init"]),
        ]);
        let edges: Vec<(String, String)> = g.edges().into_iter().collect();
        assert_eq!(
            edges,
            vec![
                ("a/b".to_string(), "split".to_string()),
                ("init".to_string(), "out".to_string()),
                ("split".to_string(), "out".to_string()),
            ]
        );
        let refs: Vec<TensorRef> = g.inputs_of(g.node("out").unwrap()).collect();
        assert_eq!(refs[0].port, 1);
        assert!(refs[2].control);
    }

    #[test]
    fn test_duplicate_nodes_rejected() {
        let def = GraphDef {
            node: vec![node("a", "Const", &[]), node("a", "Identity", &[])],
            ..Default::default()
        };
        let err = Graph::from_def(def).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode { name } if name == "a"));
    }

    #[test]
    fn test_invalid_bytes_fail_to_decode() {
        let err = Graph::from_bytes(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, GraphError::Decode { .. }));
    }

    #[test]
    fn test_bytes_roundtrip_preserves_nodes_and_edges() {
        let mut add = node("add", "AddV2", &["input", "bias"]);
        add.attr
            .insert("T".into(), AttrValue::from_type(DataType::DtFloat));
        let g = graph(vec![
            node("input", "Placeholder", &[]),
            node("bias", "Const", &[]),
            add,
            node("out", "Identity", &["add", "^bias"]),
        ]);

        let decoded = Graph::from_bytes(&g.to_bytes()).unwrap();
        assert_eq!(decoded.node_names(), g.node_names());
        assert_eq!(decoded.edges(), g.edges());
        assert_eq!(decoded, g);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("graph.pb");
        let g = graph(vec![
            node("x", "Placeholder", &[]),
            node("y", "Identity", &["x"]),
        ]);
        g.save(&path).unwrap();
        let loaded = Graph::load(&path).unwrap();
        assert_eq!(loaded, g);
        assert_eq!(loaded.node("y").unwrap().input, vec!["x".to_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Graph::load(Path::new("/definitely/not/here.pb")).unwrap_err();
        assert!(matches!(err, GraphError::Read { .. }));
    }

    #[test]
    fn test_summary() {
        let g = graph(vec![
            node("input", "Placeholder", &[]),
            node("w", "Const", &[]),
            node("mul", "Mul", &["input", "w"]),
            node("out", "Identity", &["mul"]),
            node("stray", "Const", &[]),
        ]);
        let summary = g.summary();
        assert_eq!(summary.node_count, 5);
        assert_eq!(summary.op_counts.get("Const"), Some(&2));
        assert_eq!(summary.placeholders, vec!["input".to_string()]);
        assert_eq!(summary.terminals, vec!["out".to_string(), "stray".to_string()]);
    }
}
