use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Adaptor-specific options of a node, decoded by the adaptor itself.
pub type NodeOptions = serde_json::Map<String, serde_json::Value>;

/// A single adaptor in a pipeline tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeConfig {
    /// Unique name of the node within its pipeline.
    pub name: String,
    /// Registered name of the adaptor backing this node.
    #[serde(rename = "type")]
    pub adaptor: String,
    /// Name of the node whose messages this node receives. `None` marks the source.
    #[serde(default)]
    pub parent: Option<String>,
    /// Namespace routed to this node, `database.collection` or `database./regex/`.
    ///
    /// Also handed to the adaptor as its `namespace` option unless the options set one.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub options: NodeOptions,
}

impl NodeConfig {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Configuration of one pipeline: a tree of adaptor nodes rooted at a single source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    pub name: String,
    pub nodes: Vec<NodeConfig>,
    /// Number of non-fatal errors a single node may report before the pipeline shuts down.
    ///
    /// Unset means unlimited.
    #[serde(default)]
    pub error_threshold: Option<u64>,
}

impl PipelineConfig {
    /// Returns the source node, if the pipeline has exactly one.
    pub fn root(&self) -> Option<&NodeConfig> {
        let mut roots = self.nodes.iter().filter(|node| node.is_root());
        match (roots.next(), roots.next()) {
            (Some(root), None) => Some(root),
            _ => None,
        }
    }

    /// Returns the nodes in breadth-first order starting at the source.
    ///
    /// Nodes that cannot be reached from the source are not returned.
    pub fn nodes_top_down(&self) -> Vec<&NodeConfig> {
        let Some(root) = self.root() else {
            return Vec::new();
        };

        let mut children: HashMap<&str, Vec<&NodeConfig>> = HashMap::new();
        for node in &self.nodes {
            if let Some(parent) = &node.parent {
                children.entry(parent.as_str()).or_default().push(node);
            }
        }

        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            ordered.push(node);
            if let Some(node_children) = children.get(node.name.as_str()) {
                queue.extend(node_children.iter().copied());
            }
        }

        ordered
    }

    /// Validates the pipeline tree.
    ///
    /// Ensures there is exactly one source, node names are unique, every parent exists and
    /// every node is reachable from the source.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let roots = self.nodes.iter().filter(|node| node.is_root()).count();
        if roots != 1 {
            return Err(ValidationError::RootNodeCount {
                pipeline: self.name.clone(),
                found: roots,
            });
        }

        let mut names = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ValidationError::DuplicateNodeName(node.name.clone()));
            }
        }

        for node in &self.nodes {
            if let Some(parent) = &node.parent
                && !names.contains(parent.as_str())
            {
                return Err(ValidationError::UnknownParent {
                    node: node.name.clone(),
                    parent: parent.clone(),
                });
            }
        }

        if self.nodes_top_down().len() != self.nodes.len() {
            return Err(ValidationError::InvalidFieldValue {
                field: "pipeline.nodes".to_string(),
                constraint: "every node must be reachable from the source node".to_string(),
            });
        }

        if self.error_threshold == Some(0) {
            return Err(ValidationError::InvalidFieldValue {
                field: "pipeline.error_threshold".to_string(),
                constraint: "must be greater than 0 when set".to_string(),
            });
        }

        Ok(())
    }
}
