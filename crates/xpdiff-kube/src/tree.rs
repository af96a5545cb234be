//! Live resource tree rooted at a composite

use serde_json::Value as JsonValue;

/// One node of the cluster-reported resource tree
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// The resource at this node
    pub resource: JsonValue,
    /// Direct children
    pub children: Vec<ResourceNode>,
}

impl ResourceNode {
    /// Create a leaf node
    pub fn new(resource: JsonValue) -> Self {
        Self {
            resource,
            children: Vec::new(),
        }
    }

    /// Depth-first walk of every descendant, excluding this node
    pub fn descendants(&self) -> Vec<&JsonValue> {
        let mut out = Vec::new();
        for child in &self.children {
            out.push(&child.resource);
            out.extend(child.descendants());
        }
        out
    }

    /// Total node count including this node
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(ResourceNode::len).sum::<usize>()
    }

    /// True when the tree is only the root
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
