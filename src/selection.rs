//! Nested selections.
//!
//! A selection may include child selections; every facet set on a parent is
//! inherited by its children unless a child overrides it. Nodes are stored in
//! an arena and refer to their parent by index.
//!
//! This is a library API for callers that build search queries: each
//! [`FacetGroup`] from [`SelectionTree::merge_facets_downstream`] is one query's
//! facet set. The `climsync` binary works on search results already fetched and
//! does not build selections itself.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::SyncError;

pub type Facets = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub struct SelectionNode {
    pub name: String,
    pub facets: Facets,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl SelectionNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Facets of one leaf selection after inheritance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetGroup {
    pub selection: String,
    pub facets: Facets,
}

#[derive(Debug, Clone)]
pub struct SelectionTree {
    nodes: Vec<SelectionNode>,
}

impl SelectionTree {
    pub fn new(name: impl Into<String>, facets: Facets) -> Self {
        Self {
            nodes: vec![SelectionNode {
                name: name.into(),
                facets,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&SelectionNode, SyncError> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| SyncError::NotFound(format!("selection node {}", id.0)))
    }

    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        facets: Facets,
    ) -> Result<NodeId, SyncError> {
        self.node(parent)?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(SelectionNode {
            name: name.into(),
            facets,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    /// Facets seen by `id`: its own, then those of each ancestor not already set.
    pub fn effective_facets(&self, id: NodeId) -> Result<Facets, SyncError> {
        let mut facets = Facets::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id)?;
            for (name, values) in &node.facets {
                facets
                    .entry(name.clone())
                    .or_insert_with(|| values.clone());
            }
            current = node.parent;
        }
        Ok(facets)
    }

    /// One facet group per leaf, in depth-first order.
    pub fn merge_facets_downstream(&self) -> Vec<FacetGroup> {
        let mut groups = Vec::new();
        let root = &self.nodes[0];
        let mut stack = vec![(self.root(), root.facets.clone())];

        while let Some((id, inherited)) = stack.pop() {
            let node = &self.nodes[id.0];
            if node.children.is_empty() {
                groups.push(FacetGroup {
                    selection: node.name.clone(),
                    facets: inherited,
                });
                continue;
            }
            for child_id in node.children.iter().rev() {
                let child = &self.nodes[child_id.0];
                let mut merged = inherited.clone();
                merged.extend(child.facets.clone());
                stack.push((*child_id, merged));
            }
        }
        groups
    }
}
