//! Module trees stored as an arena of nodes addressed by stable indices.
//!
//! A [`ModuleTree`] owns every node of a model. Leaf nodes hold a shared [`Layer`]; container
//! nodes refer to their children by [`NodeId`]. Cloning a tree copies the node table and shares
//! the layers, which is what lets `patch_model` produce a rewritten model without touching the
//! original.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};

use crate::patch::ModuleWrapper;
use crate::tensor::Tensor;

/// Index of a node inside its [`ModuleTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Leaf computation of a module tree.
pub trait Layer: Send + Sync {
    fn forward(&self, input: &Tensor) -> Result<Tensor>;
}

#[derive(Clone)]
pub enum NodeKind {
    Layer(Arc<dyn Layer>),
    /// Children applied in order.
    Sequential(Vec<NodeId>),
    /// `body(x) + shortcut(x)`, or `body(x) + x` without a shortcut.
    Residual {
        body: NodeId,
        shortcut: Option<NodeId>,
    },
    /// A rewrite wrapper standing in for the subtree rooted at `original`.
    Wrapped {
        wrapper: Arc<dyn ModuleWrapper>,
        original: NodeId,
    },
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Layer(_) => f.write_str("Layer"),
            NodeKind::Sequential(children) => f.debug_tuple("Sequential").field(children).finish(),
            NodeKind::Residual { body, shortcut } => f
                .debug_struct("Residual")
                .field("body", body)
                .field("shortcut", shortcut)
                .finish(),
            NodeKind::Wrapped { original, .. } => f
                .debug_struct("Wrapped")
                .field("original", original)
                .finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModuleNode {
    /// Attribute name under the parent (`"layer1"`, `"0"`); empty for the root.
    pub name: String,
    /// Type identity matched by module rewrites, e.g. `"torchvision.models.resnet.Bottleneck"`.
    pub type_path: String,
    pub kind: NodeKind,
}

impl ModuleNode {
    pub fn is_wrapped(&self) -> bool {
        matches!(self.kind, NodeKind::Wrapped { .. })
    }

    /// Structural children in forward order. A wrapped node's only child is its original.
    pub fn children(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::Layer(_) => Vec::new(),
            NodeKind::Sequential(children) => children.clone(),
            NodeKind::Residual { body, shortcut } => {
                std::iter::once(*body).chain(*shortcut).collect()
            }
            NodeKind::Wrapped { original, .. } => vec![*original],
        }
    }
}

#[derive(Clone)]
pub struct ModuleTree {
    nodes: Vec<ModuleNode>,
    root: NodeId,
}

impl ModuleTree {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&ModuleNode> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn submodule(&self, id: NodeId) -> Option<SubModule<'_>> {
        self.node(id).map(|_| SubModule { tree: self, id })
    }

    /// Resolves a dotted attribute path (`"layer1.0.conv1"`); the empty path is the root.
    pub fn get(&self, path: &str) -> Option<SubModule<'_>> {
        let mut current = self.root;
        if !path.is_empty() {
            for segment in path.split('.') {
                current = self
                    .node(current)?
                    .children()
                    .into_iter()
                    .find(|child| {
                        self.node(*child)
                            .is_some_and(|node| node.name == segment)
                    })?;
            }
        }
        self.submodule(current)
    }

    /// Every reachable node with its dotted path, depth-first from the root.
    pub fn paths(&self) -> Vec<(String, NodeId)> {
        let mut out = Vec::new();
        let mut stack = vec![(self.root, String::new())];
        while let Some((id, path)) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            for child in node.children().into_iter().rev() {
                if let Some(child_node) = self.node(child) {
                    stack.push((child, join_path(&path, &child_node.name)));
                }
            }
            out.push((path, id));
        }
        out
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_node(self.root, input)
    }

    pub fn forward_node(&self, id: NodeId, input: &Tensor) -> Result<Tensor> {
        let node = self
            .node(id)
            .ok_or_else(|| anyhow!("module node {:?} out of range", id))?;
        match &node.kind {
            NodeKind::Layer(layer) => layer.forward(input),
            NodeKind::Sequential(children) => {
                let mut hidden = input.clone();
                for child in children {
                    hidden = self.forward_node(*child, &hidden)?;
                }
                Ok(hidden)
            }
            NodeKind::Residual { body, shortcut } => {
                let out = self.forward_node(*body, input)?;
                let identity = match shortcut {
                    Some(shortcut) => self.forward_node(*shortcut, input)?,
                    None => input.clone(),
                };
                out.add(&identity)
            }
            NodeKind::Wrapped { wrapper, original } => {
                let original = SubModule {
                    tree: self,
                    id: *original,
                };
                wrapper.forward(&original, input)
            }
        }
    }

    pub(crate) fn push_node(&mut self, node: ModuleNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn replace_node(&mut self, id: NodeId, node: ModuleNode) {
        self.nodes[id.0] = node;
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

/// Borrowed view of one node, handed to wrappers as "the original submodule".
#[derive(Clone, Copy)]
pub struct SubModule<'a> {
    tree: &'a ModuleTree,
    id: NodeId,
}

impl<'a> SubModule<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node(&self) -> &'a ModuleNode {
        &self.tree.nodes[self.id.0]
    }

    pub fn name(&self) -> &'a str {
        &self.node().name
    }

    pub fn type_path(&self) -> &'a str {
        &self.node().type_path
    }

    pub fn children(&self) -> Vec<SubModule<'a>> {
        self.node()
            .children()
            .into_iter()
            .map(|id| SubModule {
                tree: self.tree,
                id,
            })
            .collect()
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.tree.forward_node(self.id, input)
    }
}

/// Bottom-up builder: children are created before the containers that hold them.
#[derive(Default)]
pub struct ModuleTreeBuilder {
    nodes: Vec<ModuleNode>,
}

impl ModuleTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer<L>(&mut self, name: &str, type_path: &str, layer: L) -> NodeId
    where
        L: Layer + 'static,
    {
        self.push(name, type_path, NodeKind::Layer(Arc::new(layer)))
    }

    pub fn sequential(&mut self, name: &str, type_path: &str, children: Vec<NodeId>) -> NodeId {
        self.push(name, type_path, NodeKind::Sequential(children))
    }

    pub fn residual(
        &mut self,
        name: &str,
        type_path: &str,
        body: NodeId,
        shortcut: Option<NodeId>,
    ) -> NodeId {
        self.push(name, type_path, NodeKind::Residual { body, shortcut })
    }

    fn push(&mut self, name: &str, type_path: &str, kind: NodeKind) -> NodeId {
        self.nodes.push(ModuleNode {
            name: name.to_string(),
            type_path: type_path.to_string(),
            kind,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Finishes the tree rooted at `root`.
    ///
    /// Every child must have been created before its parent and belong to exactly one parent.
    pub fn build(self, root: NodeId) -> Result<ModuleTree> {
        ensure!(
            root.0 < self.nodes.len(),
            "root {:?} out of range ({} nodes)",
            root,
            self.nodes.len()
        );
        let mut parents = vec![None; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            if node.is_wrapped() {
                bail!("node `{}` is a rewrite wrapper; build trees from plain nodes", node.name);
            }
            for child in node.children() {
                ensure!(
                    child.0 < index,
                    "child {:?} of `{}` must be created before its parent",
                    child,
                    node.name
                );
                if let Some(previous) = parents[child.0].replace(index) {
                    bail!(
                        "node {:?} has two parents ({} and {})",
                        child,
                        previous,
                        index
                    );
                }
            }
        }
        ensure!(
            parents[root.0].is_none(),
            "root {:?} is the child of another node",
            root
        );
        Ok(ModuleTree {
            nodes: self.nodes,
            root,
        })
    }
}
