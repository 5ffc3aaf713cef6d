//! Module rewrites: substitute wrapper modules for matched nodes of a [`ModuleTree`].

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::backend::Backend;
use crate::config::RewriteConfig;
use crate::dispatch::{Resolution, RewriteTable};
use crate::module::{ModuleNode, ModuleTree, NodeId, NodeKind, SubModule};
use crate::tensor::Tensor;

/// Extra keyword arguments forwarded to wrapper constructors.
pub type Kwargs = Map<String, Value>;

/// Stand-in for a matched node; `original` is the subtree it replaced.
pub trait ModuleWrapper: Send + Sync {
    fn forward(&self, original: &SubModule<'_>, input: &Tensor) -> Result<Tensor>;
}

/// Wrapper type constructible from the node it replaces.
pub trait RewriteModule: ModuleWrapper + Sized + 'static {
    fn new(original: &SubModule<'_>, cfg: &RewriteConfig, kwargs: &Kwargs) -> Result<Self>;
}

pub type WrapperFactory =
    dyn Fn(&SubModule<'_>, &RewriteConfig, &Kwargs) -> Result<Arc<dyn ModuleWrapper>> + Send + Sync;

#[derive(Clone, Debug)]
pub struct PatchOptions {
    pub backend: Backend,
    /// Walk the whole tree; when `false` only the root node is considered.
    pub recursive: bool,
    pub kwargs: Kwargs,
}

impl PatchOptions {
    pub fn new(backend: impl Into<Backend>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            recursive: true,
            kwargs: Kwargs::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchedNode {
    pub path: String,
    pub type_path: String,
    pub resolution: Resolution,
}

#[derive(Clone, Debug, Default)]
pub struct PatchReport {
    pub replaced: Vec<PatchedNode>,
}

impl PatchReport {
    pub fn paths(&self) -> Vec<&str> {
        self.replaced.iter().map(|node| node.path.as_str()).collect()
    }
}

/// Backend-tagged wrapper constructors keyed by module type path.
pub struct ModuleRewriter {
    table: RwLock<RewriteTable<String, Arc<WrapperFactory>>>,
}

impl ModuleRewriter {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(RewriteTable::new()),
        }
    }

    /// Registers wrapper type `W` for `(module_type, backend)`.
    pub fn register<W: RewriteModule>(
        &self,
        module_type: &str,
        backend: impl Into<Backend>,
    ) -> &Self {
        self.register_factory(module_type, backend, |original, cfg, kwargs| {
            let wrapper = W::new(original, cfg, kwargs)?;
            Ok(Arc::new(wrapper) as Arc<dyn ModuleWrapper>)
        })
    }

    pub fn register_factory<F>(
        &self,
        module_type: &str,
        backend: impl Into<Backend>,
        factory: F,
    ) -> &Self
    where
        F: Fn(&SubModule<'_>, &RewriteConfig, &Kwargs) -> Result<Arc<dyn ModuleWrapper>>
            + Send
            + Sync
            + 'static,
    {
        let backend = backend.into();
        let replaced = self
            .table
            .write()
            .expect("module rewriter poisoned")
            .insert(module_type.to_string(), backend.clone(), Arc::new(factory));
        if replaced.is_some() {
            debug!(module_type, %backend, "replaced module rewrite");
        }
        self
    }

    pub fn remove(&self, module_type: &str, backend: impl Into<Backend>) -> bool {
        self.table
            .write()
            .expect("module rewriter poisoned")
            .remove(&module_type.to_string(), &backend.into())
            .is_some()
    }

    pub fn module_types(&self) -> Vec<String> {
        self.table
            .read()
            .expect("module rewriter poisoned")
            .identities()
            .cloned()
            .collect()
    }

    pub fn backends(&self) -> BTreeSet<Backend> {
        self.table
            .read()
            .expect("module rewriter poisoned")
            .backends()
    }

    /// Returns a copy of `model` with every matched node replaced by its wrapper.
    ///
    /// The walk stops at matched nodes, so a wrapper's own subtree is never rewritten, and
    /// nodes that are already wrappers are left alone. `model` itself is not modified.
    pub fn patch(
        &self,
        model: &ModuleTree,
        cfg: &RewriteConfig,
        options: &PatchOptions,
    ) -> Result<(ModuleTree, PatchReport)> {
        let matches = self.collect_matches(model, options);

        let mut patched = model.clone();
        let mut report = PatchReport::default();
        for (id, path, factory, resolution) in matches {
            let node = model
                .node(id)
                .cloned()
                .ok_or_else(|| anyhow!("module node {:?} out of range", id))?;
            let original = patched.push_node(ModuleNode {
                name: "module".to_string(),
                ..node.clone()
            });
            let wrapper = {
                let view = patched
                    .submodule(original)
                    .ok_or_else(|| anyhow!("relocated node {:?} missing", original))?;
                factory(&view, cfg, &options.kwargs)?
            };
            debug!(
                path = %path,
                type_path = %node.type_path,
                backend = %options.backend,
                ?resolution,
                "wrapping module"
            );
            report.replaced.push(PatchedNode {
                path,
                type_path: node.type_path.clone(),
                resolution,
            });
            patched.replace_node(
                id,
                ModuleNode {
                    name: node.name,
                    type_path: node.type_path,
                    kind: NodeKind::Wrapped { wrapper, original },
                },
            );
        }
        Ok((patched, report))
    }

    fn collect_matches(
        &self,
        model: &ModuleTree,
        options: &PatchOptions,
    ) -> Vec<(NodeId, String, Arc<WrapperFactory>, Resolution)> {
        let table = self.table.read().expect("module rewriter poisoned");
        let mut matches = Vec::new();
        let mut stack = vec![(model.root(), String::new())];
        while let Some((id, path)) = stack.pop() {
            let Some(node) = model.node(id) else {
                continue;
            };
            if node.is_wrapped() {
                continue;
            }
            if let Some(resolved) = table.resolve(&node.type_path, &options.backend) {
                matches.push((
                    id,
                    path,
                    Arc::clone(&resolved.entry.implementation),
                    resolved.resolution,
                ));
                continue;
            }
            if !options.recursive {
                continue;
            }
            for child in node.children().into_iter().rev() {
                if let Some(child_node) = model.node(child) {
                    let child_path = if path.is_empty() {
                        child_node.name.clone()
                    } else {
                        format!("{path}.{}", child_node.name)
                    };
                    stack.push((child, child_path));
                }
            }
        }
        matches
    }
}

impl Default for ModuleRewriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Patches `model` with the process-wide module rewrites for `backend`.
pub fn patch_model(
    model: &ModuleTree,
    cfg: &RewriteConfig,
    backend: impl Into<Backend>,
) -> Result<ModuleTree> {
    let options = PatchOptions::new(backend);
    let (patched, _report) = crate::registry::global()
        .modules
        .patch(model, cfg, &options)?;
    Ok(patched)
}
