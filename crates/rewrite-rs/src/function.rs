//! Function rewrites.
//!
//! Framework functions are reached through a [`SymbolTable`]: every call site names the
//! function by its dotted identity and calls [`SymbolTable::call`]. A [`FunctionRewriter`]
//! holds backend-tagged replacements; a [`RewriterContext`](crate::context::RewriterContext)
//! that binds the rewriter to a table activates the replacements resolved for its backend.
//! Nothing is patched in place, so leaving the scope is all it takes to restore the original
//! behavior.
//!
//! Callables are stored type-erased so one table can hold functions of different signatures.
//! The `(A, R)` pair named at the call site must match the signature the callable was
//! registered with.

use std::any::{type_name, Any};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, trace};

use crate::backend::Backend;
use crate::config::RewriteConfig;
use crate::context::{Activation, ActiveOverride, Scope};
use crate::dispatch::RewriteTable;
use crate::error::{RewriteError, RewriteKind, RewriteResult};
use crate::tensor::Tensor;

/// Replacement implementation: receives the rewrite context and the original arguments.
pub type RewriteFn<A, R> = dyn Fn(&RewriteContext<'_, A, R>, A) -> Result<R> + Send + Sync;

/// Live implementation behind a symbol identity.
pub type SymbolFn<A, R> = dyn Fn(A) -> Result<R> + Send + Sync;

/// Signature of the built-in binary tensor symbols.
pub type BinaryTensorArgs = (Tensor, Tensor);

fn signature_name<A: 'static, R: 'static>() -> &'static str {
    type_name::<fn(A) -> R>()
}

#[derive(Clone)]
pub(crate) struct ErasedRewrite {
    callable: Arc<dyn Any + Send + Sync>,
    signature: &'static str,
}

impl ErasedRewrite {
    fn new<A: 'static, R: 'static>(callable: Arc<RewriteFn<A, R>>) -> Self {
        Self {
            callable: Arc::new(callable),
            signature: signature_name::<A, R>(),
        }
    }

    fn typed<A: 'static, R: 'static>(
        &self,
        identity: &str,
    ) -> RewriteResult<Arc<RewriteFn<A, R>>> {
        self.callable
            .downcast_ref::<Arc<RewriteFn<A, R>>>()
            .cloned()
            .ok_or_else(|| RewriteError::SignatureMismatch {
                identity: identity.to_string(),
                expected: signature_name::<A, R>(),
                found: self.signature,
            })
    }
}

#[derive(Clone)]
struct ErasedSymbol {
    callable: Arc<dyn Any + Send + Sync>,
    signature: &'static str,
}

/// Capability handed to a function rewrite.
pub struct RewriteContext<'a, A, R> {
    identity: &'a str,
    scope: &'a Scope,
    origin: &'a dyn Fn(A) -> Result<R>,
}

impl<A, R> RewriteContext<'_, A, R> {
    pub fn cfg(&self) -> &RewriteConfig {
        self.scope.cfg()
    }

    pub fn backend(&self) -> &Backend {
        self.scope.backend()
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.scope.extra(key)
    }

    /// Identity this rewrite was dispatched for.
    pub fn identity(&self) -> &str {
        self.identity
    }

    /// Calls the implementation that was live before this override: the override of an
    /// enclosing scope, or the symbol's own implementation.
    pub fn origin_func(&self, args: A) -> Result<R> {
        (self.origin)(args)
    }
}

/// Backend-tagged function replacements keyed by dotted identity.
pub struct FunctionRewriter {
    table: RwLock<RewriteTable<String, ErasedRewrite>>,
}

impl FunctionRewriter {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(RewriteTable::new()),
        }
    }

    /// Registers `implementation` for `(func_name, backend)`, replacing any previous entry for
    /// that pair. Returns `self` so one implementation can be registered under several pairs.
    pub fn register<A, R, F>(
        &self,
        func_name: &str,
        backend: impl Into<Backend>,
        implementation: F,
    ) -> &Self
    where
        A: 'static,
        R: 'static,
        F: Fn(&RewriteContext<'_, A, R>, A) -> Result<R> + Send + Sync + 'static,
    {
        let backend = backend.into();
        let callable: Arc<RewriteFn<A, R>> = Arc::new(implementation);
        let replaced = self
            .table
            .write()
            .expect("function rewriter poisoned")
            .insert(func_name.to_string(), backend.clone(), ErasedRewrite::new(callable));
        if replaced.is_some() {
            debug!(func_name, %backend, "replaced function rewrite");
        }
        self
    }

    /// Removes the entry for `(func_name, backend)`; returns whether one existed.
    pub fn remove(&self, func_name: &str, backend: impl Into<Backend>) -> bool {
        self.table
            .write()
            .expect("function rewriter poisoned")
            .remove(&func_name.to_string(), &backend.into())
            .is_some()
    }

    pub fn identities(&self) -> Vec<String> {
        self.table
            .read()
            .expect("function rewriter poisoned")
            .identities()
            .cloned()
            .collect()
    }

    pub fn backends(&self) -> BTreeSet<Backend> {
        self.table
            .read()
            .expect("function rewriter poisoned")
            .backends()
    }

    pub fn has_backend(&self, backend: &Backend) -> bool {
        self.table
            .read()
            .expect("function rewriter poisoned")
            .has_backend(backend)
    }

    /// Resolves the overrides for `backend` against `symbols`.
    ///
    /// Every overridden identity must be defined in `symbols`.
    pub(crate) fn activate(
        &self,
        symbols: &SymbolTable,
        backend: &Backend,
    ) -> RewriteResult<Activation> {
        let table = self.table.read().expect("function rewriter poisoned");
        let mut overrides = HashMap::new();
        for resolved in table.resolve_all(backend) {
            if !symbols.contains(resolved.identity) {
                return Err(RewriteError::unresolved(
                    RewriteKind::Function,
                    resolved.identity.as_str(),
                ));
            }
            trace!(
                func_name = %resolved.identity,
                %backend,
                resolution = ?resolved.resolution,
                "activating function rewrite"
            );
            overrides.insert(
                resolved.identity.clone(),
                resolved.entry.implementation.clone(),
            );
        }
        Ok(Activation {
            table_id: symbols.id,
            overrides,
        })
    }
}

impl Default for FunctionRewriter {
    fn default() -> Self {
        Self::new()
    }
}

static SYMBOL_TABLE_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Dotted-path addressable functions; the indirection every rewritable call goes through.
pub struct SymbolTable {
    id: usize,
    symbols: RwLock<HashMap<String, ErasedSymbol>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            id: SYMBOL_TABLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Table preloaded with elementwise tensor arithmetic and matmul under `tensor.*`.
    pub fn with_tensor_ops() -> Self {
        let table = Self::new();
        table
            .define("tensor.add", |(lhs, rhs): BinaryTensorArgs| lhs.add(&rhs))
            .define("tensor.sub", |(lhs, rhs): BinaryTensorArgs| lhs.sub(&rhs))
            .define("tensor.mul", |(lhs, rhs): BinaryTensorArgs| lhs.mul(&rhs))
            .define("tensor.div", |(lhs, rhs): BinaryTensorArgs| lhs.div(&rhs))
            .define("tensor.matmul", |(lhs, rhs): BinaryTensorArgs| {
                lhs.matmul(&rhs)
            });
        table
    }

    /// Defines (or redefines) the implementation behind `identity`.
    pub fn define<A, R, F>(&self, identity: &str, implementation: F) -> &Self
    where
        A: 'static,
        R: 'static,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        let callable: Arc<SymbolFn<A, R>> = Arc::new(implementation);
        self.symbols.write().expect("symbol table poisoned").insert(
            identity.to_string(),
            ErasedSymbol {
                callable: Arc::new(callable),
                signature: signature_name::<A, R>(),
            },
        );
        self
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.symbols
            .read()
            .expect("symbol table poisoned")
            .contains_key(identity)
    }

    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .symbols
            .read()
            .expect("symbol table poisoned")
            .keys()
            .cloned()
            .collect();
        identities.sort();
        identities
    }

    /// The symbol's own implementation, ignoring any active override.
    pub fn get<A: 'static, R: 'static>(
        &self,
        identity: &str,
    ) -> RewriteResult<Arc<SymbolFn<A, R>>> {
        let symbol = self
            .symbols
            .read()
            .expect("symbol table poisoned")
            .get(identity)
            .cloned()
            .ok_or_else(|| RewriteError::unresolved(RewriteKind::Function, identity))?;
        symbol
            .callable
            .downcast_ref::<Arc<SymbolFn<A, R>>>()
            .cloned()
            .ok_or_else(|| RewriteError::SignatureMismatch {
                identity: identity.to_string(),
                expected: signature_name::<A, R>(),
                found: symbol.signature,
            })
    }

    /// Calls `identity`, honoring the overrides of every active scope bound to this table.
    pub fn call<A: 'static, R: 'static>(&self, identity: &str, args: A) -> Result<R> {
        let base = self.get::<A, R>(identity)?;
        let chain = crate::context::override_chain(self.id, identity);
        trace!(identity, overrides = chain.len(), "dispatching symbol");
        invoke_chain(identity, &chain, base.as_ref(), args)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke_chain<A: 'static, R: 'static>(
    identity: &str,
    chain: &[ActiveOverride],
    base: &SymbolFn<A, R>,
    args: A,
) -> Result<R> {
    let Some((innermost, outer)) = chain.split_first() else {
        return base(args);
    };
    let rewrite = innermost.rewrite.typed::<A, R>(identity)?;
    let origin = |args: A| invoke_chain(identity, outer, base, args);
    let ctx = RewriteContext {
        identity,
        scope: &innermost.scope,
        origin: &origin,
    };
    rewrite(&ctx, args)
}
