//! Scoped rewrite contexts.
//!
//! A [`RewriterContext`] describes one deployment scope: the active backend, the configuration
//! payload and the function rewriters to activate. Entering it pushes a frame on a thread-local
//! stack and returns a [`ContextGuard`]; dropping the guard pops the frame, which restores the
//! behavior that was live before the scope. Frames nest with stack discipline.
//!
//! ```rust,ignore
//! let _guard = RewriterContext::new(cfg)
//!     .backend("tensorrt")
//!     .rewrite_functions(&registry.functions, &symbols)
//!     .enter()?;
//! let out = symbols.call::<(Tensor, Tensor), Tensor>("tensor.add", (x, y))?;
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::backend::Backend;
use crate::config::RewriteConfig;
use crate::error::{RewriteError, RewriteResult};
use crate::function::{ErasedRewrite, FunctionRewriter, SymbolTable};

thread_local! {
    static FRAME_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

static FRAME_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

struct Frame {
    id: u64,
    scope: Arc<Scope>,
}

/// Function overrides a scope installs for one symbol table.
pub(crate) struct Activation {
    pub(crate) table_id: usize,
    pub(crate) overrides: HashMap<String, ErasedRewrite>,
}

/// State of an entered scope, shared with the rewrites that run inside it.
pub struct Scope {
    cfg: Arc<RewriteConfig>,
    backend: Backend,
    extra: Map<String, Value>,
    activations: Vec<Activation>,
}

impl Scope {
    pub fn cfg(&self) -> &RewriteConfig {
        &self.cfg
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Extra field attached with [`RewriterContext::extra`].
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Number of function identities this scope overrides, across all bound symbol tables.
    pub fn override_count(&self) -> usize {
        self.activations
            .iter()
            .map(|activation| activation.overrides.len())
            .sum()
    }
}

/// Override live in one frame, captured for a single dispatch.
pub(crate) struct ActiveOverride {
    pub(crate) scope: Arc<Scope>,
    pub(crate) rewrite: ErasedRewrite,
}

/// Builder for a rewrite scope.
pub struct RewriterContext<'r> {
    cfg: RewriteConfig,
    backend: Option<Backend>,
    extra: Map<String, Value>,
    strict: bool,
    bindings: Vec<(&'r FunctionRewriter, &'r SymbolTable)>,
}

impl<'r> RewriterContext<'r> {
    /// Starts a scope description for `cfg`.
    ///
    /// Without an explicit [`backend`](Self::backend) the scope uses the backend declared by the
    /// configuration, or `"default"`.
    pub fn new(cfg: RewriteConfig) -> Self {
        Self {
            cfg,
            backend: None,
            extra: Map::new(),
            strict: crate::env::strict_enabled(),
            bindings: Vec::new(),
        }
    }

    pub fn backend(mut self, backend: impl Into<Backend>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Rejects backends that none of the bound function rewriters know.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Activates `rewriter`'s function rewrites for calls made through `symbols`.
    pub fn rewrite_functions(
        mut self,
        rewriter: &'r FunctionRewriter,
        symbols: &'r SymbolTable,
    ) -> Self {
        self.bindings.push((rewriter, symbols));
        self
    }

    /// Resolves every activation, then pushes the scope.
    ///
    /// Nothing is pushed when a lookup fails, so a failed entry leaves no override behind.
    pub fn enter(self) -> RewriteResult<ContextGuard> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => self.cfg.backend()?.unwrap_or_default(),
        };

        if self.strict
            && !backend.is_default()
            && !self.bindings.is_empty()
            && !self
                .bindings
                .iter()
                .any(|(rewriter, _)| rewriter.has_backend(&backend))
        {
            return Err(RewriteError::UnknownBackend { backend });
        }

        let activations = self
            .bindings
            .iter()
            .map(|(rewriter, symbols)| rewriter.activate(symbols, &backend))
            .collect::<RewriteResult<Vec<_>>>()?;

        let scope = Arc::new(Scope {
            cfg: Arc::new(self.cfg),
            backend,
            extra: self.extra,
            activations,
        });
        let id = FRAME_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        debug!(
            frame = id,
            backend = %scope.backend,
            overrides = scope.override_count(),
            "entering rewrite context"
        );
        FRAME_STACK.with(|stack| stack.borrow_mut().push(Frame { id, scope }));
        Ok(ContextGuard {
            id,
            _not_send: PhantomData,
        })
    }

    /// Runs `f` inside the scope; the scope is exited before the result is returned.
    pub fn run<F, T>(self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        let guard = self.enter()?;
        let result = f();
        drop(guard);
        result
    }
}

/// RAII guard that pops its scope when dropped.
///
/// Guards must be dropped in reverse order of creation on the thread that created them.
pub struct ContextGuard {
    id: u64,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    /// The scope this guard keeps active.
    pub fn scope(&self) -> Arc<Scope> {
        FRAME_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .find(|frame| frame.id == self.id)
                .map(|frame| Arc::clone(&frame.scope))
                .expect("rewrite context guard outlived its frame")
        })
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        FRAME_STACK.with(|stack| {
            let frame = stack
                .borrow_mut()
                .pop()
                .expect("rewrite context stack underflow: unmatched exit");
            assert_eq!(
                frame.id, self.id,
                "rewrite context stack corrupted: scopes exited out of order"
            );
            debug!(frame = frame.id, backend = %frame.scope.backend, "exiting rewrite context");
        });
    }
}

/// Innermost active scope on this thread.
pub fn current() -> Option<Arc<Scope>> {
    FRAME_STACK.with(|stack| stack.borrow().last().map(|frame| Arc::clone(&frame.scope)))
}

/// Backend of the innermost scope, or `"default"` outside any scope.
pub fn current_backend() -> Backend {
    current()
        .map(|scope| scope.backend.clone())
        .unwrap_or_default()
}

/// Number of scopes currently open on this thread.
pub fn depth() -> usize {
    FRAME_STACK.with(|stack| stack.borrow().len())
}

/// Overrides of `identity` on symbol table `table_id`, innermost first.
///
/// Within one scope, later `rewrite_functions` bindings sit above earlier ones.
pub(crate) fn override_chain(table_id: usize, identity: &str) -> Vec<ActiveOverride> {
    FRAME_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .flat_map(|frame| {
                frame
                    .scope
                    .activations
                    .iter()
                    .rev()
                    .filter(|activation| activation.table_id == table_id)
                    .filter_map(|activation| activation.overrides.get(identity))
                    .map(|rewrite| ActiveOverride {
                        scope: Arc::clone(&frame.scope),
                        rewrite: rewrite.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    })
}
