extern crate self as rewrite_rs;

pub use linkme;

pub mod backend;
pub mod config;
pub mod context;
pub mod dispatch;
mod env;
pub mod error;
pub mod export;
pub mod function;
pub mod layers;
pub mod module;
pub mod patch;
pub mod registry;
pub mod symbolic;
pub mod tensor;

pub use backend::{Backend, DEFAULT_BACKEND};
pub use config::RewriteConfig;
pub use context::{ContextGuard, RewriterContext};
pub use error::{RewriteError, RewriteKind, RewriteResult};
pub use function::{FunctionRewriter, RewriteContext, SymbolTable};
pub use module::{ModuleTree, ModuleTreeBuilder, SubModule};
pub use patch::{patch_model, ModuleRewriter, ModuleWrapper, PatchOptions, RewriteModule};
pub use registry::{global, RewriteRegistry};
pub use rewrite_rs_macros::{register_rewrite_module, register_rewriter, register_symbolic};
pub use symbolic::{register_extra_symbolics, SymbolicContext, SymbolicRewriter, SymbolicSpec};
pub use tensor::{Shape, Tensor};
