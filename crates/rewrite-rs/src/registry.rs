//! Process-wide rewrite registry.
//!
//! Registration attributes append a registrar to [`REWRITE_REGISTRARS`]; the first call to
//! [`global`] runs every registrar against a fresh [`RewriteRegistry`] before publishing it.
//! Further registrations can still be made at runtime through the registries' own methods.

use std::sync::OnceLock;

use tracing::debug;

use crate::function::FunctionRewriter;
use crate::patch::ModuleRewriter;
use crate::symbolic::SymbolicRewriter;

/// One registry of each rewrite kind.
#[derive(Default)]
pub struct RewriteRegistry {
    pub functions: FunctionRewriter,
    pub modules: ModuleRewriter,
    pub symbolics: SymbolicRewriter,
}

impl RewriteRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[linkme::distributed_slice]
pub static REWRITE_REGISTRARS: [fn(&RewriteRegistry)] = [..];

static GLOBAL_REGISTRY: OnceLock<RewriteRegistry> = OnceLock::new();

pub fn global() -> &'static RewriteRegistry {
    GLOBAL_REGISTRY.get_or_init(|| {
        let registry = RewriteRegistry::new();
        for register in REWRITE_REGISTRARS.iter() {
            register(&registry);
        }
        debug!(
            registrars = REWRITE_REGISTRARS.len(),
            functions = registry.functions.identities().len(),
            modules = registry.modules.module_types().len(),
            symbolics = registry.symbolics.keys().len(),
            "initialized rewrite registry"
        );
        registry
    })
}
