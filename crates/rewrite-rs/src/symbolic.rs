//! Symbolic rewrites: backend-specific translations installed into an [`ExportTable`].
//!
//! Registrations are grouped by [`SymbolicKey`]: the operator name plus whether it names a
//! native operator or a user function. Native operators and user functions sharing a name are
//! distinct groups. [`SymbolicRewriter::install`] picks one entry per group for a backend and
//! installs it as the table override for that operator.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::backend::Backend;
use crate::config::RewriteConfig;
use crate::dispatch::{Resolution, RewriteTable};
use crate::error::{RewriteError, RewriteKind, RewriteResult};
use crate::export::{ExportTable, GraphBuilder, SymbolicArg, Translation, ValueId};

/// Symbolic translation with access to the export context.
pub type SymbolicFn =
    dyn Fn(&SymbolicContext<'_>, &mut GraphBuilder, &[SymbolicArg]) -> Result<Vec<ValueId>>
        + Send
        + Sync;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolicKey {
    pub name: String,
    /// `true` for native operators, `false` for user functions addressed by path.
    pub native: bool,
}

impl fmt::Display for SymbolicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.native {
            write!(f, "native `{}`", self.name)
        } else {
            write!(f, "function `{}`", self.name)
        }
    }
}

/// Expected kind of one traced argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgDescriptor {
    Value,
    Int,
    Float,
    Bool,
    Str,
    Ints,
    Floats,
    /// Accepts anything; the translation inspects the argument itself.
    None,
}

impl ArgDescriptor {
    pub fn as_str(self) -> &'static str {
        match self {
            ArgDescriptor::Value => "v",
            ArgDescriptor::Int => "i",
            ArgDescriptor::Float => "f",
            ArgDescriptor::Bool => "b",
            ArgDescriptor::Str => "s",
            ArgDescriptor::Ints => "is",
            ArgDescriptor::Floats => "fs",
            ArgDescriptor::None => "none",
        }
    }

    pub fn accepts(self, arg: &SymbolicArg) -> bool {
        match self {
            ArgDescriptor::None => true,
            ArgDescriptor::Value => matches!(arg, SymbolicArg::Value(_)),
            ArgDescriptor::Int => matches!(arg, SymbolicArg::Int(_) | SymbolicArg::Bool(_)),
            ArgDescriptor::Float => matches!(arg, SymbolicArg::Float(_) | SymbolicArg::Int(_)),
            ArgDescriptor::Bool => matches!(arg, SymbolicArg::Bool(_) | SymbolicArg::Int(_)),
            ArgDescriptor::Str => matches!(arg, SymbolicArg::Str(_)),
            ArgDescriptor::Ints => matches!(arg, SymbolicArg::Ints(_)),
            ArgDescriptor::Floats => matches!(arg, SymbolicArg::Floats(_) | SymbolicArg::Ints(_)),
        }
    }

    pub fn parse_all<S: AsRef<str>>(descriptors: &[S]) -> RewriteResult<Vec<Self>> {
        descriptors.iter().map(|raw| raw.as_ref().parse()).collect()
    }
}

impl FromStr for ArgDescriptor {
    type Err = RewriteError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "v" => Ok(ArgDescriptor::Value),
            "i" => Ok(ArgDescriptor::Int),
            "f" => Ok(ArgDescriptor::Float),
            "b" => Ok(ArgDescriptor::Bool),
            "s" => Ok(ArgDescriptor::Str),
            "is" => Ok(ArgDescriptor::Ints),
            "fs" => Ok(ArgDescriptor::Floats),
            "none" => Ok(ArgDescriptor::None),
            other => Err(RewriteError::Config(format!(
                "unknown argument descriptor `{other}`"
            ))),
        }
    }
}

impl fmt::Display for ArgDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn validate_args(
    operator: &str,
    descriptors: &[ArgDescriptor],
    args: &[SymbolicArg],
) -> RewriteResult<()> {
    if descriptors.len() != args.len() {
        return Err(RewriteError::argument_mismatch(
            operator,
            format!("expected {} arguments, got {}", descriptors.len(), args.len()),
        ));
    }
    for (index, (descriptor, arg)) in descriptors.iter().zip(args).enumerate() {
        if !descriptor.accepts(arg) {
            return Err(RewriteError::argument_mismatch(
                operator,
                format!(
                    "argument {index} must match `{descriptor}`, got {}",
                    arg.kind()
                ),
            ));
        }
    }
    Ok(())
}

/// Registration parameters of a symbolic rewrite.
#[derive(Clone, Debug)]
pub struct SymbolicSpec {
    pub name: String,
    pub backend: Backend,
    pub native: bool,
    pub arg_descriptors: Option<Vec<ArgDescriptor>>,
}

impl SymbolicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: Backend::default(),
            native: false,
            arg_descriptors: None,
        }
    }

    pub fn backend(mut self, backend: impl Into<Backend>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    pub fn arg_descriptors<S: AsRef<str>>(mut self, descriptors: &[S]) -> RewriteResult<Self> {
        self.arg_descriptors = Some(ArgDescriptor::parse_all(descriptors)?);
        Ok(self)
    }

    pub fn key(&self) -> SymbolicKey {
        SymbolicKey {
            name: self.name.clone(),
            native: self.native,
        }
    }
}

/// Capability handed to a symbolic rewrite.
pub struct SymbolicContext<'a> {
    name: &'a str,
    cfg: &'a RewriteConfig,
    backend: &'a Backend,
    opset: u32,
    origin: Option<&'a Translation>,
}

impl SymbolicContext<'_> {
    pub fn cfg(&self) -> &RewriteConfig {
        self.cfg
    }

    pub fn backend(&self) -> &Backend {
        self.backend
    }

    pub fn opset(&self) -> u32 {
        self.opset
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Runs the operator's built-in translation.
    pub fn origin_symbolic(
        &self,
        g: &mut GraphBuilder,
        args: &[SymbolicArg],
    ) -> Result<Vec<ValueId>> {
        let origin = self
            .origin
            .ok_or_else(|| anyhow!("`{}` has no built-in translation", self.name))?;
        origin(g, args)
    }
}

#[derive(Clone)]
struct SymbolicEntry {
    implementation: Arc<SymbolicFn>,
    arg_descriptors: Option<Arc<[ArgDescriptor]>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledSymbolic {
    pub key: SymbolicKey,
    pub backend: Backend,
    pub resolution: Resolution,
}

#[derive(Clone, Debug, Default)]
pub struct InstallReport {
    pub installed: Vec<InstalledSymbolic>,
    /// Groups with neither a backend nor a default entry.
    pub skipped: Vec<SymbolicKey>,
}

impl InstallReport {
    pub fn is_installed(&self, name: &str, native: bool) -> bool {
        self.installed
            .iter()
            .any(|entry| entry.key.name == name && entry.key.native == native)
    }
}

pub struct SymbolicRewriter {
    table: RwLock<RewriteTable<SymbolicKey, SymbolicEntry>>,
}

impl SymbolicRewriter {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(RewriteTable::new()),
        }
    }

    pub fn register<F>(&self, spec: SymbolicSpec, implementation: F) -> &Self
    where
        F: Fn(&SymbolicContext<'_>, &mut GraphBuilder, &[SymbolicArg]) -> Result<Vec<ValueId>>
            + Send
            + Sync
            + 'static,
    {
        let key = spec.key();
        let entry = SymbolicEntry {
            implementation: Arc::new(implementation),
            arg_descriptors: spec.arg_descriptors.map(Arc::from),
        };
        let replaced = self
            .table
            .write()
            .expect("symbolic rewriter poisoned")
            .insert(key.clone(), spec.backend.clone(), entry);
        if replaced.is_some() {
            debug!(%key, backend = %spec.backend, "replaced symbolic rewrite");
        }
        self
    }

    pub fn remove(&self, name: &str, native: bool, backend: impl Into<Backend>) -> bool {
        let key = SymbolicKey {
            name: name.to_string(),
            native,
        };
        self.table
            .write()
            .expect("symbolic rewriter poisoned")
            .remove(&key, &backend.into())
            .is_some()
    }

    pub fn keys(&self) -> Vec<SymbolicKey> {
        self.table
            .read()
            .expect("symbolic rewriter poisoned")
            .identities()
            .cloned()
            .collect()
    }

    pub fn backends(&self) -> BTreeSet<Backend> {
        self.table
            .read()
            .expect("symbolic rewriter poisoned")
            .backends()
    }

    /// Installs the translations selected for `backend` into `table` at `opset`.
    ///
    /// Each group resolves to its backend entry, else its default entry, else is skipped.
    /// Overrides installed by earlier calls for skipped groups stay in place. Every selected
    /// user function must already be defined in `table`; otherwise nothing is installed.
    pub fn install(
        &self,
        table: &ExportTable,
        cfg: &RewriteConfig,
        backend: impl Into<Backend>,
        opset: u32,
    ) -> RewriteResult<InstallReport> {
        let backend = backend.into();
        let mut report = InstallReport::default();
        let selected: Vec<(SymbolicKey, SymbolicEntry, Resolution)> = {
            let rewrites = self.table.read().expect("symbolic rewriter poisoned");
            let mut selected = Vec::new();
            for key in rewrites.identities() {
                match rewrites.resolve(key, &backend) {
                    Some(resolved) => selected.push((
                        key.clone(),
                        resolved.entry.implementation.clone(),
                        resolved.resolution,
                    )),
                    None => report.skipped.push(key.clone()),
                }
            }
            selected
        };

        if let Some((key, _, _)) = selected
            .iter()
            .find(|(key, _, _)| !key.native && !table.has_function(&key.name))
        {
            return Err(RewriteError::unresolved(RewriteKind::Symbolic, key.name.as_str()));
        }

        let cfg = Arc::new(cfg.clone());
        for (key, entry, resolution) in selected {
            let origin = if key.native {
                table.builtin_native(&key.name, opset)
            } else {
                table.builtin_function(&key.name)
            };
            let translation = bind_translation(&key.name, entry, &cfg, &backend, opset, origin);
            if key.native {
                table.install_native(&key.name, opset, translation);
            } else {
                table.install_function(&key.name, translation)?;
            }
            debug!(%key, %backend, opset, ?resolution, "registered extra symbolic");
            report.installed.push(InstalledSymbolic {
                key,
                backend: backend.clone(),
                resolution,
            });
        }
        Ok(report)
    }
}

impl Default for SymbolicRewriter {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_translation(
    name: &str,
    entry: SymbolicEntry,
    cfg: &Arc<RewriteConfig>,
    backend: &Backend,
    opset: u32,
    origin: Option<Arc<Translation>>,
) -> Arc<Translation> {
    let name = name.to_string();
    let cfg = Arc::clone(cfg);
    let backend = backend.clone();
    Arc::new(move |g: &mut GraphBuilder, args: &[SymbolicArg]| -> Result<Vec<ValueId>> {
        if let Some(descriptors) = &entry.arg_descriptors {
            validate_args(&name, descriptors, args)?;
        }
        let ctx = SymbolicContext {
            name: &name,
            cfg: &cfg,
            backend: &backend,
            opset,
            origin: origin.as_deref(),
        };
        (entry.implementation)(&ctx, g, args)
    })
}

/// Installs the process-wide symbolic rewrites selected for `backend` into `table`.
pub fn register_extra_symbolics(
    table: &ExportTable,
    cfg: &RewriteConfig,
    backend: impl Into<Backend>,
    opset: u32,
) -> RewriteResult<InstallReport> {
    crate::registry::global()
        .symbolics
        .install(table, cfg, backend, opset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_descriptor_letters() {
        let parsed = ArgDescriptor::parse_all(&["v", "i", "fs", "none"]).unwrap();
        assert_eq!(
            parsed,
            vec![
                ArgDescriptor::Value,
                ArgDescriptor::Int,
                ArgDescriptor::Floats,
                ArgDescriptor::None
            ]
        );
        assert!("x".parse::<ArgDescriptor>().is_err());
    }

    #[test]
    fn validation_reports_the_offending_argument() {
        let descriptors = [ArgDescriptor::Value, ArgDescriptor::Int];
        let args = [SymbolicArg::Value(ValueId(0)), SymbolicArg::Str("dim".into())];
        let err = validate_args("cummax", &descriptors, &args).unwrap_err();
        match err {
            RewriteError::ArgumentMismatch { operator, message } => {
                assert_eq!(operator, "cummax");
                assert!(message.contains("argument 1"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(validate_args("cummax", &descriptors, &args[..1]).is_err());
    }

    #[test]
    fn bool_and_int_are_interchangeable() {
        assert!(ArgDescriptor::Int.accepts(&SymbolicArg::Bool(true)));
        assert!(ArgDescriptor::Bool.accepts(&SymbolicArg::Int(0)));
        assert!(!ArgDescriptor::Value.accepts(&SymbolicArg::None));
    }
}
