//! Operator export: translation tables and the tracer that drives them.
//!
//! An [`ExportTable`] maps every exportable operation to a translation that emits graph nodes.
//! User functions are keyed by their dotted path; native operators by name and opset. Each
//! entry has a built-in slot, filled by whoever defines the operation, and an installed slot
//! used by symbolic rewrites. Installed translations take precedence.

mod graph;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use tracing::{debug, trace};

use crate::error::{RewriteError, RewriteKind, RewriteResult};

pub use graph::{split_qualified, Attribute, ExportedGraph, GraphBuilder, Node, ValueId};

/// Argument passed to a translation, as seen by the tracer.
#[derive(Clone, Debug, PartialEq)]
pub enum SymbolicArg {
    Value(ValueId),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    None,
}

impl SymbolicArg {
    pub fn kind(&self) -> &'static str {
        match self {
            SymbolicArg::Value(_) => "value",
            SymbolicArg::Int(_) => "int",
            SymbolicArg::Float(_) => "float",
            SymbolicArg::Bool(_) => "bool",
            SymbolicArg::Str(_) => "string",
            SymbolicArg::Ints(_) => "int list",
            SymbolicArg::Floats(_) => "float list",
            SymbolicArg::None => "none",
        }
    }

    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            SymbolicArg::Value(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SymbolicArg::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<ValueId> for SymbolicArg {
    fn from(value: ValueId) -> Self {
        SymbolicArg::Value(value)
    }
}

impl From<i64> for SymbolicArg {
    fn from(value: i64) -> Self {
        SymbolicArg::Int(value)
    }
}

impl From<f64> for SymbolicArg {
    fn from(value: f64) -> Self {
        SymbolicArg::Float(value)
    }
}

impl From<bool> for SymbolicArg {
    fn from(value: bool) -> Self {
        SymbolicArg::Bool(value)
    }
}

/// Emits the nodes for one operation and returns its outputs.
pub type Translation =
    dyn Fn(&mut GraphBuilder, &[SymbolicArg]) -> Result<Vec<ValueId>> + Send + Sync;

#[derive(Clone, Default)]
struct Slots {
    builtin: Option<Arc<Translation>>,
    installed: Option<Arc<Translation>>,
}

#[derive(Default)]
pub struct ExportTable {
    functions: RwLock<HashMap<String, Slots>>,
    natives: RwLock<HashMap<String, BTreeMap<u32, Slots>>>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines the built-in translation of user function `path`.
    pub fn define_function<F>(&self, path: &str, translation: F) -> &Self
    where
        F: Fn(&mut GraphBuilder, &[SymbolicArg]) -> Result<Vec<ValueId>> + Send + Sync + 'static,
    {
        self.functions
            .write()
            .expect("export table poisoned")
            .entry(path.to_string())
            .or_default()
            .builtin = Some(Arc::new(translation));
        self
    }

    /// Defines the built-in translation of native operator `name`, effective from `opset` on.
    pub fn define_native<F>(&self, name: &str, opset: u32, translation: F) -> &Self
    where
        F: Fn(&mut GraphBuilder, &[SymbolicArg]) -> Result<Vec<ValueId>> + Send + Sync + 'static,
    {
        self.natives
            .write()
            .expect("export table poisoned")
            .entry(name.to_string())
            .or_default()
            .entry(opset)
            .or_default()
            .builtin = Some(Arc::new(translation));
        self
    }

    pub fn has_function(&self, path: &str) -> bool {
        self.functions
            .read()
            .expect("export table poisoned")
            .contains_key(path)
    }

    /// Installs an override for user function `path`, which must already be defined.
    pub fn install_function(&self, path: &str, translation: Arc<Translation>) -> RewriteResult<()> {
        let mut functions = self.functions.write().expect("export table poisoned");
        let slots = functions
            .get_mut(path)
            .ok_or_else(|| RewriteError::unresolved(RewriteKind::Symbolic, path))?;
        slots.installed = Some(translation);
        debug!(path, "installed function symbolic");
        Ok(())
    }

    /// Installs an override for native operator `name`, effective from `opset` on.
    pub fn install_native(&self, name: &str, opset: u32, translation: Arc<Translation>) {
        self.natives
            .write()
            .expect("export table poisoned")
            .entry(name.to_string())
            .or_default()
            .entry(opset)
            .or_default()
            .installed = Some(translation);
        debug!(name, opset, "installed native symbolic");
    }

    /// Drops every installed override, leaving the built-in translations.
    pub fn reset_installed(&self) {
        for slots in self
            .functions
            .write()
            .expect("export table poisoned")
            .values_mut()
        {
            slots.installed = None;
        }
        for versions in self
            .natives
            .write()
            .expect("export table poisoned")
            .values_mut()
        {
            for slots in versions.values_mut() {
                slots.installed = None;
            }
        }
    }

    pub fn installed_count(&self) -> usize {
        let functions = self
            .functions
            .read()
            .expect("export table poisoned")
            .values()
            .filter(|slots| slots.installed.is_some())
            .count();
        let natives = self
            .natives
            .read()
            .expect("export table poisoned")
            .values()
            .flat_map(|versions| versions.values())
            .filter(|slots| slots.installed.is_some())
            .count();
        functions + natives
    }

    pub fn builtin_function(&self, path: &str) -> Option<Arc<Translation>> {
        self.functions
            .read()
            .expect("export table poisoned")
            .get(path)
            .and_then(|slots| slots.builtin.clone())
    }

    pub fn builtin_native(&self, name: &str, opset: u32) -> Option<Arc<Translation>> {
        let natives = self.natives.read().expect("export table poisoned");
        pick_version(natives.get(name)?, opset, |slots| slots.builtin.clone())
    }

    /// Translation used when tracing user function `path`.
    pub fn resolve_function(&self, path: &str) -> Option<Arc<Translation>> {
        let functions = self.functions.read().expect("export table poisoned");
        let slots = functions.get(path)?;
        slots.installed.clone().or_else(|| slots.builtin.clone())
    }

    /// Translation used when tracing native operator `name` at `opset`.
    ///
    /// Versions above `opset` are ignored; among the rest the newest installed override wins,
    /// then the newest built-in.
    pub fn resolve_native(&self, name: &str, opset: u32) -> Option<Arc<Translation>> {
        let natives = self.natives.read().expect("export table poisoned");
        let versions = natives.get(name)?;
        pick_version(versions, opset, |slots| slots.installed.clone())
            .or_else(|| pick_version(versions, opset, |slots| slots.builtin.clone()))
    }
}

fn pick_version(
    versions: &BTreeMap<u32, Slots>,
    opset: u32,
    slot: impl Fn(&Slots) -> Option<Arc<Translation>>,
) -> Option<Arc<Translation>> {
    versions.range(..=opset).rev().find_map(|(_, slots)| slot(slots))
}

/// Handle given to the traced model; every operation it records goes through the table.
pub struct Tracer<'t> {
    table: &'t ExportTable,
    graph: GraphBuilder,
}

impl Tracer<'_> {
    pub fn opset(&self) -> u32 {
        self.graph.opset()
    }

    /// Raw access for emitting standard operators directly.
    pub fn graph(&mut self) -> &mut GraphBuilder {
        &mut self.graph
    }

    /// Records a call to user function `path`.
    pub fn apply(&mut self, path: &str, args: &[SymbolicArg]) -> Result<Vec<ValueId>> {
        let translation = self
            .table
            .resolve_function(path)
            .ok_or_else(|| RewriteError::unresolved(RewriteKind::Symbolic, path))?;
        trace!(path, "tracing function");
        translation(&mut self.graph, args)
    }

    /// Records a native operator call.
    pub fn native(&mut self, name: &str, args: &[SymbolicArg]) -> Result<Vec<ValueId>> {
        let opset = self.graph.opset();
        let translation = self.table.resolve_native(name, opset).ok_or_else(|| {
            anyhow!("native operator `{name}` has no translation at opset {opset}")
        })?;
        trace!(name, opset, "tracing native operator");
        translation(&mut self.graph, args)
    }
}

/// Traces `model` over `num_inputs` graph inputs and returns the exported graph.
pub fn export<F>(
    table: &ExportTable,
    opset: u32,
    num_inputs: usize,
    model: F,
) -> Result<ExportedGraph>
where
    F: FnOnce(&mut Tracer<'_>, &[ValueId]) -> Result<Vec<ValueId>>,
{
    let mut graph = GraphBuilder::new(opset);
    let inputs: Vec<ValueId> = (0..num_inputs).map(|_| graph.allocate_value()).collect();
    let mut tracer = Tracer { table, graph };
    let outputs = model(&mut tracer, &inputs)?;
    let exported = tracer.graph.finish(inputs, outputs);
    debug!(opset, nodes = exported.nodes.len(), "exported graph");
    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(
        op: &'static str,
    ) -> impl Fn(&mut GraphBuilder, &[SymbolicArg]) -> Result<Vec<ValueId>> {
        move |g, args| {
            let inputs: Vec<ValueId> = args.iter().filter_map(SymbolicArg::as_value).collect();
            Ok(vec![g.op(op, &inputs, [])?])
        }
    }

    #[test]
    fn native_lookup_uses_newest_version_not_above_opset() {
        let table = ExportTable::new();
        table
            .define_native("gelu", 9, emit("Gelu9"))
            .define_native("gelu", 13, emit("Gelu13"));

        let graph = export(&table, 11, 1, |tracer, inputs| {
            tracer.native("gelu", &[SymbolicArg::Value(inputs[0])])
        })
        .unwrap();
        assert_eq!(graph.qualified_ops(), vec!["Gelu9"]);
        assert!(table.resolve_native("gelu", 8).is_none());
    }

    #[test]
    fn installed_translation_wins_until_reset() {
        let table = ExportTable::new();
        table.define_function("ext.op", emit("Builtin"));
        table
            .install_function("ext.op", Arc::new(emit("custom::Installed")))
            .unwrap();
        let trace = |table: &ExportTable| {
            export(table, 11, 1, |tracer, inputs| {
                tracer.apply("ext.op", &[SymbolicArg::Value(inputs[0])])
            })
            .unwrap()
        };

        assert_eq!(trace(&table).qualified_ops(), vec!["custom::Installed"]);
        assert_eq!(table.installed_count(), 1);
        table.reset_installed();
        assert_eq!(trace(&table).qualified_ops(), vec!["Builtin"]);
    }

    #[test]
    fn installing_an_undefined_function_fails() {
        let table = ExportTable::new();
        let err = table
            .install_function("missing.op", Arc::new(emit("X")))
            .unwrap_err();
        assert!(matches!(err, RewriteError::UnresolvedSymbol { .. }));
    }

    #[test]
    fn exported_graph_serializes_to_json() {
        let table = ExportTable::new();
        table.define_native("cummax", 11, |g, args| {
            let inputs: Vec<ValueId> = args.iter().filter_map(SymbolicArg::as_value).collect();
            assert!(g.nodes().is_empty());
            let outputs = g.op_multi("CumMax", &inputs, [("dim", Attribute::Int(1))], 2)?;
            assert_eq!(g.nodes().len(), 1);
            Ok(outputs)
        });

        let graph = export(&table, 11, 1, |tracer, inputs| {
            tracer.native("cummax", &[SymbolicArg::Value(inputs[0])])
        })
        .unwrap();
        let json = graph.to_json_string().unwrap();
        assert!(json.contains(r#""op_type": "CumMax""#));
        let parsed: ExportedGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, graph);
    }

    #[test]
    fn builder_rejects_undefined_inputs() {
        let mut graph = GraphBuilder::new(11);
        assert!(graph.op("Relu", &[ValueId(3)], []).is_err());
    }
}
