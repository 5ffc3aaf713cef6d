//! Exported graph representation and the builder handed to symbolic translations.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// SSA value flowing between exported nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Str(String),
}

impl From<i64> for Attribute {
    fn from(value: i64) -> Self {
        Attribute::Int(value)
    }
}

impl From<f64> for Attribute {
    fn from(value: f64) -> Self {
        Attribute::Float(value)
    }
}

impl From<Vec<i64>> for Attribute {
    fn from(value: Vec<i64>) -> Self {
        Attribute::Ints(value)
    }
}

impl From<Vec<f64>> for Attribute {
    fn from(value: Vec<f64>) -> Self {
        Attribute::Floats(value)
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        Attribute::Str(value.to_string())
    }
}

/// One operator in the exported graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op_type: String,
    /// Operator domain; empty for the standard domain.
    pub domain: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub attributes: BTreeMap<String, Attribute>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportedGraph {
    pub opset: u32,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub nodes: Vec<Node>,
}

impl ExportedGraph {
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// `domain::op_type` of every node, in emission order.
    pub fn qualified_ops(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|node| {
                if node.domain.is_empty() {
                    node.op_type.clone()
                } else {
                    format!("{}::{}", node.domain, node.op_type)
                }
            })
            .collect()
    }
}

/// Splits `"domain::type"`; a bare name belongs to the standard domain.
pub fn split_qualified(name: &str) -> (&str, &str) {
    match name.split_once("::") {
        Some((domain, op_type)) => (domain, op_type),
        None => ("", name),
    }
}

/// Graph under construction; translations emit nodes through [`GraphBuilder::op`].
pub struct GraphBuilder {
    opset: u32,
    next_value: u32,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new(opset: u32) -> Self {
        Self {
            opset,
            next_value: 0,
            nodes: Vec::new(),
        }
    }

    pub fn opset(&self) -> u32 {
        self.opset
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Allocates a value that no node produces (graph inputs).
    pub fn allocate_value(&mut self) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        value
    }

    /// Emits a single-output node named `"domain::type"`.
    pub fn op<'s, I>(&mut self, name: &str, inputs: &[ValueId], attributes: I) -> Result<ValueId>
    where
        I: IntoIterator<Item = (&'s str, Attribute)>,
    {
        let outputs = self.op_multi(name, inputs, attributes, 1)?;
        Ok(outputs[0])
    }

    /// Emits a node with `num_outputs` results.
    pub fn op_multi<'s, I>(
        &mut self,
        name: &str,
        inputs: &[ValueId],
        attributes: I,
        num_outputs: usize,
    ) -> Result<Vec<ValueId>>
    where
        I: IntoIterator<Item = (&'s str, Attribute)>,
    {
        let (domain, op_type) = split_qualified(name);
        ensure!(!op_type.is_empty(), "operator name `{name}` has an empty type");
        ensure!(num_outputs > 0, "operator `{name}` must produce at least one output");
        for input in inputs {
            ensure!(
                input.0 < self.next_value,
                "operator `{name}` consumes undefined value {input}"
            );
        }

        let outputs: Vec<ValueId> = (0..num_outputs).map(|_| self.allocate_value()).collect();
        self.nodes.push(Node {
            op_type: op_type.to_string(),
            domain: domain.to_string(),
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
            attributes: attributes
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        });
        Ok(outputs)
    }

    pub(crate) fn finish(self, inputs: Vec<ValueId>, outputs: Vec<ValueId>) -> ExportedGraph {
        ExportedGraph {
            opset: self.opset,
            inputs,
            outputs,
            nodes: self.nodes,
        }
    }
}
