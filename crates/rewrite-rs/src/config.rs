//! Deployment configuration payload handed to every rewrite.
//!
//! The payload is free-form JSON. A few well-known pointers follow the deploy-config layout used
//! by export tooling: `/backend_config/type` names the target backend and
//! `/onnx_config/opset_version` the export opset.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::backend::Backend;
use crate::error::{RewriteError, RewriteResult};

const BACKEND_POINTER: &str = "/backend_config/type";
const OPSET_POINTER: &str = "/onnx_config/opset_version";

/// Free-form configuration visible to rewrites through `cfg()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RewriteConfig {
    value: Value,
}

impl RewriteConfig {
    pub fn new(value: Value) -> RewriteResult<Self> {
        match value {
            Value::Object(_) => Ok(Self { value }),
            Value::Null => Ok(Self::default()),
            other => Err(RewriteError::Config(format!(
                "configuration root must be an object, got {other}"
            ))),
        }
    }

    pub fn from_json_str(src: &str) -> RewriteResult<Self> {
        let value: Value = serde_json::from_str(src)?;
        Self::new(value)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> RewriteResult<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        self.value
            .as_object()
            .expect("rewrite config root is always an object")
    }

    /// Looks up a value by JSON pointer (`/a/b/0`).
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.value.pointer(pointer)
    }

    /// Deserializes the value at `pointer`, returning `None` when it is absent.
    pub fn get_as<T: DeserializeOwned>(&self, pointer: &str) -> RewriteResult<Option<T>> {
        match self.get(pointer) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(T::deserialize(value)?)),
        }
    }

    /// Backend declared by the configuration, if any.
    pub fn backend(&self) -> RewriteResult<Option<Backend>> {
        self.get_as(BACKEND_POINTER)
    }

    pub fn opset_version(&self) -> RewriteResult<Option<u32>> {
        self.get_as(OPSET_POINTER)
    }
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            value: Value::Object(Map::new()),
        }
    }
}

impl TryFrom<Value> for RewriteConfig {
    type Error = RewriteError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        RewriteConfig::new(value)
    }
}

impl<'de> Deserialize<'de> for RewriteConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        RewriteConfig::new(value).map_err(serde::de::Error::custom)
    }
}
