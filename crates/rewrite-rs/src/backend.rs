//! Backend identifiers used to select among competing rewrites.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Name of the implicit fallback backend.
pub const DEFAULT_BACKEND: &str = "default";

/// Normalized identifier of a deployment target (e.g. `"tensorrt"`, `"ncnn"`).
///
/// Names are trimmed and lower-cased so `"TensorRT"` and `"tensorrt"` select the same rewrites.
/// An empty name is the default backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Backend(String);

impl Backend {
    pub fn new(name: &str) -> Self {
        let normalized = name.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Backend::default();
        }
        Backend(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_BACKEND
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend(DEFAULT_BACKEND.to_string())
    }
}

impl From<&str> for Backend {
    fn from(name: &str) -> Self {
        Backend::new(name)
    }
}

impl From<String> for Backend {
    fn from(name: String) -> Self {
        Backend::new(&name)
    }
}

impl From<&Backend> for Backend {
    fn from(backend: &Backend) -> Self {
        backend.clone()
    }
}

impl Borrow<str> for Backend {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Backend {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Backend::new(&raw))
    }
}
