use std::fmt;
use std::io;

use thiserror::Error;

use crate::backend::Backend;

/// Registry that raised an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RewriteKind {
    Function,
    Module,
    Symbolic,
}

impl fmt::Display for RewriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RewriteKind::Function => "function",
            RewriteKind::Module => "module",
            RewriteKind::Symbolic => "symbolic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("cannot resolve {kind} `{identity}`: no such symbol is defined")]
    UnresolvedSymbol {
        kind: RewriteKind,
        identity: String,
    },
    #[error("`{identity}` called as {expected} but the registered callable is {found}")]
    SignatureMismatch {
        identity: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("backend `{backend}` has no registered rewrites (strict mode)")]
    UnknownBackend { backend: Backend },
    #[error("invalid arguments for operator `{operator}`: {message}")]
    ArgumentMismatch { operator: String, message: String },
    #[error("invalid rewrite configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RewriteError {
    pub fn unresolved(kind: RewriteKind, identity: impl Into<String>) -> Self {
        RewriteError::UnresolvedSymbol {
            kind,
            identity: identity.into(),
        }
    }

    pub fn argument_mismatch(operator: impl Into<String>, message: impl Into<String>) -> Self {
        RewriteError::ArgumentMismatch {
            operator: operator.into(),
            message: message.into(),
        }
    }
}

pub type RewriteResult<T> = Result<T, RewriteError>;
