//! `@token` references between node outputs
//!
//! Templates refer to earlier node outputs with `@Alias.field[0].sub`. The
//! [`parser`] turns text into structured [`TokenPath`]s and the resolver walks
//! them against the outputs collected so far.

pub mod parser;
mod resolver;

pub use parser::{scan, TokenSpan};
pub use resolver::{lookup, resolve};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("Token must start with '@': {0}")]
    MissingAt(String),
    #[error("Invalid alias in token: {0}")]
    InvalidAlias(String),
    #[error("Unexpected input in '{input}' at offset {offset}")]
    TrailingInput { input: String, offset: usize },
    #[error("Empty path")]
    EmptyPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => write!(f, ".{}", name),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// A parsed reference: the alias of a node output plus a path into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPath {
    pub alias: String,
    pub segments: Vec<PathSegment>,
}

impl fmt::Display for TokenPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.alias)?;
        for segment in &self.segments {
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

/// A token left verbatim in the resolved template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedToken {
    pub token: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,
    pub unresolved: Vec<UnresolvedToken>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}
