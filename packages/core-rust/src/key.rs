//! Query keys: a namespace plus ordered parameters.
//!
//! Keys double as prefixes. `transactions` matches every key in the
//! namespace, `transactions/list` matches every list page, and
//! `transactions/list/0/10` matches exactly one page.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One parameter of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    /// Numeric parameter such as `skip` or `take`.
    Int(u64),
    /// Textual parameter such as a sub-resource name.
    Str(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for KeyPart {
    fn from(value: u64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for KeyPart {
    fn from(value: usize) -> Self {
        Self::Int(value as u64)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Stable cache identifier composed of a namespace and parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    namespace: String,
    parts: Vec<KeyPart>,
}

impl QueryKey {
    /// Key with no parameters; as a prefix it matches the whole namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            parts: Vec::new(),
        }
    }

    /// Appends a parameter (builder style).
    #[must_use]
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.parts.push(part.into());
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Returns `true` if `prefix` names this key or one of its ancestors.
    #[must_use]
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.namespace == prefix.namespace && self.parts.starts_with(&prefix.parts)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace)?;
        for part in &self.parts {
            write!(f, ":{part}")?;
        }
        Ok(())
    }
}
