//! Typed identifier wrapper used as the repository lookup key.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// String-backed identifier value.
///
/// Converts losslessly into the store key through `Display`/`as_str`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierValue(String);

impl IdentifierValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Display for IdentifierValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentifierValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for IdentifierValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for IdentifierValue {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
