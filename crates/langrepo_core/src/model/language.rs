//! Language domain model.
//!
//! # Invariants
//! - `id` is a lowercase ISO 639 code with an optional uppercase region
//!   suffix (`en`, `pt-BR`).
//! - `name` is never blank.

use crate::model::identifier::IdentifierValue;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

static LANGUAGE_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]{2,3}(-[A-Z]{2})?$").expect("valid language code regex"));

/// Stable identifier of a language record.
pub type LanguageId = IdentifierValue;

/// Validation failures for `Language` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanguageValidationError {
    InvalidCode(String),
    BlankName,
}

impl Display for LanguageValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCode(code) => write!(f, "invalid language code `{code}`"),
            Self::BlankName => write!(f, "language name cannot be blank"),
        }
    }
}

impl Error for LanguageValidationError {}

/// A language offered by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    /// Language code, also the primary key.
    pub id: LanguageId,
    /// English display name.
    pub name: String,
    /// Name in the language itself, when known.
    pub native_name: Option<String>,
    pub enabled: bool,
    /// Sort position in language pickers; lower comes first.
    pub position: i64,
}

impl Language {
    /// Creates an enabled language at position `0`.
    pub fn new(id: impl Into<LanguageId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            native_name: None,
            enabled: true,
            position: 0,
        }
    }

    pub fn with_native_name(mut self, native_name: impl Into<String>) -> Self {
        self.native_name = Some(native_name.into());
        self
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Checks code format and name presence.
    pub fn validate(&self) -> Result<(), LanguageValidationError> {
        if !LANGUAGE_CODE_RE.is_match(self.id.as_str()) {
            return Err(LanguageValidationError::InvalidCode(self.id.to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(LanguageValidationError::BlankName);
        }
        Ok(())
    }
}
