//! Declaration name rules.
//!
//! Names are checked the moment the parser reads them, before the block is
//! parsed, so a bad name aborts the parse immediately.

use std::collections::HashSet;

use woodwork_common::error::{ForbiddenReason, Result, WoodworkError};

/// Tracks names declared so far in one document.
#[derive(Debug, Default)]
pub struct NameValidator {
    seen: HashSet<String>,
}

impl NameValidator {
    /// Creates a validator with no names declared.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `name` or rejects it as reserved or duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`WoodworkError::ForbiddenVariableName`] if `name` equals
    /// `true`/`false` in any casing or was already accepted.
    pub fn check(&mut self, name: &str) -> Result<()> {
        if is_reserved(name) {
            return Err(forbidden(name, ForbiddenReason::Reserved));
        }
        if !self.seen.insert(name.to_string()) {
            return Err(forbidden(name, ForbiddenReason::Duplicate));
        }
        Ok(())
    }

    /// Returns `true` if `name` was accepted earlier.
    #[must_use]
    pub fn is_declared(&self, name: &str) -> bool {
        self.seen.contains(name)
    }
}

/// Returns `true` for names that are boolean literals in some casing.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    name.eq_ignore_ascii_case("true") || name.eq_ignore_ascii_case("false")
}

pub(crate) fn forbidden(name: &str, reason: ForbiddenReason) -> WoodworkError {
    tracing::debug!(name, %reason, "rejected declaration name");
    WoodworkError::ForbiddenVariableName {
        name: name.to_string(),
        reason,
    }
}
