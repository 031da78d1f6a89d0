//! Storage key generation for rate limiting.

use std::fmt;

/// Default prefix for every storage key.
pub const DEFAULT_KEY_PREFIX: &str = "quota";

/// Composite `(scope, identifier, qualifier)` key.
///
/// The qualifier names the algorithm and, for fixed windows, the window start.
/// Scope is length-prefixed so that no two distinct `(scope, identifier)` pairs
/// can render to the same string, whatever characters they contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    prefix: String,
    scope: String,
    identifier: String,
    qualifier: String,
}

impl RateKey {
    pub fn new(scope: &str, identifier: &str, qualifier: impl Into<String>) -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX, scope, identifier, qualifier)
    }

    pub fn with_prefix(
        prefix: &str,
        scope: &str,
        identifier: &str,
        qualifier: impl Into<String>,
    ) -> Self {
        Self {
            prefix: sanitize_component(prefix),
            scope: scope.to_string(),
            identifier: identifier.to_string(),
            qualifier: sanitize_component(&qualifier.into()),
        }
    }

    /// Same scope and identifier under a different qualifier.
    pub fn requalify(&self, qualifier: impl Into<String>) -> Self {
        Self {
            prefix: self.prefix.clone(),
            scope: self.scope.clone(),
            identifier: self.identifier.clone(),
            qualifier: sanitize_component(&qualifier.into()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.prefix,
            self.qualifier,
            self.scope.len(),
            self.scope,
            self.identifier
        )
    }
}

/// Prefixes and qualifiers are fixed-format tokens: no separators allowed.
fn sanitize_component(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
