//! Type-safe config field path.

use std::fmt;

/// A config field path such as `resolve.timeout_ms`.
///
/// Each section exposes its fields as constants so diagnostics never carry
/// hand-typed strings:
///
/// ```ignore
/// diag.error(ResolveConfig::TIMEOUT_MS, "must be greater than zero");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPath(pub &'static str);

impl FieldPath {
    #[inline]
    pub const fn new(path: &'static str) -> Self {
        Self(path)
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.0)
    }
}

impl AsRef<str> for FieldPath {
    fn as_ref(&self) -> &str {
        self.0
    }
}
