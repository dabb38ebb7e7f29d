//! Endpoint path identifiers.

use std::fmt;
use std::sync::Arc;

/// A canonical endpoint path, e.g. `/greeter.Greeter/SayHello`.
///
/// Cheap to clone: the registry, dispatch engine, and every transport frame
/// pass this around by value, so it wraps an `Arc<str>` rather than owning a
/// fresh `String` at each hop.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(Arc<str>);

impl Path {
    /// Build a path from `package`, `service`, and `method` names, applying
    /// the canonical `/<package>.<Service>/<Method>` layout.
    pub fn new(package: &str, service: &str, method: &str) -> Self {
        Path(Arc::from(format!("/{package}.{service}/{method}")))
    }

    /// Wrap an already-canonical path string verbatim.
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Path(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Path {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path(Arc::from(s))
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Path(Arc::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_canonical_path() {
        let p = Path::new("greeter", "Greeter", "SayHello");
        assert_eq!(p.as_str(), "/greeter.Greeter/SayHello");
    }

    #[test]
    fn clone_is_cheap_and_equal() {
        let p = Path::from("/a.B/C");
        let q = p.clone();
        assert_eq!(p, q);
    }
}
