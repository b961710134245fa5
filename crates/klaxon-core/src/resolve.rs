//! Reference resolution
//!
//! Receivers reference key material in external secrets and config
//! sources. Resolution is read-only, scoped to the fragment's own
//! namespace, and reported per reference: one broken reference never
//! aborts resolution of its siblings.

use crate::route::{SourceKind, SourceRef};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The named source or key does not exist. Not retryable; the
    /// dependent field is omitted from the compiled output.
    #[error("{kind} {namespace}/{name} has no key {key:?}")]
    NotFound {
        kind: SourceKind,
        namespace: String,
        name: String,
        key: String,
    },
    /// The source exists but its value is unusable (e.g. not UTF-8).
    /// Treated like a missing reference.
    #[error("{kind} {namespace}/{name} key {key:?}: {reason}")]
    Invalid {
        kind: SourceKind,
        namespace: String,
        name: String,
        key: String,
        reason: String,
    },
    /// The backing store could not be reached. Retryable; fails the
    /// current compile attempt instead of silently dropping fields.
    #[error("transient failure resolving {kind} {namespace}/{name}: {message}")]
    Transient {
        kind: SourceKind,
        namespace: String,
        name: String,
        message: String,
    },
}

impl ResolveError {
    /// True when the reference is definitively unusable and the compiled
    /// output should omit the dependent field.
    pub fn is_omission(&self) -> bool {
        matches!(
            self,
            ResolveError::NotFound { .. } | ResolveError::Invalid { .. }
        )
    }
}

/// Looks up referenced key material. Implementations must scope the
/// lookup to `namespace` and never dereference foreign namespaces.
pub trait ResolveReference {
    fn resolve(
        &self,
        namespace: &str,
        source: &SourceRef,
    ) -> impl Future<Output = Result<String, ResolveError>> + Send;
}

/// In-memory resolver backed by a map, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MapResolver {
    entries: HashMap<(SourceKind, String, String, String), String>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        kind: SourceKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> &mut Self {
        self.entries.insert(
            (kind, namespace.into(), name.into(), key.into()),
            value.into(),
        );
        self
    }

    pub fn insert_secret(&mut self, namespace: &str, name: &str, key: &str, value: &str) -> &mut Self {
        self.insert(SourceKind::Secret, namespace, name, key, value)
    }
}

impl ResolveReference for MapResolver {
    async fn resolve(&self, namespace: &str, source: &SourceRef) -> Result<String, ResolveError> {
        let key = (
            source.kind,
            namespace.to_string(),
            source.name.clone(),
            source.key.clone(),
        );
        self.entries
            .get(&key)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                kind: source.kind,
                namespace: namespace.to_string(),
                name: source.name.clone(),
                key: source.key.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, key: &str) -> SourceRef {
        SourceRef {
            kind: SourceKind::Secret,
            name: name.into(),
            key: key.into(),
        }
    }

    #[tokio::test]
    async fn test_map_resolver_scopes_by_namespace() {
        let mut resolver = MapResolver::new();
        resolver.insert_secret("ns1", "creds", "apiKey", "1234abc");

        let ok = resolver.resolve("ns1", &source("creds", "apiKey")).await;
        assert_eq!(ok.unwrap(), "1234abc");

        // The same source name in a foreign namespace must not resolve.
        let foreign = resolver.resolve("ns2", &source("creds", "apiKey")).await;
        assert!(matches!(foreign, Err(ResolveError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_not_found_names_source_and_key() {
        let resolver = MapResolver::new();
        let err = resolver
            .resolve("ns1", &source("missing", "nope"))
            .await
            .unwrap_err();
        assert!(err.is_omission());
        assert!(err.to_string().contains("missing"));
        assert!(err.to_string().contains("nope"));
    }
}
