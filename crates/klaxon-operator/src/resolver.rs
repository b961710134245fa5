//! Cluster-backed reference resolution
//!
//! Resolves fragment secret/config-map references through the API
//! server, scoped to the fragment's own namespace. Lookups carry a
//! bounded timeout and transient failures are retried with exponential
//! backoff; a missing source or key is reported immediately, since only
//! a tenant edit can fix it.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use klaxon_core::resolve::{ResolveError, ResolveReference};
use klaxon_core::route::{SourceKind, SourceRef};
use kube::{Api, Client};
use std::time::Duration;
use tracing::debug;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const LOOKUP_ATTEMPTS: u32 = 3;

/// Delay before retry `attempt` (0-based), capped at 2s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(250);
    std::cmp::min(base * 2u32.saturating_pow(attempt), Duration::from_secs(2))
}

/// Delay before the next attempt, or `None` when `attempt` was the last
/// one and the error should be returned without sleeping.
fn retry_delay(attempt: u32) -> Option<Duration> {
    (attempt + 1 < LOOKUP_ATTEMPTS).then(|| backoff_delay(attempt))
}

#[derive(Clone)]
pub struct KubeResolver {
    client: Client,
}

impl KubeResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn lookup(&self, namespace: &str, source: &SourceRef) -> Result<String, ResolveError> {
        let not_found = || ResolveError::NotFound {
            kind: source.kind,
            namespace: namespace.to_string(),
            name: source.name.clone(),
            key: source.key.clone(),
        };
        let transient = |message: String| ResolveError::Transient {
            kind: source.kind,
            namespace: namespace.to_string(),
            name: source.name.clone(),
            message,
        };

        let fetch = async {
            match source.kind {
                SourceKind::Secret => {
                    let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                    let secret = api.get_opt(&source.name).await?;
                    Ok::<Option<Vec<u8>>, kube::Error>(secret.and_then(|s| {
                        s.data
                            .and_then(|mut d| d.remove(&source.key))
                            .map(|bytes| bytes.0)
                    }))
                }
                SourceKind::ConfigMap => {
                    let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                    let cm = api.get_opt(&source.name).await?;
                    Ok(cm.and_then(|c| {
                        c.data
                            .and_then(|mut d| d.remove(&source.key))
                            .map(String::into_bytes)
                    }))
                }
            }
        };

        let result = tokio::time::timeout(LOOKUP_TIMEOUT, fetch)
            .await
            .map_err(|_| transient("lookup timed out".to_string()))?;

        match result {
            Ok(Some(bytes)) => String::from_utf8(bytes).map_err(|_| ResolveError::Invalid {
                kind: source.kind,
                namespace: namespace.to_string(),
                name: source.name.clone(),
                key: source.key.clone(),
                reason: "value is not valid UTF-8".to_string(),
            }),
            Ok(None) => Err(not_found()),
            Err(e) => Err(transient(e.to_string())),
        }
    }
}

impl ResolveReference for KubeResolver {
    async fn resolve(&self, namespace: &str, source: &SourceRef) -> Result<String, ResolveError> {
        let mut last = None;
        for attempt in 0..LOOKUP_ATTEMPTS {
            match self.lookup(namespace, source).await {
                Ok(value) => return Ok(value),
                Err(e @ ResolveError::Transient { .. }) => {
                    debug!(
                        kind = %source.kind,
                        name = %source.name,
                        attempt,
                        error = %e,
                        "Transient reference lookup failure"
                    );
                    last = Some(e);
                    if let Some(delay) = retry_delay(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| ResolveError::Transient {
            kind: source.kind,
            namespace: namespace.to_string(),
            name: source.name.clone(),
            message: "lookup attempts exhausted".to_string(),
        }))
    }
}
