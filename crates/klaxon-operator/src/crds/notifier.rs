//! Notifier CRD
//!
//! The top-level desired-state object: a clustered notification service
//! with a declared replica count, version, storage and retention, plus
//! the selector predicates that decide which routing fragments feed its
//! compiled configuration.

use klaxon_core::compile::BasePolicy;
use klaxon_core::selector::LabelPredicate;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::rollout::{DesiredPool, PoolPhase};

/// Notifier declares one clustered notification service.
///
/// Any change to a spec field triggers recompilation; changes to
/// `version`, `retention`, `storage` or `tls` additionally trigger a
/// rolling replacement of the replica pool.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "klaxon.io",
    version = "v1alpha1",
    kind = "Notifier",
    namespaced,
    status = "NotifierStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NotifierSpec {
    /// Number of service replicas backing this notifier.
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Service image version to run.
    #[serde(default = "default_version")]
    pub version: String,

    /// Per-replica storage. Omitted means ephemeral storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// How long the service keeps resolved notification state.
    #[serde(default = "default_retention")]
    pub retention: String,

    /// TLS policy for replica-to-replica and client traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,

    /// Label predicate over RoutingFragments. Unset or empty selects all
    /// fragments within admitted namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_selector: Option<LabelPredicate>,

    /// Label predicate over fragment namespaces. Unset disables fragment
    /// selection entirely (base policy only); present-but-empty selects
    /// every namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_namespace_selector: Option<LabelPredicate>,

    /// How long a replaced replica must stay ready before the next
    /// replacement proceeds, giving gossip time to stabilize.
    #[serde(default)]
    pub min_ready_seconds: u32,

    /// Base route grouping labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,

    /// Overrides for the document's `global` section.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global: BTreeMap<String, String>,
}

fn default_replicas() -> u32 {
    1
}

fn default_version() -> String {
    "1.8.0".to_string()
}

fn default_retention() -> String {
    "120h".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Volume size, e.g. "10Gi".
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Secret holding the serving certificate and key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotifierStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PoolPhase>,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    /// Digest applied by all replicas once converged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown".
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// RFC 3339 timestamp of the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Notifier {
    /// Name of the Secret holding the generated configuration artifact.
    pub fn generated_secret_name(&self) -> String {
        format!("{}-generated", self.name_any())
    }

    pub fn base_policy(&self) -> BasePolicy {
        BasePolicy {
            group_by: self.spec.group_by.clone(),
            group_wait: self.spec.group_wait.clone(),
            group_interval: self.spec.group_interval.clone(),
            repeat_interval: self.spec.repeat_interval.clone(),
            global: self
                .spec
                .global
                .iter()
                .map(|(k, v)| (k.clone(), serde_yaml::Value::String(v.clone())))
                .collect(),
        }
    }

    /// Short hash of every replica-template-affecting field. A change in
    /// any of them makes running replicas stale and triggers a rolling
    /// replacement.
    pub fn pool_revision(&self) -> String {
        let template = serde_json::json!({
            "version": self.spec.version,
            "retention": self.spec.retention,
            "storage": self.spec.storage,
            "tls": self.spec.tls,
        });
        let digest = klaxon_core::serialize::digest_hex(template.to_string().as_bytes());
        digest[..12].to_string()
    }

    pub fn desired_pool(&self, digest: &str) -> DesiredPool {
        DesiredPool {
            replicas: self.spec.replicas,
            revision: self.pool_revision(),
            digest: digest.to_string(),
            min_ready: Duration::from_secs(u64::from(self.spec.min_ready_seconds)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(spec: NotifierSpec) -> Notifier {
        Notifier::new("main", spec)
    }

    fn spec_from(json: serde_json::Value) -> NotifierSpec {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_defaults() {
        let spec = spec_from(serde_json::json!({}));
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.retention, "120h");
        assert!(spec.fragment_namespace_selector.is_none());
    }

    #[test]
    fn test_generated_secret_name() {
        let n = notifier(spec_from(serde_json::json!({})));
        assert_eq!(n.generated_secret_name(), "main-generated");
    }

    #[test]
    fn test_retention_change_rolls_the_pool() {
        let a = notifier(spec_from(serde_json::json!({"retention": "120h"})));
        let b = notifier(spec_from(serde_json::json!({"retention": "24h"})));
        assert_ne!(a.pool_revision(), b.pool_revision());
    }

    #[test]
    fn test_replica_change_keeps_revision() {
        let a = notifier(spec_from(serde_json::json!({"replicas": 1})));
        let b = notifier(spec_from(serde_json::json!({"replicas": 3})));
        // Scaling alone must not replace existing replicas.
        assert_eq!(a.pool_revision(), b.pool_revision());
    }
}
