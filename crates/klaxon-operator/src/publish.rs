//! Artifact publication
//!
//! Stores the compiled artifact in a Secret named `<notifier>-generated`,
//! with the compressed document under `alertmanager.yaml.gz` and the
//! fragments' pass-through template files alongside, keyed by their
//! original file names. Publication is digest-gated and conflict-aware:
//! a concurrent modification surfaces as [`PublishError::Conflict`] so
//! the caller recomputes from current inputs instead of overwriting
//! blindly.

use crate::crds::Notifier;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use klaxon_core::serialize::Artifact;
use kube::api::{Api, PostParams, Resource, ResourceExt};
use kube::Client;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Key under which the compressed configuration document is stored.
pub const CONFIG_KEY: &str = "alertmanager.yaml.gz";

const DIGEST_ANNOTATION: &str = "klaxon.io/config-digest";
const GENERATED_AT_ANNOTATION: &str = "klaxon.io/generated-at";

#[derive(Debug, Error)]
pub enum PublishError {
    /// The stored artifact changed since it was read. The compile is
    /// recomputed and retried.
    #[error("artifact secret {name} was concurrently modified")]
    Conflict { name: String },
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Build the artifact Secret for a notifier.
fn build_secret(
    notifier: &Notifier,
    artifact: &Artifact,
    templates: &BTreeMap<String, String>,
) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(
        CONFIG_KEY.to_string(),
        ByteString(artifact.compressed.clone()),
    );
    for (file, contents) in templates {
        data.insert(file.clone(), ByteString(contents.clone().into_bytes()));
    }

    let mut secret = Secret::default();
    secret.metadata.name = Some(notifier.generated_secret_name());
    secret.metadata.namespace = notifier.namespace();
    secret.metadata.annotations = Some(
        [
            (DIGEST_ANNOTATION.to_string(), artifact.digest.clone()),
            (
                GENERATED_AT_ANNOTATION.to_string(),
                artifact.generated_at.to_rfc3339(),
            ),
        ]
        .into(),
    );
    secret.metadata.owner_references = notifier.controller_owner_ref(&()).map(|r| vec![r]);
    secret.data = Some(data);
    secret
}

/// Publish the artifact unless the stored copy already carries its
/// digest. Returns whether anything was written.
pub async fn publish_artifact(
    client: &Client,
    notifier: &Notifier,
    artifact: &Artifact,
    templates: &BTreeMap<String, String>,
) -> Result<bool, PublishError> {
    let namespace = notifier.namespace().unwrap_or_default();
    let name = notifier.generated_secret_name();
    let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let existing = api.get_opt(&name).await?;
    let mut secret = build_secret(notifier, artifact, templates);

    match existing {
        Some(current) => {
            let stored_digest = current
                .annotations()
                .get(DIGEST_ANNOTATION)
                .map(String::as_str);
            if stored_digest == Some(artifact.digest.as_str()) {
                debug!(secret = %name, digest = %artifact.digest, "Artifact unchanged");
                return Ok(false);
            }
            // Carry the version token so a concurrent writer loses the
            // race visibly instead of being overwritten.
            secret.metadata.resource_version = current.resource_version();
            match api.replace(&name, &PostParams::default(), &secret).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    Err(PublishError::Conflict { name })
                }
                Err(e) => Err(e.into()),
            }
        }
        None => match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(PublishError::Conflict { name }),
            Err(e) => Err(e.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::notifier::NotifierSpec;
    use chrono::Utc;

    fn artifact() -> Artifact {
        Artifact {
            compressed: vec![0x1f, 0x8b, 0x08, 0x00],
            digest: "abc123".into(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_secret_layout() {
        let spec: NotifierSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        let notifier = Notifier::new("main", spec);
        let templates =
            BTreeMap::from([("template1.tmpl".to_string(), "template1".to_string())]);
        let secret = build_secret(&notifier, &artifact(), &templates);

        assert_eq!(secret.metadata.name.as_deref(), Some("main-generated"));
        let data = secret.data.unwrap();
        assert!(data.contains_key(CONFIG_KEY));
        assert_eq!(
            data.get("template1.tmpl").unwrap().0,
            b"template1".to_vec()
        );
        let annotations = secret.metadata.annotations.unwrap();
        assert_eq!(annotations.get(DIGEST_ANNOTATION).unwrap(), "abc123");
    }
}
