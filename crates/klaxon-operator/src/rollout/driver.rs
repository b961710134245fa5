//! Pod-backed pool driver
//!
//! Materializes replica slots as Pods named `<notifier>-<ordinal>`, each
//! mounting the generated configuration Secret and (optionally) a
//! per-ordinal PersistentVolumeClaim. Readiness comes from the pod's
//! Ready condition; the observed peer set comes from an annotation the
//! replica's membership agent maintains.

use super::coordinator::{PoolDriver, RolloutAction, RolloutError};
use super::pool::{DesiredPool, ReplicaPool, ReplicaSlot};
use crate::crds::Notifier;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, Pod, PodSpec, SecretVolumeSource, Volume, VolumeMount,
};
use kube::api::{Api, DeleteParams, ListParams, PostParams, Resource};
use kube::Client;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

const NOTIFIER_LABEL: &str = "klaxon.io/notifier";
const ORDINAL_LABEL: &str = "klaxon.io/ordinal";
const REVISION_LABEL: &str = "klaxon.io/revision";
const DIGEST_ANNOTATION: &str = "klaxon.io/config-digest";
/// Comma-separated ordinals the replica currently gossips with, written
/// by the in-pod membership agent. Absent means no agent is deployed, in
/// which case membership is assumed converged rather than wedging the
/// rollout forever.
const PEERS_ANNOTATION: &str = "klaxon.io/peers";

const CONFIG_MOUNT: &str = "/etc/klaxon/config";
const STORAGE_MOUNT: &str = "/var/lib/klaxon";

pub struct PodPoolDriver {
    client: Client,
    notifier: Arc<Notifier>,
}

impl PodPoolDriver {
    pub fn new(client: Client, notifier: Arc<Notifier>) -> Self {
        Self { client, notifier }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pod_name(name: &str, ordinal: u32) -> String {
        format!("{name}-{ordinal}")
    }

    fn build_pod(&self, name: &str, ordinal: u32, desired: &DesiredPool) -> Pod {
        let spec = &self.notifier.spec;
        let mut pod = Pod::default();
        pod.metadata.name = Some(Self::pod_name(name, ordinal));
        pod.metadata.labels = Some(
            [
                (NOTIFIER_LABEL.to_string(), name.to_string()),
                (ORDINAL_LABEL.to_string(), ordinal.to_string()),
                (REVISION_LABEL.to_string(), desired.revision.clone()),
            ]
            .into(),
        );
        pod.metadata.annotations = Some(
            [(DIGEST_ANNOTATION.to_string(), desired.digest.clone())].into(),
        );
        pod.metadata.owner_references = self
            .notifier
            .controller_owner_ref(&())
            .map(|r| vec![r]);

        let mut args = vec![
            format!("--config.file={CONFIG_MOUNT}/alertmanager.yaml.gz"),
            format!("--storage.path={STORAGE_MOUNT}"),
            format!("--data.retention={}", spec.retention),
        ];
        for peer in 0..desired.replicas {
            if peer != ordinal {
                args.push(format!("--cluster.peer={}", Self::pod_name(name, peer)));
            }
        }
        if spec.tls.as_ref().is_some_and(|t| t.enabled) {
            args.push("--web.tls=true".to_string());
        }

        let mut volumes = vec![Volume {
            name: "config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.notifier.generated_secret_name()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut mounts = vec![VolumeMount {
            name: "config".to_string(),
            mount_path: CONFIG_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];
        if spec.storage.is_some() {
            volumes.push(Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(
                    k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                        claim_name: format!("{name}-db-{ordinal}"),
                        ..Default::default()
                    },
                ),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "data".to_string(),
                mount_path: STORAGE_MOUNT.to_string(),
                ..Default::default()
            });
        }

        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "klaxon".to_string(),
                image: Some(format!("quay.io/klaxon/klaxon:{}", spec.version)),
                args: Some(args),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        });
        pod
    }

    async fn ensure_claim(&self, namespace: &str, name: &str, ordinal: u32) -> anyhow::Result<()> {
        let Some(storage) = &self.notifier.spec.storage else {
            return Ok(());
        };
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let claim_name = format!("{name}-db-{ordinal}");
        if claims.get_opt(&claim_name).await?.is_some() {
            return Ok(());
        }

        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some(claim_name.clone());
        claim.metadata.labels = Some([(NOTIFIER_LABEL.to_string(), name.to_string())].into());
        claim.spec = Some(k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                requests: Some(
                    [(
                        "storage".to_string(),
                        k8s_openapi::apimachinery::pkg::api::resource::Quantity(
                            storage.size.clone(),
                        ),
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        });
        claims
            .create(&PostParams::default(), &claim)
            .await
            .with_context(|| format!("creating claim {claim_name}"))?;
        Ok(())
    }

    async fn start_replica(
        &self,
        namespace: &str,
        name: &str,
        ordinal: u32,
        desired: &DesiredPool,
    ) -> Result<(), RolloutError> {
        self.ensure_claim(namespace, name, ordinal)
            .await
            .map_err(RolloutError::Driver)?;
        let pod = self.build_pod(name, ordinal, desired);
        self.pods(namespace)
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| RolloutError::Driver(anyhow::Error::new(e).context("creating pod")))?;
        debug!(name = %name, ordinal, "Started replica");
        Ok(())
    }

    async fn stop_replica(
        &self,
        namespace: &str,
        name: &str,
        ordinal: u32,
    ) -> Result<(), RolloutError> {
        // Graceful deletion only: a stuck rollout is reported, never
        // unstuck by force.
        self.pods(namespace)
            .delete(&Self::pod_name(name, ordinal), &DeleteParams::default())
            .await
            .map_err(|e| RolloutError::Driver(anyhow::Error::new(e).context("deleting pod")))?;
        debug!(name = %name, ordinal, "Stopped replica");
        Ok(())
    }

    fn slot_from_pod(pod: &Pod) -> Option<ReplicaSlot> {
        let labels = pod.metadata.labels.as_ref()?;
        let ordinal: u32 = labels.get(ORDINAL_LABEL)?.parse().ok()?;
        let revision = labels.get(REVISION_LABEL).cloned().unwrap_or_default();
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let digest = annotations.get(DIGEST_ANNOTATION).cloned().unwrap_or_default();

        let terminating = pod.metadata.deletion_timestamp.is_some();
        let ready_condition = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"));
        let ready = !terminating && ready_condition.is_some_and(|c| c.status == "True");
        let ready_since: Option<DateTime<Utc>> = ready_condition
            .and_then(|c| c.last_transition_time.as_ref())
            .map(|t| t.0);

        let peers: Option<BTreeSet<u32>> = annotations.get(PEERS_ANNOTATION).map(|raw| {
            raw.split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect()
        });

        Some(ReplicaSlot {
            ordinal,
            revision,
            digest,
            ready,
            ready_since: ready.then_some(ready_since).flatten(),
            // No membership agent means no peer evidence either way;
            // assume the replica sees itself and let readiness gate.
            peers: peers.unwrap_or_else(|| BTreeSet::from([ordinal])),
        })
    }
}

impl PoolDriver for PodPoolDriver {
    async fn observe(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaPool>, RolloutError> {
        let params = ListParams::default().labels(&format!("{NOTIFIER_LABEL}={name}"));
        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .map_err(|e| RolloutError::Driver(anyhow::Error::new(e).context("listing pods")))?;
        if pods.items.is_empty() {
            return Ok(None);
        }
        let mut slots: Vec<ReplicaSlot> = pods
            .items
            .iter()
            .filter_map(Self::slot_from_pod)
            .collect();
        slots.sort_by_key(|s| s.ordinal);
        Ok(Some(ReplicaPool { slots }))
    }

    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        desired: &DesiredPool,
        action: &RolloutAction,
    ) -> Result<(), RolloutError> {
        match action {
            RolloutAction::CreatePool => {
                for ordinal in 0..desired.replicas {
                    self.start_replica(namespace, name, ordinal, desired).await?;
                }
                Ok(())
            }
            RolloutAction::AddReplica(ordinal) => {
                self.start_replica(namespace, name, *ordinal, desired).await
            }
            RolloutAction::RemoveReplica(ordinal) | RolloutAction::ReplaceReplica(ordinal) => {
                self.stop_replica(namespace, name, *ordinal).await
            }
        }
    }
}
