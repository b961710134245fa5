//! Notifier controller
//!
//! One level-triggered reconcile loop per Notifier: select fragments,
//! compile, serialize, publish, roll out. Any change to the Notifier, a
//! RoutingFragment, a Secret/ConfigMap or a Namespace's labels enqueues
//! the owning Notifiers; the controller runtime coalesces triggers and
//! serializes processing per key while different Notifiers reconcile in
//! parallel.

use super::Context;
use crate::crds::{Notifier, NotifierStatus, RoutingFragment, StatusCondition};
use crate::publish::{publish_artifact, PublishError};
use crate::resolver::KubeResolver;
use crate::rollout::{phase_of, reconcile_pool, PodPoolDriver, PoolDriver, PoolPhase, RolloutError};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use klaxon_core::compile::{compile, CompileError, Fragment};
use klaxon_core::selector::{select_fragments, NamespacePolicy};
use klaxon_core::serialize::{serialize, SerializeError};
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{Action, Controller},
        reflector::{ObjectRef, Store},
        watcher::Config,
    },
    Client, ResourceExt,
};
use std::collections::BTreeMap;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("serialize error: {0}")]
    Serialize(#[from] SerializeError),
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),
    #[error("rollout error: {0}")]
    Rollout(#[from] RolloutError),
}

pub struct NotifierController;

impl NotifierController {
    pub async fn run(client: Client, ctx: Arc<Context>) {
        let notifiers: Api<Notifier> = Api::all(client.clone());
        let controller = Controller::new(notifiers, Config::default());
        let store = controller.store();

        controller
            .owns(Api::<Pod>::all(client.clone()), Config::default())
            .watches(
                Api::<RoutingFragment>::all(client.clone()),
                Config::default(),
                fan_out(store.clone()),
            )
            .watches(
                Api::<Secret>::all(client.clone()),
                Config::default(),
                fan_out_secrets(store.clone()),
            )
            .watches(
                Api::<ConfigMap>::all(client.clone()),
                Config::default(),
                fan_out(store.clone()),
            )
            .watches(
                Api::<Namespace>::all(client.clone()),
                Config::default(),
                fan_out(store),
            )
            .run(
                |notifier, ctx| async move { reconcile(notifier, ctx).await },
                error_policy,
                ctx,
            )
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => info!(name = %obj.name, "Reconciled Notifier"),
                    Err(e) => error!(error = %e, "Reconcile error"),
                }
            })
            .await;
    }
}

/// Selection membership cannot be derived from the changed object alone
/// (a namespace label change alone can change it), so any relevant event
/// re-enqueues every Notifier.
fn fan_out<K>(store: Store<Notifier>) -> impl Fn(K) -> Vec<ObjectRef<Notifier>> {
    move |_| {
        store
            .state()
            .iter()
            .map(|n| ObjectRef::from_obj(n.as_ref()))
            .collect()
    }
}

/// True for Secrets this operator writes itself (the generated artifact),
/// whose watch events must not feed back into the trigger queue.
fn is_own_artifact(secret: &Secret) -> bool {
    secret
        .owner_references()
        .iter()
        .any(|r| r.kind == "Notifier" && r.api_version.starts_with("klaxon.io/"))
}

fn fan_out_secrets(store: Store<Notifier>) -> impl Fn(Secret) -> Vec<ObjectRef<Notifier>> {
    let all = fan_out(store);
    move |secret| {
        if is_own_artifact(&secret) {
            return Vec::new();
        }
        all(secret)
    }
}

#[instrument(skip(notifier, ctx), fields(name = %notifier.name_any(), namespace = ?notifier.namespace()))]
async fn reconcile(notifier: Arc<Notifier>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let client = ctx.client.clone();
    let namespace = notifier.namespace().unwrap_or_default();
    let name = notifier.name_any();

    let fragments = selected_fragments(&client, &notifier).await?;
    debug!(count = fragments.len(), "Selected routing fragments");

    let resolver = KubeResolver::new(client.clone());
    let outcome = compile(&notifier.base_policy(), &fragments, &resolver).await?;
    for rejected in &outcome.rejected {
        warn!(
            fragment = %format!("{}/{}", rejected.namespace, rejected.name),
            error = %rejected.error,
            "Excluding invalid fragment from merge"
        );
    }
    for omitted in &outcome.omitted {
        debug!(receiver = %omitted.receiver, detail = %omitted.detail, "Omitted unresolved reference");
    }

    let artifact = serialize(&outcome.configuration)?;

    let mut templates = BTreeMap::new();
    for fragment in &fragments {
        templates.extend(fragment.spec.templates.clone());
    }
    if publish_artifact(&client, &notifier, &artifact, &templates).await? {
        info!(digest = %artifact.digest, "Published new configuration artifact");
    }

    let desired = notifier.desired_pool(&artifact.digest);
    let driver = PodPoolDriver::new(client.clone(), notifier.clone());

    // Surface Provisioning/RollingUpdate on the status before the
    // convergence wait, so observers see the rollout in flight.
    let observed = driver.observe(&namespace, &name).await?;
    let initial_phase = phase_of(&desired, observed.as_ref(), Utc::now());
    if initial_phase != PoolPhase::Converged {
        let (replicas, ready) = observed
            .as_ref()
            .map(|p| (p.slots.len() as u32, p.ready_count()))
            .unwrap_or((0, 0));
        write_status(
            &client,
            &notifier,
            &outcome.rejected,
            initial_phase,
            replicas,
            ready,
            &artifact.digest,
        )
        .await?;
    }

    let (phase, replicas, ready_replicas) =
        match reconcile_pool(&driver, &namespace, &name, &desired, &ctx.rollout_budget).await {
            Ok(report) => (report.phase, report.replicas, report.ready_replicas),
            Err(RolloutError::Timeout {
                elapsed,
                replicas,
                ready_replicas,
            }) => {
                warn!(?elapsed, "Rollout exceeded budget, reporting Degraded");
                (PoolPhase::Degraded, replicas, ready_replicas)
            }
            Err(e) => return Err(e.into()),
        };

    write_status(
        &client,
        &notifier,
        &outcome.rejected,
        phase,
        replicas,
        ready_replicas,
        &artifact.digest,
    )
    .await?;

    let requeue = match phase {
        // Retry the stuck rollout sooner than the steady-state resync.
        PoolPhase::Degraded => Duration::from_secs(60),
        _ => Duration::from_secs(300),
    };
    Ok(Action::requeue(requeue))
}

/// Fragments applying to this Notifier under its selector predicates,
/// re-evaluated from live namespace labels on every call.
async fn selected_fragments(
    client: &Client,
    notifier: &Notifier,
) -> Result<Vec<Fragment>, ReconcileError> {
    let policy =
        NamespacePolicy::from_selector(notifier.spec.fragment_namespace_selector.clone());
    if policy.is_disabled() {
        return Ok(Vec::new());
    }

    let fragment_api: Api<RoutingFragment> = Api::all(client.clone());
    let fragments: Vec<Fragment> = fragment_api
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .filter_map(RoutingFragment::to_core)
        .collect();

    let namespace_api: Api<Namespace> = Api::all(client.clone());
    let namespace_labels: BTreeMap<String, BTreeMap<String, String>> = namespace_api
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .map(|ns| (ns.name_any(), ns.labels().clone()))
        .collect();

    Ok(select_fragments(
        fragments,
        &namespace_labels,
        &policy,
        notifier.spec.fragment_selector.as_ref(),
    ))
}

/// Compute the next status. Condition transition times are carried over
/// from `prior` while the condition's status stays the same, so an
/// unchanged status round-trips equal to the stored one and no patch is
/// issued for it.
fn next_status(
    prior: Option<&NotifierStatus>,
    rejected: &[klaxon_core::compile::RejectedFragment],
    phase: PoolPhase,
    replicas: u32,
    ready_replicas: u32,
    digest: &str,
    now: chrono::DateTime<Utc>,
) -> NotifierStatus {
    let transition_time = |type_: &str, status: &str, message: &str| {
        prior
            .and_then(|p| {
                p.conditions
                    .iter()
                    .find(|c| c.type_ == type_ && c.message == message)
            })
            .filter(|c| c.status == status)
            .and_then(|c| c.last_transition_time.clone())
            .unwrap_or_else(|| now.to_rfc3339())
    };

    let converged = if phase == PoolPhase::Converged {
        "True"
    } else {
        "False"
    };
    let mut conditions = vec![StatusCondition {
        type_: "Converged".to_string(),
        status: converged.to_string(),
        reason: phase.to_string(),
        message: String::new(),
        last_transition_time: Some(transition_time("Converged", converged, "")),
    }];
    for r in rejected {
        let message = format!("{}/{}: {}", r.namespace, r.name, r.error);
        let last_transition_time = Some(transition_time("FragmentExcluded", "True", &message));
        conditions.push(StatusCondition {
            type_: "FragmentExcluded".to_string(),
            status: "True".to_string(),
            reason: "ValidationFailed".to_string(),
            message,
            last_transition_time,
        });
    }

    NotifierStatus {
        phase: Some(phase),
        replicas,
        ready_replicas,
        applied_digest: (phase == PoolPhase::Converged).then(|| digest.to_string()),
        conditions,
    }
}

async fn write_status(
    client: &Client,
    notifier: &Notifier,
    rejected: &[klaxon_core::compile::RejectedFragment],
    phase: PoolPhase,
    replicas: u32,
    ready_replicas: u32,
    digest: &str,
) -> Result<(), kube::Error> {
    let status = next_status(
        notifier.status.as_ref(),
        rejected,
        phase,
        replicas,
        ready_replicas,
        digest,
        Utc::now(),
    );
    // An identical status would only bump resourceVersion and re-trigger
    // this controller through its own watch.
    if notifier.status.as_ref() == Some(&status) {
        return Ok(());
    }

    let namespace = notifier.namespace().unwrap_or_default();
    let api: Api<Notifier> = Api::namespaced(client.clone(), &namespace);
    api.patch_status(
        &notifier.name_any(),
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

fn error_policy(_notifier: Arc<Notifier>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    let delay = match error {
        // A concurrent artifact write means inputs moved under us;
        // recompute promptly.
        ReconcileError::Publish(PublishError::Conflict { .. }) => Duration::from_secs(1),
        // Transient store/resolve failures back off a little.
        ReconcileError::Kube(_) | ReconcileError::Compile(_) => Duration::from_secs(30),
        _ => Duration::from_secs(60),
    };
    error!(error = %error, ?delay, "Reconcile failed");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::notifier::NotifierSpec;

    fn notifier(json: serde_json::Value) -> Notifier {
        let spec: NotifierSpec = serde_json::from_value(json).unwrap();
        Notifier::new("main", spec)
    }

    #[test]
    fn test_unset_namespace_selector_disables_selection() {
        let n = notifier(serde_json::json!({}));
        let policy =
            NamespacePolicy::from_selector(n.spec.fragment_namespace_selector.clone());
        assert!(policy.is_disabled());
    }

    #[test]
    fn test_empty_namespace_selector_selects_everything() {
        let n = notifier(serde_json::json!({"fragmentNamespaceSelector": {}}));
        let policy =
            NamespacePolicy::from_selector(n.spec.fragment_namespace_selector.clone());
        assert_eq!(policy, NamespacePolicy::All);
    }

    fn test_context() -> Arc<Context> {
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());
        Arc::new(Context::new(Client::try_from(config).unwrap()))
    }

    #[test]
    fn test_unchanged_status_round_trips_equal() {
        let t0 = Utc::now();
        let first = next_status(None, &[], PoolPhase::Converged, 3, 3, "d1", t0);

        // A later reconcile with identical inputs must reproduce the
        // stored status byte for byte, or every reconcile would bump
        // resourceVersion and re-trigger itself.
        let later = t0 + chrono::Duration::minutes(5);
        let second = next_status(Some(&first), &[], PoolPhase::Converged, 3, 3, "d1", later);
        assert_eq!(first, second);
        assert_eq!(
            second.conditions[0].last_transition_time,
            Some(t0.to_rfc3339())
        );
    }

    #[test]
    fn test_phase_flip_moves_transition_time() {
        let t0 = Utc::now();
        let first = next_status(None, &[], PoolPhase::Converged, 3, 3, "d1", t0);

        let t1 = t0 + chrono::Duration::minutes(5);
        let degraded = next_status(Some(&first), &[], PoolPhase::Degraded, 3, 1, "d1", t1);
        assert_ne!(first, degraded);
        assert_eq!(degraded.conditions[0].status, "False");
        assert_eq!(
            degraded.conditions[0].last_transition_time,
            Some(t1.to_rfc3339())
        );
        assert!(degraded.applied_digest.is_none());
    }

    #[test]
    fn test_own_artifact_secret_is_not_a_trigger() {
        let mut secret = Secret::default();
        secret.metadata.name = Some("main-generated".into());
        assert!(!is_own_artifact(&secret));

        secret.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "klaxon.io/v1alpha1".into(),
                kind: "Notifier".into(),
                name: "main".into(),
                controller: Some(true),
                ..Default::default()
            },
        ]);
        assert!(is_own_artifact(&secret));
    }

    #[tokio::test]
    async fn test_conflict_retries_promptly() {
        let err = ReconcileError::Publish(PublishError::Conflict {
            name: "main-generated".into(),
        });
        let action = error_policy(Arc::new(notifier(serde_json::json!({}))), &err, test_context());
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }
}
