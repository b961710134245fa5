//! Rollout planner and driver loop
//!
//! The planner is pure: given the desired pool and the last observation
//! it yields exactly one next step. The driver loop applies steps through
//! a [`PoolDriver`] until convergence or the time budget runs out.
//! Replacement proceeds one replica at a time, highest stale ordinal
//! first, and only while every other replica is ready and settled, so at
//! most one replica is ever disrupted at once.

use super::pool::{DesiredPool, PoolPhase, ReplicaPool};
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RolloutError {
    /// The pool did not converge within the budget. Surfaced as
    /// `Degraded`; the reconcile is retried later and replicas are never
    /// forcibly terminated to unstick it. Carries the last observed
    /// counts so the reported status reflects the pool as it actually is.
    #[error("rollout did not converge within {elapsed:?}")]
    Timeout {
        elapsed: Duration,
        replicas: u32,
        ready_replicas: u32,
    },
    #[error("pool driver error: {0}")]
    Driver(#[from] anyhow::Error),
}

/// A single mutation of the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutAction {
    /// Create the pool at the desired size.
    CreatePool,
    /// Start a replica in an empty slot.
    AddReplica(u32),
    /// Remove the replica with the highest ordinal (scale-down).
    RemoveReplica(u32),
    /// Terminate a stale replica; its slot is re-filled with the desired
    /// template on a later step.
    ReplaceReplica(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutStep {
    Converged,
    /// Nothing safe to do right now; observe again after a delay.
    Wait,
    Apply(RolloutAction),
}

/// Decide the next step for the pool. Invariants: scale-down removes the
/// highest ordinal; a stale replica is only replaced while every replica
/// is ready and has been for the minimum-ready duration.
pub fn plan(
    desired: &DesiredPool,
    pool: Option<&ReplicaPool>,
    now: chrono::DateTime<Utc>,
) -> RolloutStep {
    let Some(pool) = pool else {
        return RolloutStep::Apply(RolloutAction::CreatePool);
    };

    if let Some(extra) = pool
        .ordinals()
        .into_iter()
        .rev()
        .find(|o| *o >= desired.replicas)
    {
        return RolloutStep::Apply(RolloutAction::RemoveReplica(extra));
    }

    // Fill empty slots first; this is also how a replaced replica comes
    // back on its stable ordinal.
    if let Some(missing) = pool.missing_ordinal(desired.replicas) {
        return RolloutStep::Apply(RolloutAction::AddReplica(missing));
    }

    if pool.slots.iter().any(|s| !s.ready) {
        return RolloutStep::Wait;
    }

    let stale = pool
        .slots
        .iter()
        .filter(|s| !s.matches(desired))
        .map(|s| s.ordinal)
        .max();
    if let Some(ordinal) = stale {
        // Disrupting a member is only safe once the cluster has settled
        // around the previous change.
        if pool
            .slots
            .iter()
            .all(|s| s.settled(desired.min_ready, now))
        {
            return RolloutStep::Apply(RolloutAction::ReplaceReplica(ordinal));
        }
        return RolloutStep::Wait;
    }

    if !pool.membership_converged() {
        return RolloutStep::Wait;
    }

    RolloutStep::Converged
}

/// Phase implied by an observation: `Provisioning` before the pool
/// exists, `RollingUpdate` while any mutation or wait is outstanding.
pub fn phase_of(
    desired: &DesiredPool,
    pool: Option<&ReplicaPool>,
    now: chrono::DateTime<Utc>,
) -> PoolPhase {
    match pool {
        None => PoolPhase::Provisioning,
        Some(pool) => match plan(desired, Some(pool), now) {
            RolloutStep::Converged => PoolPhase::Converged,
            _ => PoolPhase::RollingUpdate,
        },
    }
}

/// Applies planner steps to the real world and reports observations back.
pub trait PoolDriver {
    fn observe(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<ReplicaPool>, RolloutError>> + Send;

    fn apply(
        &self,
        namespace: &str,
        name: &str,
        desired: &DesiredPool,
        action: &RolloutAction,
    ) -> impl std::future::Future<Output = Result<(), RolloutError>> + Send;
}

#[derive(Clone, Debug)]
pub struct RolloutBudget {
    /// Overall wall-clock bound for one reconcile's rollout leg.
    pub overall: Duration,
    pub poll_interval: Duration,
}

impl Default for RolloutBudget {
    fn default() -> Self {
        Self {
            overall: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RolloutReport {
    pub phase: PoolPhase,
    pub replicas: u32,
    pub ready_replicas: u32,
}

/// Reconcile the pool until it converges on the desired state, applying
/// at most one mutation per observation.
pub async fn reconcile_pool<D: PoolDriver>(
    driver: &D,
    namespace: &str,
    name: &str,
    desired: &DesiredPool,
    budget: &RolloutBudget,
) -> Result<RolloutReport, RolloutError> {
    let started = tokio::time::Instant::now();
    let mut observed = (0u32, 0u32);

    loop {
        let pool = driver.observe(namespace, name).await?;
        if let Some(pool) = &pool {
            observed = (pool.slots.len() as u32, pool.ready_count());
        }

        match plan(desired, pool.as_ref(), Utc::now()) {
            RolloutStep::Converged => {
                let pool = pool.unwrap_or_default();
                info!(
                    name = %name,
                    replicas = desired.replicas,
                    digest = %desired.digest,
                    "Replica pool converged"
                );
                return Ok(RolloutReport {
                    phase: PoolPhase::Converged,
                    replicas: pool.slots.len() as u32,
                    ready_replicas: pool.ready_count(),
                });
            }
            RolloutStep::Wait => {
                debug!(name = %name, "Waiting for pool to settle");
            }
            RolloutStep::Apply(action) => {
                info!(name = %name, ?action, "Applying rollout step");
                driver.apply(namespace, name, desired, &action).await?;
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= budget.overall {
            warn!(name = %name, ?elapsed, "Rollout timed out before convergence");
            return Err(RolloutError::Timeout {
                elapsed,
                replicas: observed.0,
                ready_replicas: observed.1,
            });
        }
        tokio::time::sleep(budget.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::pool::ReplicaSlot;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    fn desired(replicas: u32, revision: &str, min_ready: Duration) -> DesiredPool {
        DesiredPool {
            replicas,
            revision: revision.into(),
            digest: "d1".into(),
            min_ready,
        }
    }

    fn ready_slot(ordinal: u32, revision: &str, peers: &[u32]) -> ReplicaSlot {
        ReplicaSlot {
            ordinal,
            revision: revision.into(),
            digest: "d1".into(),
            ready: true,
            ready_since: Some(Utc::now() - chrono::Duration::hours(1)),
            peers: peers.iter().copied().collect(),
        }
    }

    fn full_pool(replicas: u32, revision: &str) -> ReplicaPool {
        let members: Vec<u32> = (0..replicas).collect();
        ReplicaPool {
            slots: members
                .iter()
                .map(|o| ready_slot(*o, revision, &members))
                .collect(),
        }
    }

    #[test]
    fn test_plan_creates_missing_pool() {
        assert_eq!(
            plan(&desired(3, "rev-a", Duration::ZERO), None, Utc::now()),
            RolloutStep::Apply(RolloutAction::CreatePool)
        );
    }

    #[test]
    fn test_plan_scales_down_highest_ordinal_first() {
        let pool = full_pool(5, "rev-a");
        let step = plan(&desired(3, "rev-a", Duration::ZERO), Some(&pool), Utc::now());
        assert_eq!(step, RolloutStep::Apply(RolloutAction::RemoveReplica(4)));
    }

    #[test]
    fn test_plan_replaces_highest_stale_ordinal() {
        let mut pool = full_pool(3, "rev-b");
        pool.slots[0].revision = "rev-a".into();
        pool.slots[2].revision = "rev-a".into();
        let step = plan(&desired(3, "rev-b", Duration::ZERO), Some(&pool), Utc::now());
        assert_eq!(step, RolloutStep::Apply(RolloutAction::ReplaceReplica(2)));
    }

    #[test]
    fn test_plan_waits_while_any_replica_unready() {
        let mut pool = full_pool(3, "rev-a");
        pool.slots[1].ready = false;
        pool.slots[2].revision = "rev-old".into();
        let step = plan(&desired(3, "rev-a", Duration::ZERO), Some(&pool), Utc::now());
        assert_eq!(step, RolloutStep::Wait);
    }

    #[test]
    fn test_plan_waits_for_min_ready_before_next_replacement() {
        let mut pool = full_pool(2, "rev-b");
        pool.slots[0].revision = "rev-a".into();
        // Slot 1 just came back; gossip needs time to stabilize on it.
        pool.slots[1].ready_since = Some(Utc::now() - chrono::Duration::seconds(1));
        let step = plan(
            &desired(2, "rev-b", Duration::from_secs(120)),
            Some(&pool),
            Utc::now(),
        );
        assert_eq!(step, RolloutStep::Wait);
    }

    #[test]
    fn test_plan_waits_for_membership_convergence() {
        let mut pool = full_pool(2, "rev-a");
        pool.slots[0].peers = BTreeSet::from([0]);
        let step = plan(&desired(2, "rev-a", Duration::ZERO), Some(&pool), Utc::now());
        assert_eq!(step, RolloutStep::Wait);
    }

    #[test]
    fn test_phase_is_provisioning_before_pool_exists() {
        let phase = phase_of(&desired(3, "rev-a", Duration::ZERO), None, Utc::now());
        assert_eq!(phase, PoolPhase::Provisioning);
    }

    #[test]
    fn test_phase_is_rolling_update_while_stale() {
        let pool = full_pool(3, "rev-a");
        let phase = phase_of(&desired(3, "rev-b", Duration::ZERO), Some(&pool), Utc::now());
        assert_eq!(phase, PoolPhase::RollingUpdate);

        let converged = phase_of(&desired(3, "rev-a", Duration::ZERO), Some(&pool), Utc::now());
        assert_eq!(converged, PoolPhase::Converged);
    }

    #[test]
    fn test_plan_converges_on_matching_settled_pool() {
        let pool = full_pool(3, "rev-a");
        let step = plan(&desired(3, "rev-a", Duration::ZERO), Some(&pool), Utc::now());
        assert_eq!(step, RolloutStep::Converged);
    }

    /// Simulated driver: applied mutations take effect on the next
    /// observation, and a started replica needs one further observation
    /// to become ready. Tracks the worst-case number of simultaneously
    /// unready replicas.
    struct SimDriver {
        state: Mutex<SimState>,
    }

    #[derive(Default)]
    struct SimState {
        pool: Option<ReplicaPool>,
        replaced: Vec<u32>,
        max_unready: u32,
    }

    impl SimDriver {
        fn new(pool: Option<ReplicaPool>) -> Self {
            Self {
                state: Mutex::new(SimState {
                    pool,
                    ..Default::default()
                }),
            }
        }
    }

    impl PoolDriver for SimDriver {
        async fn observe(&self, _ns: &str, _name: &str) -> Result<Option<ReplicaPool>, RolloutError> {
            let mut state = self.state.lock().unwrap();
            let snapshot = state.pool.clone();
            if let Some(pool) = &mut state.pool {
                let members = pool.ordinals();
                let unready = pool.slots.iter().filter(|s| !s.ready).count() as u32;
                // Unready replicas become ready for the next observation.
                for slot in &mut pool.slots {
                    if !slot.ready {
                        slot.ready = true;
                        slot.ready_since = Some(Utc::now() - chrono::Duration::hours(1));
                    }
                    slot.peers = members.clone();
                }
                state.max_unready = state.max_unready.max(unready);
            }
            Ok(snapshot)
        }

        async fn apply(
            &self,
            _ns: &str,
            _name: &str,
            desired: &DesiredPool,
            action: &RolloutAction,
        ) -> Result<(), RolloutError> {
            let mut state = self.state.lock().unwrap();
            let new_slot = |ordinal: u32| ReplicaSlot {
                ordinal,
                revision: desired.revision.clone(),
                digest: desired.digest.clone(),
                ready: false,
                ready_since: None,
                peers: BTreeSet::new(),
            };
            match action {
                RolloutAction::CreatePool => {
                    state.pool = Some(ReplicaPool {
                        slots: (0..desired.replicas).map(new_slot).collect(),
                    });
                }
                RolloutAction::AddReplica(ordinal) => {
                    state.pool.as_mut().unwrap().slots.push(new_slot(*ordinal));
                }
                RolloutAction::RemoveReplica(ordinal) => {
                    let pool = state.pool.as_mut().unwrap();
                    pool.slots.retain(|s| s.ordinal != *ordinal);
                }
                RolloutAction::ReplaceReplica(ordinal) => {
                    let pool = state.pool.as_mut().unwrap();
                    pool.slots.retain(|s| s.ordinal != *ordinal);
                    state.replaced.push(*ordinal);
                }
            }
            Ok(())
        }
    }

    fn fast_budget() -> RolloutBudget {
        RolloutBudget {
            overall: Duration::from_secs(300),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_converges() {
        let driver = SimDriver::new(None);
        let report = reconcile_pool(
            &driver,
            "ns",
            "main",
            &desired(3, "rev-a", Duration::ZERO),
            &fast_budget(),
        )
        .await
        .unwrap();
        assert_eq!(report.phase, PoolPhase::Converged);
        assert_eq!(report.replicas, 3);
        assert_eq!(report.ready_replicas, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_update_replaces_one_at_a_time() {
        let driver = SimDriver::new(Some(full_pool(3, "rev-a")));
        let report = reconcile_pool(
            &driver,
            "ns",
            "main",
            &desired(3, "rev-b", Duration::ZERO),
            &fast_budget(),
        )
        .await
        .unwrap();
        assert_eq!(report.phase, PoolPhase::Converged);

        let state = driver.state.lock().unwrap();
        // Highest ordinal first, each on its stable identity.
        assert_eq!(state.replaced, vec![2, 1, 0]);
        assert!(state.max_unready <= 1);
        let pool = state.pool.as_ref().unwrap();
        assert!(pool.slots.iter().all(|s| s.revision == "rev-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_preserves_lowest_ordinals() {
        let driver = SimDriver::new(Some(full_pool(5, "rev-a")));
        reconcile_pool(
            &driver,
            "ns",
            "main",
            &desired(3, "rev-a", Duration::ZERO),
            &fast_budget(),
        )
        .await
        .unwrap();
        let state = driver.state.lock().unwrap();
        let ordinals = state.pool.as_ref().unwrap().ordinals();
        assert_eq!(ordinals, BTreeSet::from([0, 1, 2]));
    }

    /// A driver whose replicas never become ready.
    struct StuckDriver;

    impl PoolDriver for StuckDriver {
        async fn observe(&self, _ns: &str, _name: &str) -> Result<Option<ReplicaPool>, RolloutError> {
            Ok(Some(ReplicaPool {
                slots: vec![ReplicaSlot {
                    ordinal: 0,
                    revision: "rev-a".into(),
                    digest: "d1".into(),
                    ready: false,
                    ..Default::default()
                }],
            }))
        }

        async fn apply(
            &self,
            _ns: &str,
            _name: &str,
            _desired: &DesiredPool,
            _action: &RolloutAction,
        ) -> Result<(), RolloutError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_rollout_times_out() {
        let budget = RolloutBudget {
            overall: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        };
        let err = reconcile_pool(
            &StuckDriver,
            "ns",
            "main",
            &desired(1, "rev-a", Duration::ZERO),
            &budget,
        )
        .await
        .unwrap_err();
        // The timeout reports the pool as last seen, not the spec.
        match err {
            RolloutError::Timeout {
                replicas,
                ready_replicas,
                ..
            } => {
                assert_eq!(replicas, 1);
                assert_eq!(ready_replicas, 0);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
