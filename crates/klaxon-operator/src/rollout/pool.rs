//! Replica pool model
//!
//! An arena of replica slots with stable numeric identity. Scale-down
//! removes the highest ordinals so the lowest-ordinal members, which the
//! rest of the cluster has gossiped with longest, are preserved.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use strum::Display;

/// Rollout state machine phase, reported on the Notifier status.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Display,
)]
pub enum PoolPhase {
    /// The pool does not exist yet.
    #[default]
    Provisioning,
    /// Replicas are being added, removed or replaced.
    RollingUpdate,
    /// Every replica is ready, on the desired revision and digest, and
    /// membership has stabilized.
    Converged,
    /// The rollout exceeded its time budget; retried later, never forced.
    Degraded,
}

/// What the pool should look like, derived from the Notifier spec and
/// the latest artifact digest.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredPool {
    pub replicas: u32,
    /// Replica template revision; a mismatch makes a slot stale.
    pub revision: String,
    /// Latest artifact digest every replica must apply.
    pub digest: String,
    /// Minimum time a replica must stay ready before the next
    /// replacement may proceed.
    pub min_ready: Duration,
}

/// One running replica as last observed.
#[derive(Clone, Debug, Default)]
pub struct ReplicaSlot {
    pub ordinal: u32,
    pub revision: String,
    pub digest: String,
    pub ready: bool,
    /// When the replica last became ready.
    pub ready_since: Option<DateTime<Utc>>,
    /// Ordinals of the peers this replica currently sees.
    pub peers: BTreeSet<u32>,
}

impl ReplicaSlot {
    pub fn matches(&self, desired: &DesiredPool) -> bool {
        self.revision == desired.revision && self.digest == desired.digest
    }

    /// Ready, and has been for at least `min_ready`.
    pub fn settled(&self, min_ready: Duration, now: DateTime<Utc>) -> bool {
        if !self.ready {
            return false;
        }
        match self.ready_since {
            Some(since) => {
                let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
                elapsed >= min_ready
            }
            None => min_ready.is_zero(),
        }
    }
}

/// The observed set of replica slots backing one Notifier.
#[derive(Clone, Debug, Default)]
pub struct ReplicaPool {
    pub slots: Vec<ReplicaSlot>,
}

impl ReplicaPool {
    pub fn ready_count(&self) -> u32 {
        self.slots.iter().filter(|s| s.ready).count() as u32
    }

    pub fn ordinals(&self) -> BTreeSet<u32> {
        self.slots.iter().map(|s| s.ordinal).collect()
    }

    /// Lowest ordinal in 0..replicas with no slot, if any.
    pub fn missing_ordinal(&self, replicas: u32) -> Option<u32> {
        let present = self.ordinals();
        (0..replicas).find(|o| !present.contains(o))
    }

    /// Every ready replica sees every pool member in its peer set.
    pub fn membership_converged(&self) -> bool {
        let members = self.ordinals();
        self.slots
            .iter()
            .filter(|s| s.ready)
            .all(|s| members.iter().all(|m| s.peers.contains(m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(ordinal: u32, ready: bool, peers: &[u32]) -> ReplicaSlot {
        ReplicaSlot {
            ordinal,
            revision: "rev-a".into(),
            digest: "d1".into(),
            ready,
            ready_since: ready.then(Utc::now),
            peers: peers.iter().copied().collect(),
        }
    }

    #[test]
    fn test_missing_ordinal_is_lowest_gap() {
        let pool = ReplicaPool {
            slots: vec![slot(0, true, &[]), slot(2, true, &[])],
        };
        assert_eq!(pool.missing_ordinal(3), Some(1));
        let full = ReplicaPool {
            slots: vec![slot(0, true, &[]), slot(1, true, &[])],
        };
        assert_eq!(full.missing_ordinal(2), None);
    }

    #[test]
    fn test_membership_convergence_requires_full_peer_view() {
        let converged = ReplicaPool {
            slots: vec![slot(0, true, &[0, 1]), slot(1, true, &[0, 1])],
        };
        assert!(converged.membership_converged());

        let split = ReplicaPool {
            slots: vec![slot(0, true, &[0]), slot(1, true, &[0, 1])],
        };
        assert!(!split.membership_converged());
    }

    #[test]
    fn test_settled_honors_min_ready() {
        let mut s = slot(0, true, &[]);
        s.ready_since = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(s.settled(Duration::from_secs(1), Utc::now()));
        assert!(!s.settled(Duration::from_secs(60), Utc::now()));
    }
}
