//! Rollout coordination
//!
//! Drives a pool of replica slots with stable ordinal identity through
//! scaling and rolling version/configuration updates, waiting for
//! readiness and cluster-membership convergence before reporting success.

mod coordinator;
mod driver;
mod pool;

pub use coordinator::{
    phase_of, plan, reconcile_pool, PoolDriver, RolloutAction, RolloutBudget, RolloutError,
    RolloutReport, RolloutStep,
};
pub use driver::PodPoolDriver;
pub use pool::{DesiredPool, PoolPhase, ReplicaPool, ReplicaSlot};
