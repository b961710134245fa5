//! Shared controller context

use crate::rollout::RolloutBudget;
use kube::Client;

/// Shared context for the Notifier controller.
pub struct Context {
    pub client: Client,
    pub rollout_budget: RolloutBudget,
}

impl Context {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            rollout_budget: RolloutBudget::default(),
        }
    }
}
