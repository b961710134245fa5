//! Kubernetes controllers
//!
//! The Notifier reconciler: compiles fragments into an artifact,
//! publishes it, and drives the replica pool to convergence.

mod context;
mod notifier;

pub use context::Context;
pub use notifier::NotifierController;
