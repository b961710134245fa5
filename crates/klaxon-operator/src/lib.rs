//! Klaxon Operator Library
//!
//! Kubernetes operator for clustered Klaxon notification pools. Merges
//! namespaced RoutingFragment objects into a single configuration
//! artifact per Notifier and rolls the replica pool to match it.
//!
//! The operator owns **derived state only** - the generated Secret, the
//! replica Pods and the Notifier status. Source objects (fragments,
//! referenced Secrets and ConfigMaps) are never mutated.

pub mod admission;
pub mod controllers;
pub mod crds;
pub mod publish;
pub mod resolver;
pub mod rollout;

pub use crds::{Notifier, NotifierSpec, RoutingFragment, RoutingFragmentSpec};
