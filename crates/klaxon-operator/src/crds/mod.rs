//! Custom Resource Definitions
//!
//! Kubernetes CRDs for the klaxon notification cluster: the `Notifier`
//! top-level object declaring a replica cluster and its base policy, and
//! the `RoutingFragment` tenant-supplied routing policy unit.

pub mod fragment;
pub mod notifier;

pub use fragment::{RoutingFragment, RoutingFragmentSpec};
pub use notifier::{Notifier, NotifierSpec, NotifierStatus, StatusCondition};
