//! RoutingFragment CRD
//!
//! A tenant's namespaced unit of routing policy. The spec payload is the
//! core [`FragmentSpec`] model; admission and compilation both run the
//! same validation rules over it.

use klaxon_core::compile::Fragment;
use klaxon_core::route::FragmentSpec;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "klaxon.io",
    version = "v1alpha1",
    kind = "RoutingFragment",
    namespaced,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RoutingFragmentSpec {
    #[serde(flatten)]
    pub policy: FragmentSpec,
}

impl RoutingFragment {
    /// Convert to the compiler's fragment representation. `None` for
    /// objects without a namespace, which cannot occur for a namespaced
    /// resource served by the API server.
    pub fn to_core(&self) -> Option<Fragment> {
        Some(Fragment {
            namespace: self.namespace()?,
            name: self.name_any(),
            labels: self.labels().clone(),
            spec: self.spec.policy.clone(),
        })
    }
}
