//! Qualified names
//!
//! Every receiver and mute-time-interval name emitted into the compiled
//! document is rewritten to `<namespace>/<fragment>/<local>` so that two
//! tenants reusing the same local name can never collide. The single
//! reserved exception is the `"null"` receiver, which intentionally
//! discards everything routed to it.

use std::fmt;

/// Reserved receiver name that discards alerts. Local names cannot shadow
/// it because qualified names always contain `/`.
pub const NULL_RECEIVER: &str = "null";

/// A globally unique name for a fragment-local declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    pub namespace: String,
    pub fragment: String,
    pub local: String,
}

impl QualifiedName {
    pub fn new(
        namespace: impl Into<String>,
        fragment: impl Into<String>,
        local: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            fragment: fragment.into(),
            local: local.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.fragment, self.local)
    }
}
