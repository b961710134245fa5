//! Label and namespace predicates
//!
//! Fragment selection is driven by two predicates on the top-level object:
//! a label predicate over the fragments themselves and a namespace
//! predicate over their owning namespaces. The namespace predicate is
//! deliberately tri-state: an *unset* selector disables fragment selection
//! entirely (base policy only), while a *present but empty* selector
//! matches every namespace. Collapsing those two into one "no filter"
//! state would silently change tenant-facing policy.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// A label predicate composed of equality terms and set expressions,
/// mirroring the semantics of Kubernetes label selectors.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelPredicate {
    /// Exact-match terms; all must hold.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based terms; all must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelExpression>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelExpression {
    pub key: String,
    pub operator: LabelOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize, JsonSchema, Display, EnumString)]
pub enum LabelOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelPredicate {
    /// True when the predicate has no terms at all (matches everything).
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (k, v) in &self.match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
        self.match_expressions.iter().all(|expr| {
            let value = labels.get(&expr.key);
            match expr.operator {
                LabelOperator::In => value.is_some_and(|v| expr.values.contains(v)),
                LabelOperator::NotIn => !value.is_some_and(|v| expr.values.contains(v)),
                LabelOperator::Exists => value.is_some(),
                LabelOperator::DoesNotExist => value.is_none(),
            }
        })
    }
}

/// Tri-state namespace admission policy derived from an optional selector.
#[derive(Clone, Debug, PartialEq)]
pub enum NamespacePolicy {
    /// Selector unset: fragment selection is disabled, base policy only.
    Disabled,
    /// Selector present but empty: every namespace is admitted.
    All,
    /// Only namespaces whose labels match are admitted.
    Matching(LabelPredicate),
}

impl NamespacePolicy {
    pub fn from_selector(selector: Option<LabelPredicate>) -> Self {
        match selector {
            None => NamespacePolicy::Disabled,
            Some(p) if p.is_empty() => NamespacePolicy::All,
            Some(p) => NamespacePolicy::Matching(p),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, NamespacePolicy::Disabled)
    }

    pub fn admits(&self, namespace_labels: &BTreeMap<String, String>) -> bool {
        match self {
            NamespacePolicy::Disabled => false,
            NamespacePolicy::All => true,
            NamespacePolicy::Matching(p) => p.matches(namespace_labels),
        }
    }
}

/// Compute the fragments that apply to one top-level object, given the
/// current namespace labels. Re-evaluated on every compile: a namespace
/// label change alone can change membership without any fragment change.
/// Output is ordered by (namespace, name).
pub fn select_fragments(
    fragments: Vec<crate::compile::Fragment>,
    namespace_labels: &BTreeMap<String, BTreeMap<String, String>>,
    namespace_policy: &NamespacePolicy,
    fragment_predicate: Option<&LabelPredicate>,
) -> Vec<crate::compile::Fragment> {
    if namespace_policy.is_disabled() {
        return Vec::new();
    }
    let no_labels = BTreeMap::new();
    let mut selected: Vec<_> = fragments
        .into_iter()
        .filter(|f| {
            let ns_labels = namespace_labels.get(&f.namespace).unwrap_or(&no_labels);
            namespace_policy.admits(ns_labels)
                && fragment_predicate.is_none_or(|p| p.matches(&f.labels))
        })
        .collect();
    selected.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::Fragment;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_match_labels() {
        let p = LabelPredicate {
            match_labels: labels(&[("team", "sre")]),
            ..Default::default()
        };
        assert!(p.matches(&labels(&[("team", "sre"), ("env", "prod")])));
        assert!(!p.matches(&labels(&[("team", "dev")])));
        assert!(!p.matches(&labels(&[])));
    }

    #[test]
    fn test_match_expressions() {
        let p = LabelPredicate {
            match_expressions: vec![
                LabelExpression {
                    key: "env".into(),
                    operator: LabelOperator::In,
                    values: vec!["prod".into(), "staging".into()],
                },
                LabelExpression {
                    key: "legacy".into(),
                    operator: LabelOperator::DoesNotExist,
                    values: vec![],
                },
            ],
            ..Default::default()
        };
        assert!(p.matches(&labels(&[("env", "prod")])));
        assert!(!p.matches(&labels(&[("env", "dev")])));
        assert!(!p.matches(&labels(&[("env", "prod"), ("legacy", "1")])));
    }

    #[test]
    fn test_not_in_matches_absent_key() {
        let p = LabelPredicate {
            match_expressions: vec![LabelExpression {
                key: "tier".into(),
                operator: LabelOperator::NotIn,
                values: vec!["frontend".into()],
            }],
            ..Default::default()
        };
        assert!(p.matches(&labels(&[])));
        assert!(!p.matches(&labels(&[("tier", "frontend")])));
    }

    fn fragment(namespace: &str, name: &str, frag_labels: &[(&str, &str)]) -> Fragment {
        Fragment {
            namespace: namespace.into(),
            name: name.into(),
            labels: labels(frag_labels),
            ..Default::default()
        }
    }

    #[test]
    fn test_selection_reacts_to_namespace_label_removal() {
        let policy = NamespacePolicy::Matching(LabelPredicate {
            match_labels: labels(&[("monitored", "true")]),
            ..Default::default()
        });
        let fragments = vec![fragment("ns1", "routes", &[])];

        let mut ns_labels = BTreeMap::new();
        ns_labels.insert("ns1".to_string(), labels(&[("monitored", "true")]));
        let selected = select_fragments(fragments.clone(), &ns_labels, &policy, None);
        assert_eq!(selected.len(), 1);

        // Removing the selecting label excludes the whole namespace.
        ns_labels.insert("ns1".to_string(), labels(&[]));
        let selected = select_fragments(fragments, &ns_labels, &policy, None);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_disabled_policy_selects_nothing() {
        let fragments = vec![fragment("ns1", "routes", &[])];
        let selected = select_fragments(
            fragments,
            &BTreeMap::new(),
            &NamespacePolicy::Disabled,
            None,
        );
        assert!(selected.is_empty());
    }

    #[test]
    fn test_fragment_predicate_filters_by_fragment_labels() {
        let ns_labels = BTreeMap::from([("ns1".to_string(), labels(&[]))]);
        let predicate = LabelPredicate {
            match_labels: labels(&[("team", "sre")]),
            ..Default::default()
        };
        let fragments = vec![
            fragment("ns1", "a", &[("team", "sre")]),
            fragment("ns1", "b", &[("team", "dev")]),
        ];
        let selected =
            select_fragments(fragments, &ns_labels, &NamespacePolicy::All, Some(&predicate));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "a");
    }

    #[test]
    fn test_selection_is_sorted_by_namespace_then_name() {
        let ns_labels = BTreeMap::from([
            ("ns1".to_string(), labels(&[])),
            ("ns2".to_string(), labels(&[])),
        ]);
        let fragments = vec![
            fragment("ns2", "a", &[]),
            fragment("ns1", "z", &[]),
            fragment("ns1", "a", &[]),
        ];
        let selected = select_fragments(fragments, &ns_labels, &NamespacePolicy::All, None);
        let order: Vec<_> = selected
            .iter()
            .map(|f| format!("{}/{}", f.namespace, f.name))
            .collect();
        assert_eq!(order, vec!["ns1/a", "ns1/z", "ns2/a"]);
    }

    #[test]
    fn test_namespace_policy_tri_state() {
        assert!(NamespacePolicy::from_selector(None).is_disabled());

        let all = NamespacePolicy::from_selector(Some(LabelPredicate::default()));
        assert_eq!(all, NamespacePolicy::All);
        assert!(all.admits(&labels(&[])));

        let matching = NamespacePolicy::from_selector(Some(LabelPredicate {
            match_labels: labels(&[("monitored", "true")]),
            ..Default::default()
        }));
        assert!(matching.admits(&labels(&[("monitored", "true")])));
        assert!(!matching.admits(&labels(&[])));
    }
}
