//! Fragment-side routing model
//!
//! These are the types tenants write: a route subtree, receivers with
//! notification-channel configs, named mute-time intervals and inhibition
//! rules. Nested routes are kept as raw JSON values so that arbitrarily
//! deep trees survive schema generation; they are parsed into typed
//! [`Route`] nodes by the validator before any fragment is merged.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// A tenant's unit of routing policy, scoped to one namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSpec {
    /// Root of this fragment's route subtree. Grafted as a child of the
    /// cluster's base route during compilation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,

    /// Receivers declared by this fragment, referenced by local name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receivers: Vec<Receiver>,

    /// Named mute-time intervals referenced by routes in this fragment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mute_time_intervals: Vec<MuteTimeInterval>,

    /// Inhibition rules contributed by this fragment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inhibit_rules: Vec<InhibitRule>,

    /// Raw notification template files, keyed by file name. Passed through
    /// to the published artifact unmodified.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub templates: BTreeMap<String, String>,
}

/// One node of the routing tree.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Local receiver name. Required on a fragment's root route; nested
    /// routes may leave it unset to inherit from the parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<Matcher>,

    /// When true, sibling routes keep being evaluated after this one
    /// matches; otherwise first match wins at this level.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub r#continue: bool,

    /// Local names of mute-time intervals declared in the same fragment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mute_time_intervals: Vec<String>,

    /// Child routes, kept raw until validated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,
}

/// A label matcher on a route or inhibition rule.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    pub name: String,
    #[serde(default)]
    pub value: String,
    /// Treat `value` as a regular expression.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub regex: bool,
    /// Structured operator; takes precedence over `regex` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<MatchType>,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize, JsonSchema, Display, EnumString)]
pub enum MatchType {
    #[serde(rename = "=")]
    #[strum(serialize = "=")]
    Equal,
    #[serde(rename = "!=")]
    #[strum(serialize = "!=")]
    NotEqual,
    #[serde(rename = "=~")]
    #[strum(serialize = "=~")]
    Regexp,
    #[serde(rename = "!~")]
    #[strum(serialize = "!~")]
    NotRegexp,
}

impl Matcher {
    /// Exact-match convenience, used for the injected namespace matcher.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            regex: false,
            match_type: Some(MatchType::Equal),
        }
    }

    /// Render in Alertmanager's structured matcher syntax, e.g.
    /// `namespace="ns1"` or `severity=~"critical|warning"`.
    pub fn to_matcher_string(&self) -> String {
        let op = match self.match_type {
            Some(t) => t.to_string(),
            None if self.regex => MatchType::Regexp.to_string(),
            None => MatchType::Equal.to_string(),
        };
        format!("{}{}{:?}", self.name, op, self.value)
    }
}

/// A named receiver with zero or more notification-channel configs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Receiver {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhook_configs: Vec<WebhookConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pagerduty_configs: Vec<PagerDutyConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slack_configs: Vec<SlackConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opsgenie_configs: Vec<OpsGenieConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email_configs: Vec<EmailConfig>,
}

impl Receiver {
    pub fn channel_count(&self) -> usize {
        self.webhook_configs.len()
            + self.pagerduty_configs.len()
            + self.slack_configs.len()
            + self.opsgenie_configs.len()
            + self.email_configs.len()
    }
}

/// Reference to a key in an external secret or config source, scoped to
/// the fragment's own namespace at resolution time.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    #[serde(default)]
    pub kind: SourceKind,
    pub name: String,
    pub key: String,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
    Display,
    EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SourceKind {
    #[default]
    Secret,
    ConfigMap,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_resolved: Option<bool>,
    /// Literal target URL; mutually exclusive with `urlSecret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_secret: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_alerts: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PagerDutyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_resolved: Option<bool>,
    /// Events API v2 integration key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<SourceRef>,
    /// Prometheus integration key (legacy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_key: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_resolved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpsGenieConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_resolved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_resolved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smarthost: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_password: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_tls: Option<bool>,
}

/// A named, reusable time window during which matching routes suppress
/// notification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MuteTimeInterval {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_intervals: Vec<TimeInterval>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<TimeRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekdays: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days_of_month: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub months: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub years: Vec<String>,
}

/// A wall-clock range within a day, `HH:MM` inclusive start to exclusive
/// end.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start_time: String,
    pub end_time: String,
}

/// Suppresses target alerts while a matching source alert fires.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InhibitRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_matchers: Vec<Matcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_matchers: Vec<Matcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equal: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matcher_string_form() {
        let m = Matcher::equal("namespace", "ns1");
        assert_eq!(m.to_matcher_string(), "namespace=\"ns1\"");

        let re = Matcher {
            name: "severity".into(),
            value: "critical|warning".into(),
            regex: true,
            match_type: None,
        };
        assert_eq!(re.to_matcher_string(), "severity=~\"critical|warning\"");
    }

    #[test]
    fn test_route_deserializes_camel_case() {
        let json = r#"{
            "receiver": "e2e",
            "groupBy": ["env", "instance"],
            "muteTimeIntervals": ["test"],
            "continue": true,
            "matchers": [{"name": "job", "value": "db"}]
        }"#;
        let route: Route = serde_json::from_str(json).unwrap();
        assert_eq!(route.receiver.as_deref(), Some("e2e"));
        assert_eq!(route.group_by, vec!["env", "instance"]);
        assert_eq!(route.mute_time_intervals, vec!["test"]);
        assert!(route.r#continue);
    }

    #[test]
    fn test_source_kind_default_is_secret() {
        let r: SourceRef =
            serde_json::from_str(r#"{"name": "am-creds", "key": "apiKey"}"#).unwrap();
        assert_eq!(r.kind, SourceKind::Secret);
    }
}
