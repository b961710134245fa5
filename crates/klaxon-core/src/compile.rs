//! Route tree compiler
//!
//! Merges N selected fragments plus the cluster's base policy into one
//! global route tree, receiver list and mute-time-interval list.
//! Fragments are processed in (namespace, name) order; every local name
//! is rewritten to its qualified form; each fragment's root route is
//! grafted under the base route with an injected namespace matcher and
//! `continue: true`; and a synthesized dead-man's-switch route bound to
//! the reserved `"null"` receiver is appended last so no alert is ever
//! unrouted.
//!
//! Invalid fragments are quarantined, never fatal: one tenant's broken
//! policy must not stop another tenant's valid policy from being served.

use crate::compiled::{
    CompiledConfiguration, CompiledEmailConfig, CompiledInhibitRule, CompiledMuteTimeInterval,
    CompiledOpsGenieConfig, CompiledPagerDutyConfig, CompiledReceiver, CompiledRoute,
    CompiledSlackConfig, CompiledTimeInterval, CompiledTimeRange, CompiledWebhookConfig,
};
use crate::name::{QualifiedName, NULL_RECEIVER};
use crate::resolve::{ResolveError, ResolveReference};
use crate::route::{FragmentSpec, Matcher, Receiver, Route, SourceRef};
use crate::validate::{parse_nested_routes, validate_fragment, ValidationError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Directory inside the replica container where pass-through template
/// files are mounted.
pub const TEMPLATES_DIR: &str = "/etc/klaxon/config";

/// A fragment together with its cluster identity and labels.
#[derive(Clone, Debug, Default)]
pub struct Fragment {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub spec: FragmentSpec,
}

impl Fragment {
    fn qualified(&self, local: &str) -> QualifiedName {
        QualifiedName::new(&self.namespace, &self.name, local)
    }
}

/// Base routing policy carried by the top-level object itself.
#[derive(Clone, Debug, Default)]
pub struct BasePolicy {
    pub group_by: Vec<String>,
    pub group_wait: Option<String>,
    pub group_interval: Option<String>,
    pub repeat_interval: Option<String>,
    /// Overrides merged over the default `resolve_timeout: 5m`.
    pub global: BTreeMap<String, serde_yaml::Value>,
}

/// A fragment excluded from the merge, with the reason recorded for the
/// tenant-facing status condition.
#[derive(Debug)]
pub struct RejectedFragment {
    pub namespace: String,
    pub name: String,
    pub error: ValidationError,
}

/// A reference that failed resolution; the dependent field or channel was
/// omitted from the compiled receiver.
#[derive(Debug)]
pub struct OmittedReference {
    pub receiver: String,
    pub detail: String,
}

/// Result of one compile: the configuration plus everything that was left
/// out and why.
#[derive(Debug)]
pub struct CompileOutcome {
    pub configuration: CompiledConfiguration,
    pub rejected: Vec<RejectedFragment>,
    pub omitted: Vec<OmittedReference>,
}

#[derive(Debug, Error)]
pub enum CompileError {
    /// A reference lookup failed transiently. The whole attempt is
    /// retried rather than publishing a config with silently missing
    /// fields that may exist.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Compile the base policy plus the selected fragments into one
/// configuration. Deterministic: the same inputs always produce an equal
/// [`CompiledConfiguration`].
pub async fn compile<R: ResolveReference>(
    base: &BasePolicy,
    fragments: &[Fragment],
    resolver: &R,
) -> Result<CompileOutcome, CompileError> {
    let mut ordered: Vec<&Fragment> = fragments.iter().collect();
    ordered.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

    let mut rejected = Vec::new();
    let mut omitted = Vec::new();
    let mut routes = Vec::new();
    let mut receivers = vec![CompiledReceiver::named(NULL_RECEIVER)];
    let mut mute_time_intervals = Vec::new();
    let mut inhibit_rules = Vec::new();
    let mut templates = Vec::new();

    for fragment in ordered {
        if let Err(error) = validate_fragment(&fragment.spec) {
            rejected.push(RejectedFragment {
                namespace: fragment.namespace.clone(),
                name: fragment.name.clone(),
                error,
            });
            continue;
        }

        // Resolve receivers first: routes referencing a receiver whose
        // channels all failed to resolve are rewritten to "null" so the
        // emitted tree never dangles.
        let mut kept = BTreeSet::new();
        let mut fragment_receivers = Vec::new();
        for receiver in &fragment.spec.receivers {
            let qualified = fragment.qualified(&receiver.name).to_string();
            if let Some(compiled) =
                resolve_receiver(fragment, &qualified, receiver, resolver, &mut omitted).await?
            {
                kept.insert(receiver.name.clone());
                fragment_receivers.push(compiled);
            }
        }

        if let Some(root) = &fragment.spec.route {
            // validate_fragment has already parsed the nested tree, so
            // this cannot fail; the error path still quarantines instead
            // of assuming.
            let mut compiled_root = match compile_route(fragment, root, &kept) {
                Ok(r) => r,
                Err(error) => {
                    rejected.push(RejectedFragment {
                        namespace: fragment.namespace.clone(),
                        name: fragment.name.clone(),
                        error,
                    });
                    continue;
                }
            };
            compiled_root
                .matchers
                .push(Matcher::equal("namespace", &fragment.namespace).to_matcher_string());
            compiled_root.r#continue = true;
            routes.push(compiled_root);
        }

        receivers.extend(fragment_receivers);

        for interval in &fragment.spec.mute_time_intervals {
            mute_time_intervals.push(CompiledMuteTimeInterval {
                name: fragment.qualified(&interval.name).to_string(),
                time_intervals: interval
                    .time_intervals
                    .iter()
                    .map(|ti| CompiledTimeInterval {
                        times: ti
                            .times
                            .iter()
                            .map(|t| CompiledTimeRange {
                                start_time: t.start_time.clone(),
                                end_time: t.end_time.clone(),
                            })
                            .collect(),
                        weekdays: ti.weekdays.clone(),
                        days_of_month: ti.days_of_month.clone(),
                        months: ti.months.clone(),
                        years: ti.years.clone(),
                    })
                    .collect(),
            });
        }

        for rule in &fragment.spec.inhibit_rules {
            let scoped = |matchers: &[Matcher]| {
                let mut out: Vec<String> =
                    matchers.iter().map(Matcher::to_matcher_string).collect();
                out.push(Matcher::equal("namespace", &fragment.namespace).to_matcher_string());
                out
            };
            inhibit_rules.push(CompiledInhibitRule {
                source_matchers: scoped(&rule.source_matchers),
                target_matchers: scoped(&rule.target_matchers),
                equal: rule.equal.clone(),
            });
        }

        for file in fragment.spec.templates.keys() {
            templates.push(format!("{TEMPLATES_DIR}/{file}"));
        }
    }

    // Dead man's switch: a catch-all bound to the discarding receiver.
    routes.push(CompiledRoute {
        receiver: NULL_RECEIVER.into(),
        r#match: BTreeMap::from([("alertname".to_string(), "DeadMansSwitch".to_string())]),
        ..Default::default()
    });

    let mut global = BTreeMap::from([(
        "resolve_timeout".to_string(),
        serde_yaml::Value::String("5m".to_string()),
    )]);
    global.extend(base.global.clone());

    let configuration = CompiledConfiguration {
        global,
        route: CompiledRoute {
            receiver: NULL_RECEIVER.into(),
            group_by: base.group_by.clone(),
            routes,
            group_wait: base.group_wait.clone(),
            group_interval: base.group_interval.clone(),
            repeat_interval: base.repeat_interval.clone(),
            ..Default::default()
        },
        receivers,
        mute_time_intervals,
        inhibit_rules,
        templates,
    };

    Ok(CompileOutcome {
        configuration,
        rejected,
        omitted,
    })
}

/// Rewrite one route (and its children) into qualified form.
fn compile_route(
    fragment: &Fragment,
    route: &Route,
    kept: &BTreeSet<String>,
) -> Result<CompiledRoute, ValidationError> {
    let receiver = match &route.receiver {
        Some(local) if kept.contains(local) => fragment.qualified(local).to_string(),
        // Declared but skipped after resolution; discard instead of
        // emitting a dangling reference.
        Some(_) => NULL_RECEIVER.to_string(),
        None => String::new(),
    };

    let mut r#match = BTreeMap::new();
    let mut match_re = BTreeMap::new();
    let mut matchers = Vec::new();
    for m in &route.matchers {
        if m.match_type.is_some() {
            matchers.push(m.to_matcher_string());
        } else if m.regex {
            match_re.insert(m.name.clone(), m.value.clone());
        } else {
            r#match.insert(m.name.clone(), m.value.clone());
        }
    }

    let children = parse_nested_routes(&route.routes)?
        .iter()
        .map(|child| compile_route(fragment, child, kept))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledRoute {
        receiver,
        group_by: route.group_by.clone(),
        r#match,
        match_re,
        matchers,
        r#continue: route.r#continue,
        mute_time_intervals: route
            .mute_time_intervals
            .iter()
            .map(|name| fragment.qualified(name).to_string())
            .collect(),
        routes: children,
        group_wait: route.group_wait.clone(),
        group_interval: route.group_interval.clone(),
        repeat_interval: route.repeat_interval.clone(),
    })
}

/// Resolve one receiver's channel configs. Returns `None` when the
/// receiver declared channels but none survived resolution.
async fn resolve_receiver<R: ResolveReference>(
    fragment: &Fragment,
    qualified: &str,
    receiver: &Receiver,
    resolver: &R,
    omitted: &mut Vec<OmittedReference>,
) -> Result<Option<CompiledReceiver>, CompileError> {
    let mut compiled = CompiledReceiver::named(qualified);

    for wh in &receiver.webhook_configs {
        let url = match &wh.url {
            Some(url) => Some(url.clone()),
            None => match &wh.url_secret {
                Some(source) => {
                    resolve_field(fragment, qualified, source, resolver, omitted).await?
                }
                None => None,
            },
        };
        // A webhook without a target cannot function; drop the channel.
        if let Some(url) = url {
            compiled.webhook_configs.push(CompiledWebhookConfig {
                send_resolved: wh.send_resolved,
                url,
                max_alerts: wh.max_alerts,
            });
        }
    }

    for pd in &receiver.pagerduty_configs {
        let routing_key = match &pd.routing_key {
            Some(source) => resolve_field(fragment, qualified, source, resolver, omitted).await?,
            None => None,
        };
        let service_key = match &pd.service_key {
            Some(source) => resolve_field(fragment, qualified, source, resolver, omitted).await?,
            None => None,
        };
        if routing_key.is_some() || service_key.is_some() {
            compiled.pagerduty_configs.push(CompiledPagerDutyConfig {
                send_resolved: pd.send_resolved,
                routing_key,
                service_key,
                url: pd.url.clone(),
                severity: pd.severity.clone(),
            });
        }
    }

    for sl in &receiver.slack_configs {
        let api_url = match &sl.api_url {
            Some(source) => resolve_field(fragment, qualified, source, resolver, omitted).await?,
            None => None,
        };
        if let Some(api_url) = api_url {
            compiled.slack_configs.push(CompiledSlackConfig {
                send_resolved: sl.send_resolved,
                api_url,
                channel: sl.channel.clone(),
                title: sl.title.clone(),
                text: sl.text.clone(),
            });
        }
    }

    for og in &receiver.opsgenie_configs {
        let api_key = match &og.api_key {
            Some(source) => resolve_field(fragment, qualified, source, resolver, omitted).await?,
            None => None,
        };
        if let Some(api_key) = api_key {
            compiled.opsgenie_configs.push(CompiledOpsGenieConfig {
                send_resolved: og.send_resolved,
                api_key,
                api_url: og.api_url.clone(),
                message: og.message.clone(),
            });
        }
    }

    for em in &receiver.email_configs {
        let Some(to) = em.to.clone() else { continue };
        // Auth material is optional: a missing key omits the field but
        // keeps the channel.
        let auth_password = match &em.auth_password {
            Some(source) => resolve_field(fragment, qualified, source, resolver, omitted).await?,
            None => None,
        };
        let auth_secret = match &em.auth_secret {
            Some(source) => resolve_field(fragment, qualified, source, resolver, omitted).await?,
            None => None,
        };
        compiled.email_configs.push(CompiledEmailConfig {
            send_resolved: em.send_resolved,
            to,
            from: em.from.clone(),
            smarthost: em.smarthost.clone(),
            auth_username: em.auth_username.clone(),
            auth_password,
            auth_secret,
            require_tls: em.require_tls,
        });
    }

    if receiver.channel_count() > 0 && compiled.channel_count() == 0 {
        return Ok(None);
    }
    Ok(Some(compiled))
}

/// Resolve a single reference. Missing material becomes `None` (field
/// omitted) and is recorded; transient failures abort the attempt.
async fn resolve_field<R: ResolveReference>(
    fragment: &Fragment,
    receiver: &str,
    source: &SourceRef,
    resolver: &R,
    omitted: &mut Vec<OmittedReference>,
) -> Result<Option<String>, CompileError> {
    match resolver.resolve(&fragment.namespace, source).await {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_omission() => {
            omitted.push(OmittedReference {
                receiver: receiver.to_string(),
                detail: e.to_string(),
            });
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
