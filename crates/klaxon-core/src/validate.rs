//! Fragment validation
//!
//! The same rule set runs at two points: admission (the tenant's write is
//! refused outright) and compile time (the offending fragment is excluded
//! from the merge while every other fragment proceeds). Reference
//! *existence* is deliberately not checked here; a secret key that does
//! not exist yet is a resolver-time concern.

use crate::route::{FragmentSpec, Matcher, Receiver, Route, SourceRef, TimeRange};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("root route must declare a receiver")]
    MissingRootReceiver,
    #[error("nested route is not an object: {got}")]
    InvalidNestedRoute { got: String },
    #[error("route references undeclared receiver {name:?}")]
    UnknownReceiver { name: String },
    #[error("route references undeclared mute time interval {name:?}")]
    UnknownMuteTimeInterval { name: String },
    #[error("duplicate receiver {name:?}")]
    DuplicateReceiver { name: String },
    #[error("duplicate mute time interval {name:?}")]
    DuplicateMuteTimeInterval { name: String },
    #[error("receiver {receiver:?}: {reason}")]
    InvalidChannelConfig { receiver: String, reason: String },
    #[error("matcher has empty label name")]
    EmptyMatcherName,
    #[error("invalid time range {value:?}, expected HH:MM")]
    InvalidTimeRange { value: String },
}

/// Validate a fragment against every admission-time rule.
pub fn validate_fragment(spec: &FragmentSpec) -> Result<(), ValidationError> {
    let receivers = declared_names(spec.receivers.iter().map(|r| r.name.as_str()), |name| {
        ValidationError::DuplicateReceiver { name }
    })?;
    let intervals = declared_names(
        spec.mute_time_intervals.iter().map(|m| m.name.as_str()),
        |name| ValidationError::DuplicateMuteTimeInterval { name },
    )?;

    if let Some(route) = &spec.route {
        if route.receiver.is_none() {
            return Err(ValidationError::MissingRootReceiver);
        }
        validate_route(route, &receivers, &intervals)?;
    }

    for receiver in &spec.receivers {
        validate_receiver(receiver)?;
    }

    for interval in &spec.mute_time_intervals {
        for ti in &interval.time_intervals {
            for range in &ti.times {
                validate_time_range(range)?;
            }
        }
    }

    for rule in &spec.inhibit_rules {
        for m in rule.source_matchers.iter().chain(&rule.target_matchers) {
            validate_matcher(m)?;
        }
    }

    Ok(())
}

/// Parse raw nested route values into typed nodes. A bare scalar (or any
/// non-object) is a hard error, never silently coerced.
pub fn parse_nested_routes(raw: &[serde_json::Value]) -> Result<Vec<Route>, ValidationError> {
    raw.iter()
        .map(|value| {
            if !value.is_object() {
                return Err(ValidationError::InvalidNestedRoute {
                    got: value.to_string(),
                });
            }
            serde_json::from_value(value.clone()).map_err(|e| {
                ValidationError::InvalidNestedRoute { got: e.to_string() }
            })
        })
        .collect()
}

fn validate_route(
    route: &Route,
    receivers: &BTreeSet<String>,
    intervals: &BTreeSet<String>,
) -> Result<(), ValidationError> {
    if let Some(name) = &route.receiver {
        if !receivers.contains(name) {
            return Err(ValidationError::UnknownReceiver { name: name.clone() });
        }
    }
    for name in &route.mute_time_intervals {
        if !intervals.contains(name) {
            return Err(ValidationError::UnknownMuteTimeInterval { name: name.clone() });
        }
    }
    for m in &route.matchers {
        validate_matcher(m)?;
    }
    for child in parse_nested_routes(&route.routes)? {
        validate_route(&child, receivers, intervals)?;
    }
    Ok(())
}

fn validate_receiver(receiver: &Receiver) -> Result<(), ValidationError> {
    let fail = |reason: String| ValidationError::InvalidChannelConfig {
        receiver: receiver.name.clone(),
        reason,
    };
    let check_ref = |what: &str, source: &SourceRef| {
        if source.name.is_empty() || source.key.is_empty() {
            Err(fail(format!("{what} reference must name a source and key")))
        } else {
            Ok(())
        }
    };

    for wh in &receiver.webhook_configs {
        if wh.url.is_none() && wh.url_secret.is_none() {
            return Err(fail("webhook config needs url or urlSecret".into()));
        }
        if let Some(s) = &wh.url_secret {
            check_ref("urlSecret", s)?;
        }
    }
    for pd in &receiver.pagerduty_configs {
        if pd.routing_key.is_none() && pd.service_key.is_none() {
            return Err(fail(
                "pagerduty config needs routingKey or serviceKey".into(),
            ));
        }
        if let Some(s) = &pd.routing_key {
            check_ref("routingKey", s)?;
        }
        if let Some(s) = &pd.service_key {
            check_ref("serviceKey", s)?;
        }
    }
    for sl in &receiver.slack_configs {
        match &sl.api_url {
            None => return Err(fail("slack config needs apiUrl".into())),
            Some(s) => check_ref("apiUrl", s)?,
        }
    }
    for og in &receiver.opsgenie_configs {
        match &og.api_key {
            None => return Err(fail("opsgenie config needs apiKey".into())),
            Some(s) => check_ref("apiKey", s)?,
        }
    }
    for em in &receiver.email_configs {
        if em.to.is_none() {
            return Err(fail("email config needs to".into()));
        }
        if let Some(s) = &em.auth_password {
            check_ref("authPassword", s)?;
        }
        if let Some(s) = &em.auth_secret {
            check_ref("authSecret", s)?;
        }
    }
    Ok(())
}

fn validate_matcher(matcher: &Matcher) -> Result<(), ValidationError> {
    if matcher.name.is_empty() {
        return Err(ValidationError::EmptyMatcherName);
    }
    Ok(())
}

fn validate_time_range(range: &TimeRange) -> Result<(), ValidationError> {
    for value in [&range.start_time, &range.end_time] {
        // Hour 24 is only legal as the exclusive end-of-day mark 24:00.
        let ok = matches!(value.split(':').collect::<Vec<_>>().as_slice(), [h, m]
            if h.len() == 2 && m.len() == 2
            && matches!(
                (h.parse::<u8>(), m.parse::<u8>()),
                (Ok(h), Ok(m)) if (h < 24 && m < 60) || (h == 24 && m == 0)
            ));
        if !ok {
            return Err(ValidationError::InvalidTimeRange {
                value: value.clone(),
            });
        }
    }
    Ok(())
}

fn declared_names<'a>(
    names: impl Iterator<Item = &'a str>,
    dup: impl Fn(String) -> ValidationError,
) -> Result<BTreeSet<String>, ValidationError> {
    let mut set = BTreeSet::new();
    for name in names {
        if !set.insert(name.to_string()) {
            return Err(dup(name.to_string()));
        }
    }
    Ok(set)
}
