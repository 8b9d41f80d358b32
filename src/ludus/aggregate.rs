// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Folds that turn a batch of outcomes into one answer
//!
//! Every fold treats a failed outcome as a negative vote, so an empty
//! batch is vacuously true and any failure makes the batch false.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::LazyLock;

use super::Outcome;
use crate::ctfd::Flag;

static FLAG_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&%&(.*?)&%&").expect("flag marker pattern is valid")
});

/// Copy of `value` with object keys in sorted order at every depth
pub fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

pub fn canonical_string(value: &Value) -> String {
    canonical(value).to_string()
}

/// AND of `predicate` over successful values; failures count as false
pub fn all_ok<F>(outcomes: &[Outcome], predicate: F) -> bool
where
    F: Fn(&Value) -> bool,
{
    outcomes.iter().all(|o| o.value().is_some_and(&predicate))
}

/// Every outcome succeeded with the same structure as the first
pub fn all_same(outcomes: &[Outcome]) -> bool {
    let Some(first) = outcomes.first().and_then(Outcome::value) else {
        return outcomes.is_empty();
    };
    let reference = canonical_string(first);
    all_ok(outcomes, |v| canonical_string(v) == reference)
}

/// Every outcome succeeded with a value structurally equal to `expected`
pub fn all_match(outcomes: &[Outcome], expected: &Value) -> bool {
    let reference = canonical_string(expected);
    all_ok(outcomes, |v| canonical_string(v) == reference)
}

pub fn range_state(value: &Value) -> Option<&str> {
    value.get("rangeState").and_then(Value::as_str)
}

pub fn all_deployed(outcomes: &[Outcome]) -> bool {
    all_ok(outcomes, |v| range_state(v) == Some("DEPLOYED"))
}

/// A user probe counts as found when it returned something non-empty
pub fn user_exists(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Users whose probe failed or came back empty, sorted
pub fn missing_users(outcomes: &[Outcome]) -> Vec<String> {
    let mut missing: Vec<String> = outcomes
        .iter()
        .filter(|o| !o.value().is_some_and(user_exists))
        .map(|o| o.user_id.clone())
        .collect();
    missing.sort();
    missing
}

/// Compare a stored topology with the config text a range reports.
/// Both sides are read as YAML when possible; otherwise trimmed text must match.
pub fn config_matches(expected: &str, reported: &Value) -> bool {
    let reported = match reported.get("result").unwrap_or(reported) {
        Value::String(text) => text.as_str(),
        _ => return false,
    };
    match (
        serde_yaml::from_str::<Value>(expected),
        serde_yaml::from_str::<Value>(reported),
    ) {
        (Ok(a), Ok(b)) => canonical_string(&a) == canonical_string(&b),
        _ => expected.trim() == reported.trim(),
    }
}

/// One record of who can reach a target user's range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    #[serde(rename = "targetUserID")]
    pub target_user_id: String,
    #[serde(rename = "sourceUserIDs", default)]
    pub source_user_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShareState {
    pub shared: bool,
    pub unshared: bool,
}

/// Shared when the target's grant covers every pool user; unshared when the
/// target has no grant record. Partially shared ranges are neither.
pub fn share_state(grants: &[AccessGrant], target: &str, pool_users: &[String]) -> ShareState {
    match grants.iter().find(|g| g.target_user_id == target) {
        None => ShareState { shared: false, unshared: true },
        Some(grant) => {
            let sources: HashSet<&str> = grant.source_user_ids.iter().map(String::as_str).collect();
            let shared = !pool_users.is_empty() && pool_users.iter().all(|u| sources.contains(u.as_str()));
            ShareState { shared, unshared: false }
        }
    }
}

/// Pull `&%&{...}&%&` out of a log blob. Anything unexpected yields no flags.
pub fn extract_flags(value: &Value) -> Vec<Flag> {
    let Some(log) = value.get("result").and_then(Value::as_str) else {
        return Vec::new();
    };
    let Some(inner) = FLAG_MARKER.captures(log).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    let cleaned = inner.as_str().replace('\\', "");
    match serde_json::from_str::<Map<String, Value>>(&cleaned) {
        Ok(map) => map
            .into_iter()
            .map(|(variable, contents)| Flag { variable, contents })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Flags for one outcome; failures contribute nothing
pub fn outcome_flags(outcome: &Outcome) -> Vec<Flag> {
    outcome.value().map(extract_flags).unwrap_or_default()
}
