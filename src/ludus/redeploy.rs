// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Redeploy: read every range state, then destroy or deploy as each state demands

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::aggregate::range_state;
use super::{deploy_body, dispatch, DispatchRequest, Executor, LudusUrls, Method, Outcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeState {
    Error,
    Aborted,
    Destroying,
    Destroyed,
    Deployed,
    Other(String),
}

impl RangeState {
    pub fn parse(state: &str) -> Self {
        match state {
            "ERROR" => RangeState::Error,
            "ABORTED" => RangeState::Aborted,
            "DESTROYING" => RangeState::Destroying,
            "DESTROYED" => RangeState::Destroyed,
            "DEPLOYED" => RangeState::Deployed,
            other => RangeState::Other(other.to_string()),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        range_state(value).map(Self::parse).unwrap_or_else(|| RangeState::Other("unknown".to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            RangeState::Error => "ERROR",
            RangeState::Aborted => "ABORTED",
            RangeState::Destroying => "DESTROYING",
            RangeState::Destroyed => "DESTROYED",
            RangeState::Deployed => "DEPLOYED",
            RangeState::Other(s) => s,
        }
    }
}

/// What redeploy does for one range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeployAction {
    /// Range was broken; a destroy was issued and the caller should redeploy later
    Destroyed,
    /// Range is still being torn down; nothing issued
    Waiting,
    /// Range was gone; a fresh deploy was issued
    Redeployed,
    /// Nothing to do for this state
    Skipped(RangeState),
}

impl RedeployAction {
    pub fn for_state(state: &RangeState) -> Self {
        match state {
            RangeState::Error | RangeState::Aborted => RedeployAction::Destroyed,
            RangeState::Destroying => RedeployAction::Waiting,
            RangeState::Destroyed => RedeployAction::Redeployed,
            other => RedeployAction::Skipped(other.clone()),
        }
    }

    /// Upstream call this action needs, if any
    pub fn follow_up(&self, urls: &LudusUrls, user_id: &str) -> Option<DispatchRequest> {
        match self {
            RedeployAction::Destroyed => Some(DispatchRequest::new(Method::Delete, urls.range(user_id), user_id)),
            RedeployAction::Redeployed => Some(
                DispatchRequest::new(Method::Post, urls.range_deploy(user_id), user_id).with_json(deploy_body()),
            ),
            RedeployAction::Waiting | RedeployAction::Skipped(_) => None,
        }
    }

    pub fn to_json(&self, user_id: &str) -> Value {
        match self {
            RedeployAction::Destroyed => {
                json!({ "userId": user_id, "action": "destroyed", "message": "Wait and redeploy" })
            }
            RedeployAction::Waiting => {
                json!({ "userId": user_id, "action": "waiting", "message": "Wait until destroyed" })
            }
            RedeployAction::Redeployed => json!({ "userId": user_id, "action": "redeployed" }),
            RedeployAction::Skipped(state) => {
                json!({ "userId": user_id, "action": "skipped", "state": state.as_str() })
            }
        }
    }
}

/// Decision for one user from its check-phase outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Act(RedeployAction),
    CheckFailed(String),
}

pub fn plan(outcome: &Outcome) -> Plan {
    match &outcome.result {
        Ok(value) => Plan::Act(RedeployAction::for_state(&RangeState::from_value(value))),
        Err(e) => Plan::CheckFailed(e.to_string()),
    }
}

/// Check every range, then issue the follow-up calls. The act phase only
/// starts once the whole check phase has returned.
pub async fn redeploy(
    executor: Arc<dyn Executor>,
    urls: &LudusUrls,
    user_ids: &[String],
    api_key: &str,
    limit: usize,
) -> Vec<Value> {
    let checks = user_ids
        .iter()
        .map(|id| DispatchRequest::new(Method::Get, urls.range(id), id.as_str()))
        .collect();
    let checked = dispatch(executor.clone(), checks, api_key, limit).await;

    let plans: Vec<(String, Plan)> = checked.iter().map(|o| (o.user_id.clone(), plan(o))).collect();
    let follow_ups: Vec<DispatchRequest> = plans
        .iter()
        .filter_map(|(user, p)| match p {
            Plan::Act(action) => action.follow_up(urls, user),
            Plan::CheckFailed(_) => None,
        })
        .collect();
    info!("Redeploy: {} ranges checked, {} follow-up calls", plans.len(), follow_ups.len());

    let acted: HashMap<String, Outcome> = dispatch(executor, follow_ups, api_key, limit)
        .await
        .into_iter()
        .map(|o| (o.user_id.clone(), o))
        .collect();

    plans
        .into_iter()
        .map(|(user, p)| match p {
            Plan::CheckFailed(error) => json!({ "userId": user, "error": error }),
            Plan::Act(action) => {
                let mut entry = action.to_json(&user);
                if let Some(Err(e)) = acted.get(&user).map(|o| &o.result) {
                    entry["error"] = Value::String(e.to_string());
                }
                entry
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ludus::{DispatchError, UpstreamReply};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Reports a fixed range state per user and records every call
    struct Ranges {
        states: HashMap<String, &'static str>,
        calls: Mutex<Vec<(Method, String)>>,
    }

    impl Ranges {
        fn new(states: &[(&str, &'static str)]) -> Self {
            Self {
                states: states.iter().map(|(u, s)| (u.to_string(), *s)).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_for(&self, method: Method) -> Vec<String> {
            let mut users: Vec<String> = self
                .calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| *m == method)
                .map(|(_, u)| u.clone())
                .collect();
            users.sort();
            users
        }
    }

    #[async_trait]
    impl Executor for Ranges {
        async fn execute(&self, request: &DispatchRequest, _api_key: &str) -> Result<UpstreamReply, DispatchError> {
            self.calls.lock().unwrap().push((request.method, request.user_id.clone()));
            match request.method {
                Method::Get => match self.states.get(&request.user_id) {
                    Some(state) => Ok(UpstreamReply::ok(json!({ "rangeState": state }))),
                    None => Err(DispatchError::Transport("no route to host".into())),
                },
                Method::Post if request.user_id == "flaky" => Ok(UpstreamReply {
                    status: 500,
                    body: json!({"error": "deploy failed"}),
                }),
                _ => Ok(UpstreamReply::ok(json!({"result": "ok"}))),
            }
        }
    }

    #[test]
    fn state_to_action() {
        assert_eq!(RedeployAction::for_state(&RangeState::parse("DESTROYED")), RedeployAction::Redeployed);
        assert_eq!(RedeployAction::for_state(&RangeState::parse("ERROR")), RedeployAction::Destroyed);
        assert_eq!(RedeployAction::for_state(&RangeState::parse("ABORTED")), RedeployAction::Destroyed);
        assert_eq!(RedeployAction::for_state(&RangeState::parse("DESTROYING")), RedeployAction::Waiting);
        assert_eq!(
            RedeployAction::for_state(&RangeState::parse("PAUSED")),
            RedeployAction::Skipped(RangeState::Other("PAUSED".into()))
        );
        assert_eq!(
            RangeState::from_value(&json!({"name": "x"})),
            RangeState::Other("unknown".into())
        );
    }

    #[test]
    fn action_reports() {
        assert_eq!(
            RedeployAction::Destroyed.to_json("u1"),
            json!({"userId": "u1", "action": "destroyed", "message": "Wait and redeploy"})
        );
        assert_eq!(
            RedeployAction::Skipped(RangeState::Deployed).to_json("u1"),
            json!({"userId": "u1", "action": "skipped", "state": "DEPLOYED"})
        );
    }

    #[test]
    fn waiting_issues_nothing() {
        let urls = LudusUrls::new("https://l:8080", "https://l:8081");
        assert!(RedeployAction::Waiting.follow_up(&urls, "u1").is_none());
        assert!(RedeployAction::Skipped(RangeState::Deployed).follow_up(&urls, "u1").is_none());
        let deploy = RedeployAction::Redeployed.follow_up(&urls, "u1").unwrap();
        assert_eq!(deploy.method, Method::Post);
        assert_eq!(deploy.url, "https://l:8080/range/deploy/?userID=u1");
    }

    #[tokio::test]
    async fn runs_check_then_act() {
        let ranges = Arc::new(Ranges::new(&[
            ("broken", "ERROR"),
            ("gone", "DESTROYED"),
            ("busy", "DESTROYING"),
            ("fine", "DEPLOYED"),
            ("flaky", "DESTROYED"),
        ]));
        let urls = LudusUrls::new("https://l:8080", "https://l:8081");
        let users: Vec<String> = ["broken", "gone", "busy", "fine", "flaky", "lost"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let results = redeploy(ranges.clone(), &urls, &users, "k.s", 2).await;
        let by_user: HashMap<String, Value> = results
            .into_iter()
            .map(|r| (r["userId"].as_str().unwrap().to_string(), r))
            .collect();

        assert_eq!(by_user["broken"]["action"], "destroyed");
        assert_eq!(by_user["gone"]["action"], "redeployed");
        assert_eq!(by_user["busy"]["action"], "waiting");
        assert_eq!(by_user["fine"]["action"], "skipped");
        assert_eq!(by_user["fine"]["state"], "DEPLOYED");
        assert_eq!(by_user["flaky"]["action"], "redeployed");
        assert_eq!(by_user["flaky"]["error"], "upstream returned 500: deploy failed");
        assert!(by_user["lost"]["error"].is_string());

        assert_eq!(ranges.calls_for(Method::Delete), vec!["broken"]);
        assert_eq!(ranges.calls_for(Method::Post), vec!["flaky", "gone"]);
        assert_eq!(ranges.calls_for(Method::Get).len(), 6);
    }
}
