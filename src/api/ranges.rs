// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Range lifecycle, range config and range access for every user of a pool

use actix_web::{web, HttpRequest, HttpResponse};
use base64::Engine;
use serde_json::{json, Value};
use std::io::Write;
use tracing::{info, warn};

use super::{require_api_key, results, ApiError, ApiKey, ApiResult, AppState, PoolQuery};
use crate::ludus::aggregate::{all_deployed, all_ok, config_matches, range_state, share_state, AccessGrant};
use crate::ludus::redeploy::redeploy as run_redeploy;
use crate::ludus::{deploy_body, DispatchRequest, Method};
use crate::pools::UserIdMode;

/// Pool users for the scope in the query
fn scoped_users(state: &AppState, query: &PoolQuery, mode: UserIdMode) -> ApiResult<Vec<String>> {
    Ok(state.pools.resolve_user_ids(query.pool_id()?, mode)?)
}

/// Same call for every scoped user, answered as `{results}`
async fn per_user<F>(state: &AppState, key: &ApiKey, user_ids: &[String], build: F) -> HttpResponse
where
    F: Fn(&str) -> DispatchRequest,
{
    let requests = user_ids.iter().map(|id| build(id.as_str())).collect();
    let outcomes = state.fan_out(requests, key).await;
    HttpResponse::Ok().json(results(&outcomes))
}

/// POST /ludus/range/deploy
pub async fn deploy(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let users = scoped_users(&state, &query, query.mode()?)?;
    info!("Deploying {} ranges for pool {:?}", users.len(), query.pool_id);
    Ok(per_user(&state, &key, &users, |id| {
        DispatchRequest::new(Method::Post, state.urls.range_deploy(id), id).with_json(deploy_body())
    })
    .await)
}

/// POST /ludus/range/abort
pub async fn abort(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let users = scoped_users(&state, &query, query.mode()?)?;
    Ok(per_user(&state, &key, &users, |id| DispatchRequest::new(Method::Post, state.urls.range_abort(id), id)).await)
}

/// DELETE /ludus/range
pub async fn remove(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let users = scoped_users(&state, &query, query.mode()?)?;
    info!("Removing {} ranges for pool {:?}", users.len(), query.pool_id);
    Ok(per_user(&state, &key, &users, |id| DispatchRequest::new(Method::Delete, state.urls.range(id), id)).await)
}

/// GET /ludus/range/status
pub async fn status(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let users = scoped_users(&state, &query, query.mode()?)?;

    let requests = users
        .iter()
        .map(|id| DispatchRequest::new(Method::Get, state.urls.range(id), id.as_str()))
        .collect();
    let outcomes = state.fan_out(requests, &key).await;

    let entries: Vec<Value> = outcomes
        .iter()
        .map(|o| match &o.result {
            Ok(value) => json!({ "userId": o.user_id, "state": range_state(value).unwrap_or("unknown") }),
            Err(e) => json!({ "userId": o.user_id, "error": e.to_string() }),
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "results": entries,
        "allDeployed": all_deployed(&outcomes),
    })))
}

/// POST /ludus/range/redeploy
pub async fn redeploy(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let users = scoped_users(&state, &query, query.mode()?)?;
    let entries = run_redeploy(
        state.executor.clone(),
        &state.urls,
        &users,
        &key.raw,
        state.config.max_concurrent_requests,
    )
    .await;
    Ok(HttpResponse::Ok().json(json!({ "results": entries })))
}

// ─── Range config ───

/// Topology file text of the pool plus the main-user ids it applies to
fn pool_topology(state: &AppState, pool_id: &str) -> ApiResult<(Vec<u8>, Vec<String>)> {
    let pool = state.pools.get(pool_id)?;
    let file = state.topologies.first_file(&pool.topology_id)?;
    Ok((file.content, pool.user_ids(UserIdMode::MainUserOnly)))
}

/// GET /ludus/range/config
pub async fn get_config(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let (topology, users) = pool_topology(&state, query.pool_id()?)?;
    let expected = String::from_utf8_lossy(&topology).to_string();

    let requests = users
        .iter()
        .map(|id| DispatchRequest::new(Method::Get, state.urls.range_config(id), id.as_str()))
        .collect();
    let outcomes = state.fan_out(requests, &key).await;

    Ok(HttpResponse::Ok().json(json!({
        "matchPoolTopology": all_ok(&outcomes, |reported| config_matches(&expected, reported)),
    })))
}

/// PUT /ludus/range/config uploads the pool topology to every main-user range
pub async fn put_config(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let (topology, users) = pool_topology(&state, query.pool_id()?)?;

    let requests = users
        .iter()
        .map(|id| DispatchRequest::upload(state.urls.range_config(id), id.as_str(), topology.clone(), true))
        .collect();
    let outcomes = state.fan_out(requests, &key).await;

    let errors: Vec<String> = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().err().map(|e| format!("User {}: {}", o.user_id, e)))
        .collect();
    if !errors.is_empty() {
        warn!("Range config upload failed for {} of {} users", errors.len(), outcomes.len());
        return Ok(HttpResponse::BadRequest().json(json!({ "errors": errors })));
    }
    Ok(HttpResponse::Ok().json(results(&outcomes)))
}

// ─── Range access ───

/// WireGuard config text from a `/user/wireguard` reply
fn wireguard_config(value: &Value) -> Option<String> {
    match value.get("result")?.get("wireGuardConfig")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::String(_) | Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Zip of `wireguard-configs/<userId>.conf` entries
pub fn zip_configs(configs: &[(String, String)]) -> Result<Vec<u8>, zip::result::ZipError> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (user_id, config) in configs {
        writer.start_file(format!("wireguard-configs/{}.conf", user_id), options)?;
        writer.write_all(config.as_bytes())?;
    }
    Ok(writer.finish()?.into_inner())
}

/// GET /ludus/range/access/wireguard
pub async fn wireguard(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let pool_id = query.pool_id()?;
    let users = state.pools.resolve_user_ids(pool_id, UserIdMode::MembersOnly)?;

    let requests = users
        .iter()
        .map(|id| DispatchRequest::new(Method::Get, state.urls.wireguard(id), id.as_str()))
        .collect();
    let outcomes = state.fan_out(requests, &key).await;

    let mut configs: Vec<(String, String)> = outcomes
        .iter()
        .filter_map(|o| o.value().and_then(wireguard_config).map(|c| (o.user_id.clone(), c)))
        .collect();
    if configs.is_empty() {
        return Err(ApiError::not_found("No configs found"));
    }
    configs.sort();

    let archive = zip_configs(&configs).map_err(|e| {
        warn!("Failed to build WireGuard archive: {}", e);
        ApiError::internal("Failed to create ZIP file")
    })?;
    Ok(HttpResponse::Ok().json(json!({
        "filename": format!("{}.zip", pool_id),
        "data": base64::engine::general_purpose::STANDARD.encode(&archive),
        "size": archive.len(),
    })))
}

async fn change_access(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>, action: &str) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let target = query.target_id()?;
    let users = state.pools.resolve_user_ids(query.pool_id()?, UserIdMode::MembersOnly)?;
    info!("Range access {} on {} for {} users", action, target, users.len());

    Ok(per_user(&state, &key, &users, |id| {
        DispatchRequest::new(Method::Post, state.urls.range_access(), id).with_json(json!({
            "action": action,
            "targetUserID": target,
            "sourceUserID": id,
            "force": true,
        }))
    })
    .await)
}

/// POST /ludus/range/access/share
pub async fn share(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    change_access(req, state, query, "grant").await
}

/// POST /ludus/range/access/unshare
pub async fn unshare(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    change_access(req, state, query, "revoke").await
}

/// GET /ludus/range/access
pub async fn access_status(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let target = query.target_id()?;
    let users = state.pools.resolve_user_ids(query.pool_id()?, UserIdMode::MembersOnly)?;

    let request = DispatchRequest::new(Method::Get, state.urls.range_access(), key.user_id.as_str());
    let outcome = state.call_once(request, &key).await;
    let value = outcome.result.map_err(|e| {
        warn!("Failed to read range access: {}", e);
        ApiError::internal("Internal Server Error")
    })?;

    let grants: Vec<AccessGrant> = serde_json::from_value(value).unwrap_or_else(|e| {
        warn!("Unexpected range access payload: {}", e);
        Vec::new()
    });
    Ok(HttpResponse::Ok().json(share_state(&grants, target, &users)))
}
