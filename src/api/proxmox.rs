// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::Value;
use tracing::{error, warn};

use super::{require_api_key, ApiError, ApiResult, AppState};
use crate::ludus::{DispatchRequest, Method};
use crate::proxmox::{parse_statistics, LocalCounts, PveClient};

/// GET /proxmox/statistics
pub async fn statistics(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let pve = &state.config.proxmox;
    if pve.url.is_empty() || pve.username.is_empty() || pve.password.is_empty() {
        return Err(ApiError::internal("Proxmox configuration missing"));
    }

    let client = PveClient::new(&pve.url, state.config.request_timeout());
    let ticket = client.authenticate(&pve.username, &pve.password).await.map_err(|e| {
        error!("Proxmox login as {} failed: {}", pve.username, e);
        ApiError::internal(format!("Authentication failed: {}", e))
    })?;
    let resources = client
        .cluster_resources(&ticket)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to fetch cluster resources: {}", e)))?;

    // Role count is informational; an unreachable Ludus reports zero
    let roles = state
        .call_once(DispatchRequest::new(Method::Get, state.urls.ansible(), key.user_id.as_str()), &key)
        .await;
    let roles = match roles.value() {
        Some(Value::Array(items)) => items.len(),
        _ => {
            warn!("Could not count Ansible roles for {}", key.user_id);
            0
        }
    };

    let counts = LocalCounts {
        topologies: state.topologies.count(),
        scenarios: state.scenarios.count(),
        pools: state.pools.folders().count(),
        roles,
    };
    Ok(HttpResponse::Ok().json(parse_statistics(&resources, &pve.node, counts)))
}
