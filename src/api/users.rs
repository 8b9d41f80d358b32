// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{require_api_key, results, ApiError, ApiResult, AppState};
use crate::ludus::aggregate::{missing_users, user_exists};
use crate::ludus::{DispatchRequest, Method};

#[derive(Deserialize)]
pub struct UsersRequest {
    #[serde(rename = "userIds")]
    pub user_ids: Vec<String>,
}

impl UsersRequest {
    fn validated(&self) -> ApiResult<&[String]> {
        if self.user_ids.is_empty() || self.user_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(ApiError::bad_request("Bad Request"));
        }
        Ok(&self.user_ids)
    }
}

/// POST /ludus/users/import
pub async fn import_users(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UsersRequest>,
) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let user_ids = body.validated()?;
    info!("Importing {} Ludus users", user_ids.len());

    let requests = user_ids
        .iter()
        .map(|id| {
            DispatchRequest::new(Method::Post, state.urls.user_create(), id.as_str())
                .with_json(json!({ "name": id, "userID": id, "isAdmin": false }))
        })
        .collect();
    let outcomes = state.fan_out(requests, &key).await;
    Ok(HttpResponse::Ok().json(results(&outcomes)))
}

/// POST /ludus/users/delete
pub async fn delete_users(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UsersRequest>,
) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let user_ids = body.validated()?;
    info!("Deleting {} Ludus users", user_ids.len());

    let requests = user_ids
        .iter()
        .map(|id| DispatchRequest::new(Method::Delete, state.urls.user_delete(id), id.as_str()))
        .collect();
    let outcomes = state.fan_out(requests, &key).await;
    Ok(HttpResponse::Ok().json(results(&outcomes)))
}

/// POST /ludus/users/check
pub async fn check_users(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UsersRequest>,
) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let user_ids = body.validated()?;

    let requests = user_ids
        .iter()
        .map(|id| DispatchRequest::new(Method::Get, state.urls.user(id), id.as_str()))
        .collect();
    let outcomes = state.fan_out(requests, &key).await;

    let per_user: Vec<_> = outcomes
        .iter()
        .map(|o| json!({ "userId": o.user_id, "exists": o.value().is_some_and(user_exists) }))
        .collect();
    let missing = missing_users(&outcomes);

    Ok(HttpResponse::Ok().json(json!({
        "results": per_user,
        "allExist": missing.is_empty(),
        "missingUserIds": missing,
    })))
}
