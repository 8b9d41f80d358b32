// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! REST API: resource folders, pools and the Ludus fan-out endpoints

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::Config;
use crate::ludus::{dispatch, DispatchRequest, Executor, LudusUrls, Outcome};
use crate::pools::{PoolStore, UserIdMode};
use crate::store::FolderStore;

pub mod error;
mod pools;
mod proxmox;
mod ranges;
mod resources;
mod users;

pub use error::{ApiError, ApiResult};

/// Header carrying `<userId>.<secret>`; forwarded verbatim to Ludus
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub executor: Arc<dyn Executor>,
    pub urls: LudusUrls,
    pub pools: PoolStore,
    pub topologies: FolderStore,
    pub scenarios: FolderStore,
    pub ctfd_data: FolderStore,
}

impl AppState {
    pub fn new(config: Config, executor: Arc<dyn Executor>) -> Self {
        Self {
            urls: LudusUrls::new(&config.ludus_url, &config.ludus_admin_url),
            pools: PoolStore::new(&config.data.pools_dir),
            topologies: FolderStore::new(&config.data.topologies_dir),
            scenarios: FolderStore::new(&config.data.scenarios_dir),
            ctfd_data: FolderStore::new(&config.data.ctfd_data_dir),
            executor,
            config,
        }
    }

    /// Run one request per user through the bounded dispatcher
    pub async fn fan_out(&self, requests: Vec<DispatchRequest>, key: &ApiKey) -> Vec<Outcome> {
        dispatch(self.executor.clone(), requests, &key.raw, self.config.max_concurrent_requests).await
    }

    /// One upstream call outside any batch
    pub async fn call_once(&self, request: DispatchRequest, key: &ApiKey) -> Outcome {
        let user_id = request.user_id.clone();
        Outcome::classify(user_id, self.executor.execute(&request, &key.raw).await)
    }
}

// ─── Auth helpers ───

/// Caller credentials taken from the request
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub user_id: String,
    pub raw: String,
}

/// Check the API key is present and shaped `<userId>.<secret>`
pub fn require_api_key(req: &HttpRequest) -> ApiResult<ApiKey> {
    let raw = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if raw.is_empty() {
        return Err(ApiError::unauthorized("No API Key provided"));
    }
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ApiError::unauthorized("Malformed API Key provided"));
    }
    Ok(ApiKey { user_id: parts[0].to_string(), raw: raw.to_string() })
}

// ─── Request helpers ───

#[derive(Deserialize)]
pub struct PoolQuery {
    #[serde(rename = "poolId")]
    pub pool_id: Option<String>,
    pub scope: Option<String>,
    #[serde(rename = "targetId")]
    pub target_id: Option<String>,
}

impl PoolQuery {
    pub fn pool_id(&self) -> ApiResult<&str> {
        required(&self.pool_id)
    }

    pub fn target_id(&self) -> ApiResult<&str> {
        required(&self.target_id)
    }

    /// Which pool identities to target; `main` when not given
    pub fn mode(&self) -> ApiResult<UserIdMode> {
        match self.scope.as_deref() {
            None | Some("") => Ok(UserIdMode::default()),
            Some(scope) => Ok(scope.parse::<UserIdMode>()?),
        }
    }
}

/// A query parameter that must be present and non-empty
pub fn required(param: &Option<String>) -> ApiResult<&str> {
    param
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("Bad Request"))
}

/// `{"results": [...]}` in completion order
pub fn results(outcomes: &[Outcome]) -> Value {
    serde_json::json!({ "results": outcomes.iter().map(Outcome::to_json).collect::<Vec<_>>() })
}

/// An uploaded file from a multipart `file` field
pub struct Upload {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// Read the `file` part of a multipart body; other parts are drained and ignored
pub async fn read_upload(mut payload: Multipart) -> ApiResult<Upload> {
    let mut upload = None;
    while let Some(field) = payload.next().await {
        let mut field = field.map_err(|e| ApiError::bad_request(format!("Invalid upload: {}", e)))?;
        let (name, file_name) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().unwrap_or("").to_string(),
                cd.get_filename().unwrap_or("").to_string(),
            ),
            None => (String::new(), String::new()),
        };

        let mut content = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| ApiError::bad_request(format!("Invalid upload: {}", e)))?;
            content.extend_from_slice(&chunk);
        }
        if name == "file" && upload.is_none() {
            upload = Some(Upload { file_name, content });
        }
    }
    upload.ok_or_else(|| ApiError::bad_request("Bad Request"))
}

/// Upload whose file name carries `extension`
pub async fn read_upload_with_extension(payload: Multipart, extension: &str) -> ApiResult<Upload> {
    let upload = read_upload(payload).await?;
    let matches = std::path::Path::new(&upload.file_name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == extension);
    if !matches {
        return Err(ApiError::bad_request("Bad Request"));
    }
    Ok(upload)
}

// ─── Index ───

/// GET / answers with the service banner once the key checks out
pub async fn index(req: HttpRequest) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "result": "Ludus Extension API" })))
}

/// Configure all API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        .app_data(web::JsonConfig::default().error_handler(|err, _| {
            ApiError::bad_request(format!("Bad Request: {}", err)).into()
        }))
        .app_data(web::QueryConfig::default().error_handler(|err, _| {
            ApiError::bad_request(format!("Bad Request: {}", err)).into()
        }))
        .route("/", web::get().to(index))
        // CTFd scenarios and data
        .route("/ctfd/scenario", web::get().to(resources::get_scenario))
        .route("/ctfd/scenario", web::put().to(resources::put_scenario))
        .route("/ctfd/scenario", web::delete().to(resources::delete_scenario))
        .route("/ctfd/data", web::get().to(resources::get_ctfd_data))
        .route("/ctfd/data", web::put().to(resources::put_ctfd_data))
        .route("/ctfd/data", web::delete().to(resources::delete_ctfd_data))
        .route("/ctfd/topology", web::post().to(resources::post_ctfd_topology))
        // Topologies
        .route("/topology", web::get().to(resources::get_topology))
        .route("/topology", web::put().to(resources::put_topology))
        .route("/topology", web::delete().to(resources::delete_topology))
        // Pools
        .route("/pool", web::get().to(pools::get_pool))
        .route("/pool", web::post().to(pools::post_pool))
        .route("/pool", web::delete().to(pools::delete_pool))
        .route("/pool/users", web::patch().to(pools::patch_users))
        .route("/pool/topology", web::patch().to(pools::patch_topology))
        .route("/pool/ctfd-data", web::patch().to(pools::patch_ctfd_data))
        .route("/pool/note", web::patch().to(pools::patch_note))
        .route("/pool/flags", web::get().to(pools::get_flags))
        .route("/pool/flags", web::post().to(pools::generate_flags))
        .route("/pool/flags", web::delete().to(pools::delete_flags))
        // Ludus users
        .route("/ludus/users/import", web::post().to(users::import_users))
        .route("/ludus/users/delete", web::post().to(users::delete_users))
        .route("/ludus/users/check", web::post().to(users::check_users))
        // Ludus ranges
        .route("/ludus/range", web::delete().to(ranges::remove))
        .route("/ludus/range/deploy", web::post().to(ranges::deploy))
        .route("/ludus/range/status", web::get().to(ranges::status))
        .route("/ludus/range/redeploy", web::post().to(ranges::redeploy))
        .route("/ludus/range/abort", web::post().to(ranges::abort))
        .route("/ludus/range/config", web::get().to(ranges::get_config))
        .route("/ludus/range/config", web::put().to(ranges::put_config))
        .route("/ludus/range/access", web::get().to(ranges::access_status))
        .route("/ludus/range/access/wireguard", web::get().to(ranges::wireguard))
        .route("/ludus/range/access/share", web::post().to(ranges::share))
        .route("/ludus/range/access/unshare", web::post().to(ranges::unshare))
        // Proxmox
        .route("/proxmox/statistics", web::get().to(proxmox::statistics));
}
