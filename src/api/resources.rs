// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Folder-backed resources: CTFd scenarios, topologies and CTFd data

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use tracing::{error, info, warn};

use super::{read_upload_with_extension, require_api_key, required, ApiError, ApiResult, AppState};
use crate::ctfd::{CtfdData, TopologyRequest};
use crate::store::{read_first_file, timestamp, FolderStore};

#[derive(Deserialize)]
pub struct ScenarioQuery {
    #[serde(rename = "scenarioId", alias = "scenarioID")]
    pub scenario_id: Option<String>,
}

#[derive(Deserialize)]
pub struct TopologyQuery {
    #[serde(rename = "topologyId")]
    pub topology_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CtfdDataQuery {
    #[serde(rename = "ctfdDataId")]
    pub ctfd_data_id: Option<String>,
}

/// Non-empty id, or None to create a new resource
fn optional(id: &Option<String>) -> Option<&str> {
    id.as_deref().filter(|id| !id.is_empty())
}

/// Field names a file resource is reported under
struct FileFields {
    id: &'static str,
    name: &'static str,
    file: &'static str,
}

const SCENARIO: FileFields = FileFields { id: "scenarioID", name: "scenarioName", file: "scenarioFile" };
const TOPOLOGY: FileFields = FileFields { id: "topologyId", name: "topologyName", file: "topologyFile" };

/// One resource with its file base64-encoded
fn file_detail(store: &FolderStore, id: &str, fields: &FileFields) -> ApiResult<Value> {
    let file = store.first_file(id)?;
    let mut detail = serde_json::Map::new();
    detail.insert(fields.id.into(), json!(id));
    detail.insert(fields.name.into(), json!(file.name));
    detail.insert(fields.file.into(), json!(base64::engine::general_purpose::STANDARD.encode(&file.content)));
    detail.insert("createdAt".into(), json!(timestamp(&file.modified)));
    Ok(Value::Object(detail))
}

/// Every resource without its file content; empty folders are skipped
fn file_list(store: &FolderStore, fields: &FileFields) -> ApiResult<Vec<Value>> {
    let mut list = Vec::new();
    for item in store.list()? {
        match read_first_file(&store.base().join(&item.id)) {
            Ok(file) => {
                let mut entry = serde_json::Map::new();
                entry.insert(fields.id.into(), json!(item.id));
                entry.insert(fields.name.into(), json!(file.name));
                entry.insert("createdAt".into(), json!(timestamp(&file.modified)));
                list.push(Value::Object(entry));
            }
            Err(e) => warn!("Skipping {}: {}", item.id, e),
        }
    }
    Ok(list)
}

// ─── Scenarios ───

/// GET /ctfd/scenario
pub async fn get_scenario(req: HttpRequest, state: web::Data<AppState>, query: web::Query<ScenarioQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    match optional(&query.scenario_id) {
        Some(id) => Ok(HttpResponse::Ok().json(file_detail(&state.scenarios, id, &SCENARIO)?)),
        None => Ok(HttpResponse::Ok().json(file_list(&state.scenarios, &SCENARIO)?)),
    }
}

/// PUT /ctfd/scenario takes a `.zip` in the `file` field
pub async fn put_scenario(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<ScenarioQuery>,
    payload: Multipart,
) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let target = optional(&query.scenario_id);
    if let Some(id) = target {
        state.scenarios.validate(id)?;
    }
    let upload = read_upload_with_extension(payload, "zip").await?;
    let id = state.scenarios.replace_file(target, &upload.file_name, &upload.content)?;
    info!("Stored scenario {} ({} bytes)", id, upload.content.len());
    Ok(HttpResponse::Ok().json(json!({ "message": "Uploaded successfully", "id": id })))
}

/// DELETE /ctfd/scenario
pub async fn delete_scenario(req: HttpRequest, state: web::Data<AppState>, query: web::Query<ScenarioQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let id = required(&query.scenario_id)?;
    state.scenarios.remove(id)?;
    info!("Deleted scenario {}", id);
    Ok(HttpResponse::NoContent().finish())
}

// ─── Topologies ───

/// GET /topology
pub async fn get_topology(req: HttpRequest, state: web::Data<AppState>, query: web::Query<TopologyQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    match optional(&query.topology_id) {
        Some(id) => Ok(HttpResponse::Ok().json(file_detail(&state.topologies, id, &TOPOLOGY)?)),
        None => Ok(HttpResponse::Ok().json(file_list(&state.topologies, &TOPOLOGY)?)),
    }
}

/// PUT /topology takes a `.yml` in the `file` field
pub async fn put_topology(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<TopologyQuery>,
    payload: Multipart,
) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let target = optional(&query.topology_id);
    if let Some(id) = target {
        state.topologies.validate(id)?;
    }
    let upload = read_upload_with_extension(payload, "yml").await?;
    let id = state.topologies.replace_file(target, &upload.file_name, &upload.content)?;
    info!("Stored topology {} ({})", id, upload.file_name);
    Ok(HttpResponse::Ok().json(json!({ "message": "Uploaded successfully", "id": id })))
}

/// DELETE /topology refuses while any pool still uses the topology
pub async fn delete_topology(req: HttpRequest, state: web::Data<AppState>, query: web::Query<TopologyQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let id = required(&query.topology_id)?;
    state.topologies.validate(id)?;
    if let Some(pool_id) = state.pools.using_topology(id)?.first() {
        return Err(ApiError::conflict(format!("Topology is in use by pool {}", pool_id)));
    }
    state.topologies.remove(id)?;
    info!("Deleted topology {}", id);
    Ok(HttpResponse::NoContent().finish())
}

/// POST /ctfd/topology renders the CTFd template into a new topology
pub async fn post_ctfd_topology(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<TopologyRequest>,
) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let file_name = body.file_name().map_err(ApiError::bad_request)?;

    let template_path = &state.config.data.ctfd_topology_template;
    let template = fs::read_to_string(template_path).map_err(|e| {
        error!("Failed to read CTFd template {}: {}", template_path.display(), e);
        ApiError::internal("Internal Server Error")
    })?;

    state.scenarios.validate(&body.scenario_id)?;
    state.pools.folders().validate(&body.pool_id)?;

    let rendered = body.render(&template);
    let id = state.topologies.replace_file(None, &file_name, rendered.as_bytes())?;
    info!("Created CTFd topology {} for pool {}", id, body.pool_id);

    Ok(HttpResponse::Ok().json(json!({
        "message": "CTFd topology created successfully",
        "topologyId": id,
        "topologyName": file_name,
    })))
}

// ─── CTFd data ───

/// GET /ctfd/data
pub async fn get_ctfd_data(req: HttpRequest, state: web::Data<AppState>, query: web::Query<CtfdDataQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    if let Some(id) = optional(&query.ctfd_data_id) {
        let dir = state.ctfd_data.validate(id)?;
        let data = CtfdData::load(&dir)?.ok_or_else(|| ApiError::not_found("Not Found"))?;
        return Ok(HttpResponse::Ok().json(json!({ "ctfdDataId": id, "ctfdData": data.ctfd_data })));
    }

    let mut list = Vec::new();
    for item in state.ctfd_data.list()? {
        match CtfdData::load(&state.ctfd_data.base().join(&item.id)) {
            Ok(Some(data)) => list.push(json!({ "ctfdDataId": item.id, "ctfdData": data.ctfd_data })),
            Ok(None) => {}
            Err(e) => warn!("Skipping CTFd data {}: {}", item.id, e),
        }
    }
    Ok(HttpResponse::Ok().json(list))
}

/// PUT /ctfd/data creates or replaces a validated credential set
pub async fn put_ctfd_data(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<CtfdDataQuery>,
    body: web::Json<CtfdData>,
) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let dir = match optional(&query.ctfd_data_id) {
        Some(id) => Some((id.to_string(), state.ctfd_data.validate(id)?)),
        None => None,
    };
    body.validate().map_err(ApiError::bad_request)?;

    let (id, dir) = match dir {
        Some(existing) => existing,
        None => state.ctfd_data.create()?,
    };
    body.save(&dir)?;
    info!("Stored CTFd data {} ({} users)", id, body.ctfd_data.len());
    Ok(HttpResponse::Ok().json(json!({ "message": "Uploaded successfully", "id": id })))
}

/// DELETE /ctfd/data
pub async fn delete_ctfd_data(req: HttpRequest, state: web::Data<AppState>, query: web::Query<CtfdDataQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let id = required(&query.ctfd_data_id)?;
    state.ctfd_data.remove(id)?;
    info!("Deleted CTFd data {}", id);
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::*;
    use crate::api::{configure, API_KEY_HEADER};
    use crate::pools::{Pool, PoolType};
    use actix_web::{test, App};
    use std::sync::Arc;

    const BOUNDARY: &str = "dulusboundary";

    fn multipart(file_name: &str, content: &str) -> String {
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n{c}\r\n--{b}--\r\n",
            b = BOUNDARY,
            f = file_name,
            c = content
        )
    }

    fn put_file(uri: &str, file_name: &str, content: &str) -> test::TestRequest {
        test::TestRequest::put()
            .uri(uri)
            .insert_header((API_KEY_HEADER, KEY))
            .insert_header(("Content-Type", format!("multipart/form-data; boundary={}", BOUNDARY)))
            .set_payload(multipart(file_name, content))
    }

    fn keyed(req: test::TestRequest) -> test::TestRequest {
        req.insert_header((API_KEY_HEADER, KEY))
    }

    #[actix_web::test]
    async fn topology_upload_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new().app_data(state(dir.path(), Arc::new(FakeLudus::default()))).configure(configure),
        )
        .await;

        let body: Value = test::call_and_read_body_json(&app, put_file("/topology", "lab.yml", "ludus: []").to_request()).await;
        assert_eq!(body["message"], "Uploaded successfully");
        let id = body["id"].as_str().unwrap().to_string();

        let body: Value =
            test::call_and_read_body_json(&app, keyed(test::TestRequest::get().uri(&format!("/topology?topologyId={}", id))).to_request()).await;
        assert_eq!(body["topologyName"], "lab.yml");
        assert_eq!(body["topologyFile"], base64::engine::general_purpose::STANDARD.encode("ludus: []"));

        let body: Value = test::call_and_read_body_json(&app, keyed(test::TestRequest::get().uri("/topology")).to_request()).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert!(body[0].get("topologyFile").is_none());

        let resp = test::call_service(&app, keyed(test::TestRequest::delete().uri(&format!("/topology?topologyId={}", id))).to_request()).await;
        assert_eq!(resp.status(), 204);
        let resp = test::call_service(&app, keyed(test::TestRequest::get().uri(&format!("/topology?topologyId={}", id))).to_request()).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn wrong_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new().app_data(state(dir.path(), Arc::new(FakeLudus::default()))).configure(configure),
        )
        .await;

        let resp = test::call_service(&app, put_file("/topology", "lab.txt", "x").to_request()).await;
        assert_eq!(resp.status(), 400);
        let resp = test::call_service(&app, put_file("/ctfd/scenario", "scenario.yml", "x").to_request()).await;
        assert_eq!(resp.status(), 400);
        let resp = test::call_service(&app, put_file("/ctfd/scenario", "scenario.zip", "PK").to_request()).await;
        assert_eq!(resp.status(), 200);
    }

    #[actix_web::test]
    async fn scenario_responses_use_upper_case_id() {
        let dir = tempfile::tempdir().unwrap();
        let data = state(dir.path(), Arc::new(FakeLudus::default()));
        let scenario_id = data.scenarios.replace_file(None, "web.zip", b"PK").unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let body: Value = test::call_and_read_body_json(
            &app,
            keyed(test::TestRequest::get().uri(&format!("/ctfd/scenario?scenarioId={}", scenario_id))).to_request(),
        )
        .await;
        assert_eq!(body["scenarioID"], scenario_id.as_str());
        assert_eq!(body["scenarioName"], "web.zip");
        assert!(body.get("scenarioId").is_none());

        let body: Value = test::call_and_read_body_json(&app, keyed(test::TestRequest::get().uri("/ctfd/scenario")).to_request()).await;
        assert_eq!(body[0]["scenarioID"], scenario_id.as_str());
    }

    #[actix_web::test]
    async fn topology_in_use_cannot_be_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let data = state(dir.path(), Arc::new(FakeLudus::default()));
        let topology_id = data.topologies.replace_file(None, "lab.yml", b"ludus: []").unwrap();
        let pool_id = data
            .pools
            .create(Pool {
                created_by: "admin".into(),
                note: String::new(),
                topology_id: topology_id.clone(),
                ctfd_data_id: None,
                pool_type: PoolType::Individual,
                main_user: None,
                users_and_teams: vec![],
            })
            .unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let resp = test::call_service(
            &app,
            keyed(test::TestRequest::delete().uri(&format!("/topology?topologyId={}", topology_id))).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 409);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], format!("Topology is in use by pool {}", pool_id));
    }

    #[actix_web::test]
    async fn ctfd_data_round_trip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new().app_data(state(dir.path(), Arc::new(FakeLudus::default()))).configure(configure),
        )
        .await;

        let bad = json!({"ctfd_data": [{"user": "a", "team": "red"}, {"user": "b"}]});
        let resp = test::call_service(&app, keyed(test::TestRequest::put().uri("/ctfd/data").set_json(bad)).to_request()).await;
        assert_eq!(resp.status(), 400);
        assert_eq!(dir.path().join("ctfd-data").read_dir().unwrap().count(), 0);

        let good = json!({"ctfd_data": [{"user": "a", "password": "p", "team": "red"}]});
        let body: Value =
            test::call_and_read_body_json(&app, keyed(test::TestRequest::put().uri("/ctfd/data").set_json(good)).to_request()).await;
        let id = body["id"].as_str().unwrap().to_string();

        let body: Value = test::call_and_read_body_json(
            &app,
            keyed(test::TestRequest::get().uri(&format!("/ctfd/data?ctfdDataId={}", id))).to_request(),
        )
        .await;
        assert_eq!(body["ctfdData"][0]["team"], "red");

        let body: Value = test::call_and_read_body_json(&app, keyed(test::TestRequest::get().uri("/ctfd/data")).to_request()).await;
        assert_eq!(body[0]["ctfdDataId"], id.as_str());
    }

    #[actix_web::test]
    async fn ctfd_topology_from_template() {
        let dir = tempfile::tempdir().unwrap();
        let data = state(dir.path(), Arc::new(FakeLudus::default()));
        fs::write(&data.config.data.ctfd_topology_template, "ctfd:\n  name: $CTF_NAME\n  pool: $POOL_ID\n").unwrap();
        let scenario_id = data.scenarios.replace_file(None, "s.zip", b"PK").unwrap();
        let (pool_id, _) = data.pools.folders().create().unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let request = |scenario: &str| {
            json!({
                "topologyName": "finals",
                "scenarioId": scenario,
                "poolId": pool_id,
                "adminUsername": "admin",
                "adminPassword": "pw",
                "ctfName": "Finals",
            })
        };

        let resp = test::call_service(
            &app,
            keyed(test::TestRequest::post().uri("/ctfd/topology").set_json(request("missing1"))).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);

        let body: Value = test::call_and_read_body_json(
            &app,
            keyed(test::TestRequest::post().uri("/ctfd/topology").set_json(request(&scenario_id))).to_request(),
        )
        .await;
        assert_eq!(body["topologyName"], "ctfd_finals.yml");
        let id = body["topologyId"].as_str().unwrap();

        let body: Value = test::call_and_read_body_json(
            &app,
            keyed(test::TestRequest::get().uri(&format!("/topology?topologyId={}", id))).to_request(),
        )
        .await;
        let file = base64::engine::general_purpose::STANDARD.decode(body["topologyFile"].as_str().unwrap()).unwrap();
        assert_eq!(
            String::from_utf8(file).unwrap(),
            format!("ctfd:\n  name: \"Finals\"\n  pool: \"{}\"\n", pool_id)
        );
    }
}
