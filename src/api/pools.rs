// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Pool CRUD and CTFd flag collection

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

use super::{require_api_key, ApiError, ApiKey, ApiResult, AppState, PoolQuery};
use crate::ctfd::{CtfdData, CtfdUser, Flag};
use crate::ludus::aggregate::outcome_flags;
use crate::ludus::{DispatchRequest, Method};
use crate::pools::{Pool, PoolMember, PoolType};
use crate::store::random_string;

const PASSWORD_LENGTH: usize = 6;

#[derive(Deserialize)]
pub struct GetPoolQuery {
    #[serde(rename = "poolId")]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub users: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersPatch {
    pub users_and_teams: Vec<PoolMember>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyPatch {
    pub topology_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtfdDataPatch {
    pub ctfd_data_id: String,
}

#[derive(Deserialize)]
pub struct NotePatch {
    pub note: String,
}

fn updated() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": "Updated successfully" }))
}

/// Referenced topology and CTFd data must exist before a pool may point at them
fn check_references(state: &AppState, pool: &Pool) -> ApiResult<()> {
    state.topologies.validate(&pool.topology_id)?;
    if let Some(id) = pool.ctfd_data_id.as_deref().filter(|id| !id.is_empty()) {
        state.ctfd_data.validate(id)?;
    }
    Ok(())
}

/// GET /pool lists summaries, or returns one pool (only its members with `users=true`)
pub async fn get_pool(req: HttpRequest, state: web::Data<AppState>, query: web::Query<GetPoolQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let Some(pool_id) = query.pool_id.as_deref().filter(|id| !id.is_empty()) else {
        return Ok(HttpResponse::Ok().json(state.pools.summaries()?));
    };

    let pool = state.pools.get(pool_id)?;
    if query.users {
        return Ok(HttpResponse::Ok().json(json!({
            "poolId": pool_id,
            "usersAndTeams": pool.users_and_teams,
        })));
    }
    let mut full = serde_json::to_value(&pool).map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(map) = full.as_object_mut() {
        map.insert("poolId".to_string(), Value::String(pool_id.to_string()));
    }
    Ok(HttpResponse::Ok().json(full))
}

/// POST /pool
pub async fn post_pool(req: HttpRequest, state: web::Data<AppState>, body: web::Json<Pool>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let mut pool = body.into_inner();
    check_references(&state, &pool)?;
    if pool.created_by.is_empty() {
        pool.created_by = key.user_id;
    }
    let id = state.pools.create(pool)?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Uploaded successfully", "id": id })))
}

/// PATCH /pool/users
pub async fn patch_users(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<PoolQuery>,
    body: web::Json<UsersPatch>,
) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let members = body.into_inner().users_and_teams;
    state.pools.update(query.pool_id()?, |pool| pool.users_and_teams = members)?;
    Ok(updated())
}

/// PATCH /pool/topology
pub async fn patch_topology(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<PoolQuery>,
    body: web::Json<TopologyPatch>,
) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let pool_id = query.pool_id()?;
    state.pools.get(pool_id)?;
    state.topologies.validate(&body.topology_id)?;
    let topology_id = body.into_inner().topology_id;
    state.pools.update(pool_id, |pool| pool.topology_id = topology_id)?;
    Ok(updated())
}

/// PATCH /pool/ctfd-data
pub async fn patch_ctfd_data(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<PoolQuery>,
    body: web::Json<CtfdDataPatch>,
) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let pool_id = query.pool_id()?;
    state.pools.get(pool_id)?;
    state.ctfd_data.validate(&body.ctfd_data_id)?;
    let ctfd_data_id = body.into_inner().ctfd_data_id;
    state.pools.update(pool_id, |pool| pool.ctfd_data_id = Some(ctfd_data_id))?;
    Ok(updated())
}

/// PATCH /pool/note
pub async fn patch_note(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<PoolQuery>,
    body: web::Json<NotePatch>,
) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let note = body.into_inner().note;
    state.pools.update(query.pool_id()?, |pool| pool.note = note)?;
    Ok(updated())
}

/// DELETE /pool
pub async fn delete_pool(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    state.pools.delete(query.pool_id()?)?;
    Ok(HttpResponse::NoContent().finish())
}

// ─── Flags ───

/// GET /pool/flags
pub async fn get_flags(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    let pool_id = query.pool_id()?;
    let data = state.pools.ctfd_data(pool_id)?.ok_or_else(|| ApiError::not_found("Not Found"))?;
    Ok(HttpResponse::Ok().json(json!({ "poolId": pool_id, "ctfdData": data.ctfd_data })))
}

/// Flags per member user id. Shared pools hand every member the main user's flags;
/// individual and CTFd pools scrape each member's own range.
async fn collect_flags(state: &AppState, pool: &Pool, key: &ApiKey) -> ApiResult<HashMap<String, Vec<Flag>>> {
    if let (PoolType::Shared, Some(main)) = (pool.pool_type, pool.main_user()) {
        let request = DispatchRequest::new(Method::Get, state.urls.range_logs(main), main);
        let outcome = state.call_once(request, key).await;
        if let Err(e) = &outcome.result {
            warn!("Failed to read logs for main user {}: {}", main, e);
            return Err(ApiError::internal(format!("failed to get main user flags: {}", e)));
        }
        let flags = outcome_flags(&outcome);
        return Ok(pool.member_ids().into_iter().map(|id| (id, flags.clone())).collect());
    }

    let requests = pool
        .member_ids()
        .iter()
        .map(|id| DispatchRequest::new(Method::Get, state.urls.range_logs(id), id.as_str()))
        .collect();
    let outcomes = state.fan_out(requests, key).await;
    Ok(outcomes.iter().map(|o| (o.user_id.clone(), outcome_flags(o))).collect())
}

/// POST /pool/flags scrapes range logs into the pool's CTFd data; existing data is kept
pub async fn generate_flags(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    let key = require_api_key(&req)?;
    let pool_id = query.pool_id()?;
    let pool = state.pools.get(pool_id)?;

    let mut flags = collect_flags(&state, &pool, &key).await?;
    let data = CtfdData {
        ctfd_data: pool
            .users_and_teams
            .iter()
            .map(|member| CtfdUser {
                user: member.user.clone(),
                password: random_string(PASSWORD_LENGTH),
                team: member.team().map(str::to_string),
                flags: Some(flags.remove(&member.user_id).unwrap_or_default()),
            })
            .collect(),
    };

    if !state.pools.save_ctfd_data(pool_id, &data)? {
        return Err(ApiError::conflict("CTFd data already exists for this pool"));
    }
    let found: usize = data.ctfd_data.iter().filter_map(|u| u.flags.as_ref()).map(Vec::len).sum();
    info!("Generated CTFd data for pool {} ({} users, {} flags)", pool_id, data.ctfd_data.len(), found);

    Ok(HttpResponse::Ok().json(json!({
        "message": "Flags generated successfully",
        "poolId": pool_id,
        "ctfdData": data.ctfd_data,
    })))
}

/// DELETE /pool/flags
pub async fn delete_flags(req: HttpRequest, state: web::Data<AppState>, query: web::Query<PoolQuery>) -> ApiResult<HttpResponse> {
    require_api_key(&req)?;
    state.pools.delete_ctfd_data(query.pool_id()?)?;
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::*;
    use crate::api::{configure, API_KEY_HEADER};
    use actix_web::{test, App};
    use std::sync::Arc;

    fn keyed(req: test::TestRequest) -> test::TestRequest {
        req.insert_header((API_KEY_HEADER, KEY))
    }

    fn log(flags: &str) -> Value {
        json!({ "result": format!("TASK [flags] ok: &%&{}&%& done", flags) })
    }

    #[actix_web::test]
    async fn create_read_patch_delete() {
        let dir = tempfile::tempdir().unwrap();
        let data = state(dir.path(), Arc::new(FakeLudus::default()));
        let topology_id = data.topologies.replace_file(None, "lab.yml", b"ludus: []").unwrap();
        let other_topology = data.topologies.replace_file(None, "lab2.yml", b"ludus: []").unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let missing = json!({"topologyId": "nope12", "type": "INDIVIDUAL", "usersAndTeams": []});
        let resp = test::call_service(&app, keyed(test::TestRequest::post().uri("/pool").set_json(missing)).to_request()).await;
        assert_eq!(resp.status(), 404);

        let pool = json!({
            "topologyId": topology_id,
            "type": "SHARED",
            "mainUser": "trainer",
            "usersAndTeams": [{"user": "Jane Roe"}, {"user": "Bob"}],
        });
        let body: Value =
            test::call_and_read_body_json(&app, keyed(test::TestRequest::post().uri("/pool").set_json(pool)).to_request()).await;
        let id = body["id"].as_str().unwrap().to_string();

        let body: Value = test::call_and_read_body_json(
            &app,
            keyed(test::TestRequest::get().uri(&format!("/pool?poolId={}", id))).to_request(),
        )
        .await;
        assert_eq!(body["poolId"], id.as_str());
        assert_eq!(body["createdBy"], "admin");
        assert_eq!(body["usersAndTeams"][0]["userId"], "BATCHjaneroe");

        let body: Value = test::call_and_read_body_json(
            &app,
            keyed(test::TestRequest::get().uri(&format!("/pool?poolId={}&users=true", id))).to_request(),
        )
        .await;
        assert!(body.get("mainUser").is_none());
        assert_eq!(body["usersAndTeams"].as_array().unwrap().len(), 2);

        let resp = test::call_service(
            &app,
            keyed(test::TestRequest::patch().uri(&format!("/pool/topology?poolId={}", id)).set_json(json!({"topologyId": other_topology}))).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 200);

        let resp = test::call_service(
            &app,
            keyed(test::TestRequest::patch().uri(&format!("/pool/users?poolId={}", id)).set_json(json!({"usersAndTeams": [{"user": "trainer"}, {"user": "trainer"}]}))).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 400);

        let body: Value = test::call_and_read_body_json(&app, keyed(test::TestRequest::get().uri("/pool")).to_request()).await;
        assert_eq!(body[0]["topologyId"], other_topology.as_str());
        assert!(body[0].get("usersAndTeams").is_none());

        let resp = test::call_service(&app, keyed(test::TestRequest::delete().uri(&format!("/pool?poolId={}", id))).to_request()).await;
        assert_eq!(resp.status(), 204);
        let resp = test::call_service(&app, keyed(test::TestRequest::get().uri(&format!("/pool?poolId={}", id))).to_request()).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn individual_flags_per_member() {
        let dir = tempfile::tempdir().unwrap();
        let ludus = Arc::new(
            FakeLudus::default()
                .on(Method::Get, "https://ludus:8080/range/logs/?userID=BATCHann", log(r#"{\"F1\":\"a1\"}"#))
                .fail(Method::Get, "https://ludus:8080/range/logs/?userID=BATCHbo", "timeout"),
        );
        let data = state(dir.path(), ludus);
        let pool_id = data
            .pools
            .create(Pool {
                created_by: "admin".into(),
                note: String::new(),
                topology_id: "topo01".into(),
                ctfd_data_id: None,
                pool_type: crate::pools::PoolType::Individual,
                main_user: None,
                users_and_teams: ["Ann", "Bo"]
                    .iter()
                    .map(|u| PoolMember { user: u.to_string(), user_id: String::new(), team: None })
                    .collect(),
            })
            .unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let uri = format!("/pool/flags?poolId={}", pool_id);
        let resp = test::call_service(&app, keyed(test::TestRequest::get().uri(&uri)).to_request()).await;
        assert_eq!(resp.status(), 404);

        let body: Value = test::call_and_read_body_json(&app, keyed(test::TestRequest::post().uri(&uri)).to_request()).await;
        let users = body["ctfdData"].as_array().unwrap();
        assert_eq!(users[0]["user"], "Ann");
        assert_eq!(users[0]["flags"], json!([{"variable": "F1", "contents": "a1"}]));
        assert_eq!(users[0]["password"].as_str().unwrap().len(), PASSWORD_LENGTH);
        assert_eq!(users[1]["flags"], json!([]));

        let resp = test::call_service(&app, keyed(test::TestRequest::post().uri(&uri)).to_request()).await;
        assert_eq!(resp.status(), 409);

        let body: Value = test::call_and_read_body_json(&app, keyed(test::TestRequest::get().uri(&uri)).to_request()).await;
        assert_eq!(body["ctfdData"][0]["user"], "Ann");

        let resp = test::call_service(&app, keyed(test::TestRequest::delete().uri(&uri)).to_request()).await;
        assert_eq!(resp.status(), 204);
    }

    #[actix_web::test]
    async fn shared_pool_reuses_main_user_flags() {
        let dir = tempfile::tempdir().unwrap();
        let ludus = Arc::new(
            FakeLudus::default()
                .on(Method::Get, "https://ludus:8080/range/logs/?userID=trainer", log(r#"{\"F1\":\"x\",\"F2\":\"y\"}"#)),
        );
        let data = state(dir.path(), ludus.clone());
        let pool_id = data
            .pools
            .create(Pool {
                created_by: "admin".into(),
                note: String::new(),
                topology_id: "topo01".into(),
                ctfd_data_id: None,
                pool_type: crate::pools::PoolType::Shared,
                main_user: Some("trainer".into()),
                users_and_teams: ["Ann", "Bo"]
                    .iter()
                    .map(|u| PoolMember { user: u.to_string(), user_id: String::new(), team: Some("blue".into()) })
                    .collect(),
            })
            .unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let body: Value = test::call_and_read_body_json(
            &app,
            keyed(test::TestRequest::post().uri(&format!("/pool/flags?poolId={}", pool_id))).to_request(),
        )
        .await;
        let users = body["ctfdData"].as_array().unwrap();
        assert_eq!(users.len(), 2);
        for user in users {
            assert_eq!(user["flags"].as_array().unwrap().len(), 2);
            assert_eq!(user["team"], "blue");
        }
        assert_eq!(ludus.calls().len(), 1);
    }

    #[actix_web::test]
    async fn ctfd_pool_scrapes_each_member() {
        let dir = tempfile::tempdir().unwrap();
        let ludus = Arc::new(
            FakeLudus::default()
                .on(Method::Get, "https://ludus:8080/range/logs/?userID=BATCHann", log(r#"{\"F1\":\"a\"}"#))
                .on(Method::Get, "https://ludus:8080/range/logs/?userID=BATCHbo", log(r#"{\"F1\":\"b\"}"#)),
        );
        let data = state(dir.path(), ludus.clone());
        let pool_id = data
            .pools
            .create(Pool {
                created_by: "admin".into(),
                note: String::new(),
                topology_id: "topo01".into(),
                ctfd_data_id: None,
                pool_type: PoolType::Ctfd,
                main_user: Some("trainer".into()),
                users_and_teams: ["Ann", "Bo"]
                    .iter()
                    .map(|u| PoolMember { user: u.to_string(), user_id: String::new(), team: None })
                    .collect(),
            })
            .unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let body: Value = test::call_and_read_body_json(
            &app,
            keyed(test::TestRequest::post().uri(&format!("/pool/flags?poolId={}", pool_id))).to_request(),
        )
        .await;
        let users = body["ctfdData"].as_array().unwrap();
        assert_eq!(users[0]["flags"], json!([{"variable": "F1", "contents": "a"}]));
        assert_eq!(users[1]["flags"], json!([{"variable": "F1", "contents": "b"}]));

        let mut urls: Vec<String> = ludus.calls().into_iter().map(|c| c.url).collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://ludus:8080/range/logs/?userID=BATCHann".to_string(),
                "https://ludus:8080/range/logs/?userID=BATCHbo".to_string(),
            ]
        );
    }
}
