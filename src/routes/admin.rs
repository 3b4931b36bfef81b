//! Operator endpoints for servers, connections, errors and the cache

use actix_web::{delete, get, put, web, HttpResponse};
use serde::Deserialize;

use crate::balancer::ServerState;
use crate::error::AppError;
use crate::service::RealtimeService;

const DEFAULT_ERROR_LIMIT: usize = 50;

#[get("/servers")]
pub async fn list_servers(service: web::Data<RealtimeService>) -> HttpResponse {
    HttpResponse::Ok().json(service.balancer().stats().await)
}

#[derive(Debug, Deserialize)]
pub struct ServerStateForm {
    pub state: ServerState,
}

/// Put a server into maintenance or take it offline (or back)
#[put("/servers/{server_id}/state")]
pub async fn set_server_state(
    service: web::Data<RealtimeService>,
    server_id: web::Path<String>,
    form: web::Json<ServerStateForm>,
) -> Result<HttpResponse, AppError> {
    let server_id = server_id.into_inner();
    service
        .balancer()
        .set_server_state(&server_id, form.state)
        .await?;

    let server = service
        .balancer()
        .server(&server_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("server {}", server_id)))?;
    Ok(HttpResponse::Ok().json(server))
}

#[get("/connections")]
pub async fn list_connections(service: web::Data<RealtimeService>) -> HttpResponse {
    let mut connections = service.pool().connections().await;
    connections.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    HttpResponse::Ok().json(serde_json::json!({
        "stats": service.pool().stats().await,
        "connections": connections,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ErrorsQuery {
    pub limit: Option<usize>,
}

/// Most recent errors first
#[get("/errors")]
pub async fn list_errors(
    service: web::Data<RealtimeService>,
    query: web::Query<ErrorsQuery>,
) -> HttpResponse {
    let limit = query.limit.unwrap_or(DEFAULT_ERROR_LIMIT);
    let handler = service.error_handler();

    HttpResponse::Ok().json(serde_json::json!({
        "metrics": handler.metrics().await,
        "errors": handler.recent_errors(limit).await,
    }))
}

#[get("/cache/stats")]
pub async fn get_cache_stats(service: web::Data<RealtimeService>) -> HttpResponse {
    HttpResponse::Ok().json(service.cache().stats().await)
}

/// Clear both cache tiers
#[delete("/cache")]
pub async fn clear_cache(service: web::Data<RealtimeService>) -> Result<HttpResponse, AppError> {
    let cleared = service.cache().clear().await?;
    tracing::info!(
        "Cache cleared ({} local, {} external)",
        cleared.local,
        cleared.external
    );

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Cache cleared",
        "cleared": cleared,
    })))
}

pub fn create_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(list_servers)
        .service(set_server_state)
        .service(list_connections)
        .service(list_errors)
        .service(get_cache_stats)
        .service(clear_cache);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig};
    use crate::processor::{Message, Priority};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn service() -> web::Data<RealtimeService> {
        let mut config = Config::default();
        config.balancer.servers = vec![
            ServerConfig::new("a", "127.0.0.1", 9001),
            ServerConfig::new("b", "127.0.0.1", 9002),
        ];
        web::Data::from(Arc::new(
            RealtimeService::builder(config).build().unwrap(),
        ))
    }

    #[actix_web::test]
    async fn test_servers_and_state_change() {
        let data = service();
        let app = test::init_service(
            App::new().app_data(data.clone()).configure(create_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/servers").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total_servers"], 2);

        let req = test::TestRequest::put()
            .uri("/servers/a/state")
            .set_json(serde_json::json!({ "state": "maintenance" }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "maintenance");

        let req = test::TestRequest::put()
            .uri("/servers/missing/state")
            .set_json(serde_json::json!({ "state": "offline" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_connections_and_errors() {
        let data = service();
        data.connect("s2", Some("u1")).await.unwrap();
        data.connect("s1", Some("u1")).await.unwrap();
        let _ = data
            .send("ghost", Message::new("chat", serde_json::json!({})), Priority::Normal)
            .await;

        let app = test::init_service(
            App::new().app_data(data.clone()).configure(create_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/connections").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["stats"]["size"], 2);
        assert_eq!(body["connections"][0]["session_id"], "s1");

        let req = test::TestRequest::get().uri("/errors?limit=10").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["errors"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["errors"][0]["context"]["operation"], "send");
    }

    #[actix_web::test]
    async fn test_cache_stats_and_clear() {
        let data = service();
        data.connect("s1", None).await.unwrap();
        let app = test::init_service(
            App::new().app_data(data.clone()).configure(create_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/cache/stats").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["entries"], 1);

        let req = test::TestRequest::delete().uri("/cache").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cleared"]["local"], 1);
    }
}
