//! Health and metrics endpoints

use actix_web::{get, web, HttpResponse};

use crate::error::AppError;
use crate::prometheus::PrometheusExporter;
use crate::service::RealtimeService;

/// Aggregated health; 503 while any component is critical
#[get("/health")]
pub async fn get_health(service: web::Data<RealtimeService>) -> HttpResponse {
    let health = service.health_check().await;
    if health.is_critical() {
        HttpResponse::ServiceUnavailable().json(health)
    } else {
        HttpResponse::Ok().json(health)
    }
}

#[get("/metrics")]
pub async fn get_metrics(service: web::Data<RealtimeService>) -> HttpResponse {
    HttpResponse::Ok().json(service.get_metrics().await)
}

#[get("/metrics/prometheus")]
pub async fn get_prometheus_metrics(
    service: web::Data<RealtimeService>,
) -> Result<HttpResponse, AppError> {
    let metrics = service.get_metrics().await;
    let health = service.health_check().await;
    let body = PrometheusExporter::new(&metrics)
        .with_health(&health)
        .export()
        .map_err(|e| AppError::Internal(format!("Failed to render metrics: {}", e)))?;

    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

pub fn create_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_health)
        .service(get_metrics)
        .service(get_prometheus_metrics);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn service(config: Config) -> web::Data<RealtimeService> {
        web::Data::from(Arc::new(
            RealtimeService::builder(config).build().unwrap(),
        ))
    }

    #[actix_web::test]
    async fn test_health_ok_then_unavailable_when_pool_full() {
        let mut config = Config::default();
        config.pool.max_connections = 1;
        let data = service(config);
        let app = test::init_service(
            App::new().app_data(data.clone()).configure(create_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        data.connect("s1", None).await.unwrap();
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "critical");
    }

    #[actix_web::test]
    async fn test_metrics_json_and_text() {
        let data = service(Config::default());
        let app = test::init_service(
            App::new().app_data(data.clone()).configure(create_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["queue_depth"], 0);
        assert!(body["processor"]["queue_depths"].is_object());

        let req = test::TestRequest::get()
            .uri("/metrics/prometheus")
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("realtime_throughput"));
    }
}
