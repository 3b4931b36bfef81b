use actix_cors::Cors;
use actix_web::{
    http::header,
    middleware::{Compress, Logger, NormalizePath},
    web, App, HttpServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use open_webui_realtime::logging::init_tracing;
use open_webui_realtime::routes::create_routes;
use open_webui_realtime::{Config, RealtimeService};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration from a file when given, else from the environment
    let config = match std::env::var("REALTIME_CONFIG_FILE") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::from_env()?,
    };
    init_tracing(&config.logging)?;
    info!("Starting realtime service");

    let service = Arc::new(RealtimeService::from_config(config.clone())?);
    service.start().await?;
    info!(
        "Service started with {} backend servers",
        config.balancer.servers.len()
    );

    let data = web::Data::from(service.clone());
    let addr = SocketAddr::from((config.server.host.parse::<std::net::IpAddr>()?, config.server.port));
    let cors_allow_origin = config.server.cors_allow_origin.clone();

    info!("Admin API listening on http://{}", addr);

    let server = HttpServer::new(move || {
        let cors = if cors_allow_origin == "*" {
            Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "PUT", "DELETE", "OPTIONS"])
                .allow_any_header()
                .max_age(3600)
        } else {
            let mut cors = Cors::default();
            for origin in cors_allow_origin.split(',').map(|s| s.trim()) {
                cors = cors.allowed_origin(origin);
            }
            cors.allowed_methods(vec!["GET", "PUT", "DELETE", "OPTIONS"])
                .allowed_headers(vec![header::CONTENT_TYPE, header::ACCEPT])
                .max_age(3600)
        };

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(Compress::default())
            .wrap(Logger::default())
            .wrap(NormalizePath::trim())
            .configure(create_routes)
    })
    .bind(addr)?
    .disable_signals()
    .run();

    let handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.stop(true).await;
    service.shutdown().await;
    server_task.await??;

    info!("Shutdown complete");
    Ok(())
}
