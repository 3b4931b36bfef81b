pub mod admin;
pub mod monitoring;

use actix_web::web;

pub fn create_routes(cfg: &mut web::ServiceConfig) {
    cfg.configure(monitoring::create_routes)
        .configure(admin::create_routes);
}
