pub mod sessions;
pub mod voice;

pub use sessions::*;
pub use voice::*;

use crate::health::{health_check, prometheus_metrics};
use crate::websocket::relay_websocket;
use actix_web::web;

/// Register every route the gateway serves.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(prometheus_metrics))
        .route("/ws", web::get().to(relay_websocket))
        .service(
            web::scope("/api/v1")
                .route("/voice", web::post().to(ingest_voice))
                .route("/voice/{correlation_id}", web::get().to(ingest_status))
                .route("/sessions", web::post().to(create_session))
                .route("/sessions/{id}", web::get().to(get_session))
                .route("/sessions/{id}", web::delete().to(end_session)),
        );
}
