pub mod handlers;

use crate::state::AppState;
use axum::{routing::get, Router};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/nop", get(handlers::nop))
        .route("/capability", get(handlers::capability))
        .route("/check", get(handlers::check))
        .route("/list", get(handlers::list))
        .route("/item", get(handlers::item))
        .route("/video", get(handlers::video))
        .route("/audio", get(handlers::audio))
        .route("/photo", get(handlers::photo))
        .route("/chapter", get(handlers::chapter))
        .route(
            "/current",
            get(handlers::get_current).put(handlers::put_current),
        )
        .route("/categories", get(handlers::categories))
        .with_state(state)
}
