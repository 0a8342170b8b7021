mod health;
mod metrics;
mod video_feed;

use crate::{config::AssetsConfig, server::SharedState};
use axum::{routing::get, Router};
use health::healthcheck;
use metrics::metrics_handler;
use tower_http::services::{ServeDir, ServeFile};
use video_feed::video_feed;

/// `ServeDir` resolves paths under the static directory only and answers 404 otherwise.
pub fn api_routes(assets: &AssetsConfig) -> Router<SharedState> {
    Router::new()
        .route_service("/", ServeFile::new(&assets.index_file))
        .route("/video_feed", get(video_feed))
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
        .nest_service("/static", ServeDir::new(&assets.static_dir))
}
