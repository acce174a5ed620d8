//! Route modules for the OCR server
//!
//! Two surfaces: `GET /stats` and the OCR endpoint, which accepts a POST on
//! any other path.

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod ocr;
pub mod stats;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stats", get(stats::get_stats))
        .fallback(ocr::handle_ocr)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
