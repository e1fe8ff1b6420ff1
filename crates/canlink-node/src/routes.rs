// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Route definitions for the base-station API.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::stream;

/// Build the API router. CORS stays permissive: the dashboard is served
/// from a different origin at the track.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/messages", get(handlers::get_messages))
        .route("/api/import", post(handlers::import_message))
        .route("/api/stream", get(stream::stream_messages))
        .route("/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
