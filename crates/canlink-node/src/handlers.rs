// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! HTTP request handlers for the base-station API.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Local;
use serde::{Deserialize, Serialize};

use canlink::broker::CHANNEL_DECODED;
use canlink::decode::{parse_can_id, source_time_from_millis, DecodedRecord};
use canlink::history::{FilterMode, HistoryQuery, QUERY_LIMIT_DEFAULT};

use crate::state::AppState;

/// API error response: `{"detail": "..."}` with the given status.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub detail: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Query parameters for `GET /api/messages`.
#[derive(Debug, Default, Deserialize)]
pub struct MessagesParams {
    pub filter_mode: Option<FilterMode>,
    pub time_range: Option<i64>,
    pub can_id: Option<String>,
    pub message_name: Option<String>,
    pub limit: Option<usize>,
}

impl MessagesParams {
    /// Resolve into a history query; malformed `can_id` is a 400.
    pub fn into_query(self) -> Result<HistoryQuery, ApiError> {
        let can_id = match self.can_id.as_deref().filter(|s| !s.is_empty()) {
            None => None,
            Some(raw) => Some(
                parse_can_id(raw)
                    .ok_or_else(|| ApiError::bad_request(format!("invalid can_id: {:?}", raw)))?,
            ),
        };

        Ok(HistoryQuery {
            filter_mode: self.filter_mode.unwrap_or(FilterMode::ReceivedTime),
            time_range: self.time_range.unwrap_or(60).clamp(1, 3600),
            can_id,
            message_name: self.message_name.filter(|s| !s.is_empty()),
            limit: self.limit.unwrap_or(QUERY_LIMIT_DEFAULT),
        })
    }
}

/// GET /api/messages
pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MessagesParams>,
) -> Result<Json<Vec<DecodedRecord>>, ApiError> {
    let query = params.into_query()?;
    Ok(Json(state.history.query(&query)))
}

/// Body of `POST /api/import`.
#[derive(Debug, Deserialize)]
pub struct ImportPayload {
    /// CAN id, decimal or `0x`-prefixed hex.
    pub id: String,
    pub data: Vec<i64>,
    /// Source time in epoch milliseconds; local clock when absent.
    pub time: Option<i64>,
}

impl ImportPayload {
    fn data_bytes(&self) -> Result<Vec<u8>, ApiError> {
        if self.data.is_empty() || self.data.len() > canlink::codec::CAN_DATA_LEN {
            return Err(ApiError::bad_request(format!(
                "Decoding failed: data must be 1..={} bytes (got {})",
                canlink::codec::CAN_DATA_LEN,
                self.data.len()
            )));
        }
        self.data
            .iter()
            .map(|&b| {
                u8::try_from(b).map_err(|_| {
                    ApiError::bad_request(format!("Decoding failed: byte {} out of range", b))
                })
            })
            .collect()
    }
}

/// POST /api/import - manual record injection for testing without a link.
pub async fn import_message(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ImportPayload>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let can_id = parse_can_id(&payload.id)
        .ok_or_else(|| ApiError::bad_request(format!("Decoding failed: invalid id {:?}", payload.id)))?;

    let data = payload.data_bytes()?;

    let received = Local::now();
    let timestamp = match payload.time {
        Some(millis) => source_time_from_millis(millis, received),
        None => received,
    };

    let record = state.decoder.record(can_id, &data, timestamp, received);

    match serde_json::to_string(&record) {
        Ok(json) => {
            state
                .broker
                .publish(CHANNEL_DECODED, u64::from(record.can_id), Arc::from(json));
        }
        Err(e) => tracing::error!(error = %e, "record serialization failed"),
    }
    state.history.append(record);

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"status": "success"})),
    ))
}

/// Health response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub health: String,
    pub status_code: u16,
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        health: format!("Healthy ({})", state.bus_mode),
        status_code: 200,
    })
}
