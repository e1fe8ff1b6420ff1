// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Shared state behind the base-station HTTP API.

use std::sync::Arc;

use canlink::broker::Broker;
use canlink::decode::FrameDecoder;
use canlink::history::History;

/// Everything the handlers need, cloned per request via `Arc`.
pub struct AppState {
    pub history: Arc<History>,
    pub broker: Arc<Broker>,
    pub decoder: Arc<FrameDecoder>,
    /// Active external bus binding, surfaced by `/health`.
    pub bus_mode: &'static str,
}
