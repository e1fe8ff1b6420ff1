// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Server-sent events live tail
//!
//! Adapts a broker subscription to `text/event-stream`: a "connected"
//! comment and a retry advisory up front, then one `can` event per decoded
//! record with the CAN id as the event id. Keep-alive comments cover idle
//! gaps; client disconnect drops the stream and with it the subscription.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};

use canlink::broker::{ChannelMessage, Subscription, CHANNEL_DECODED};

use crate::state::AppState;

/// Retry advisory sent to clients (milliseconds).
const RETRY_MS: u64 = 5000;

/// Maximum idle time between heartbeat comments.
const HEARTBEAT: Duration = Duration::from_secs(15);

/// Frame one broker message as an SSE event.
pub fn record_event(msg: &ChannelMessage) -> Event {
    Event::default()
        .event("can")
        .id(msg.id.to_string())
        .data(msg.payload.as_ref())
}

fn subscription_stream(
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let preamble = stream::iter(vec![
        Ok(Event::default().comment("connected")),
        Ok(Event::default().retry(Duration::from_millis(RETRY_MS))),
    ]);

    let live = stream::unfold(subscription, |mut subscription| async move {
        subscription
            .recv()
            .await
            .map(|msg| (Ok(record_event(&msg)), subscription))
    });

    preamble.chain(live)
}

/// GET /api/stream
pub async fn stream_messages(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broker.subscribe(CHANNEL_DECODED);
    tracing::debug!(id = subscription.id(), "stream client connected");

    Sse::new(subscription_stream(subscription))
        .keep_alive(KeepAlive::new().interval(HEARTBEAT))
}
