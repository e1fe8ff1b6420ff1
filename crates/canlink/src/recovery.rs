// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Out-of-band batch recovery over TCP
//!
//! The receiver periodically asks the sender for the batches it missed on
//! the datagram path. One request/response per connection, UTF-8 JSON, no
//! keepalive or pipelining:
//!
//! - request: `{"missing":[u64,...]}` terminated by newline or half-close
//! - response: `[{"seq":u64,"msgs":[{"t":f64,"id":u32,"d":"<16 hex>"}]}]`
//!   terminated by newline and connection close
//!
//! Recovery is best-effort: any failure leaves the missing set intact for
//! the next cycle. Sequences past the ring horizon are simply omitted from
//! the response and stay missing until evicted.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::codec::{Batch, CanFrame};
use crate::gap::GapTracker;
use crate::ring::RetransmitRing;
use crate::stats::LinkStats;

/// Cap on a single request body; a full request is ~1 KB.
const MAX_REQUEST_LEN: u64 = 64 * 1024;

/// Cap on a single response body.
const MAX_RESPONSE_LEN: u64 = 4 * 1024 * 1024;

/// Round-trip budget for one recovery cycle.
const RECOVERY_RTT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long in-flight connections may drain after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Resend request sent by the receiver side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub missing: Vec<u64>,
}

/// One recovered batch in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveredBatch {
    pub seq: u64,
    pub msgs: Vec<WireFrame>,
}

/// Text-safe frame encoding for the recovery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub t: f64,
    pub id: u32,
    pub d: String,
}

impl WireFrame {
    pub fn from_frame(frame: &CanFrame) -> Self {
        Self {
            t: frame.timestamp,
            id: frame.can_id,
            d: hex::encode(frame.data),
        }
    }

    pub fn to_frame(&self) -> Option<CanFrame> {
        let bytes = hex::decode(&self.d).ok()?;
        if bytes.len() != crate::codec::CAN_DATA_LEN {
            return None;
        }
        Some(CanFrame::new(self.t, self.id, &bytes))
    }
}

/// Recovery channel failures (all retried on the next cycle).
#[derive(Debug)]
pub enum RecoveryError {
    Io(String),
    Timeout,
    Protocol(String),
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Timeout => write!(f, "round trip timed out"),
            Self::Protocol(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl std::error::Error for RecoveryError {}

impl From<std::io::Error> for RecoveryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ===== Server (sender side) =====

/// Serve ring lookups until shutdown, then drain in-flight connections.
pub async fn run_recovery_server(
    listener: TcpListener,
    ring: Arc<RetransmitRing>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "recovery server listening");
    }

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let ring = Arc::clone(&ring);
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(stream, &ring).await {
                                tracing::debug!(%peer, error = %e, "recovery connection failed");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "recovery accept error"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("recovery connections still draining at grace expiry");
    }
    tracing::info!("recovery server stopped");
}

async fn serve_connection(stream: TcpStream, ring: &RetransmitRing) -> Result<(), RecoveryError> {
    let (read_half, mut write_half) = stream.into_split();

    let mut request_buf = Vec::new();
    let mut reader = BufReader::new(read_half).take(MAX_REQUEST_LEN);
    reader.read_until(b'\n', &mut request_buf).await?;

    let request: RecoveryRequest = serde_json::from_slice(&request_buf)
        .map_err(|e| RecoveryError::Protocol(e.to_string()))?;

    let mut response = Vec::with_capacity(request.missing.len());
    for seq in &request.missing {
        // Aged-out sequences are omitted; the client gives up on them.
        if let Some(batch) = ring.lookup(*seq) {
            response.push(RecoveredBatch {
                seq: *seq,
                msgs: batch.frames.iter().map(WireFrame::from_frame).collect(),
            });
        }
    }

    tracing::debug!(
        requested = request.missing.len(),
        served = response.len(),
        "resend request"
    );

    let mut body =
        serde_json::to_vec(&response).map_err(|e| RecoveryError::Protocol(e.to_string()))?;
    body.push(b'\n');
    write_half.write_all(&body).await?;
    write_half.shutdown().await?;
    Ok(())
}

// ===== Client (receiver side) =====

/// Periodically request missing batches and inject recovered frames into
/// the decode queue.
pub async fn run_recovery_client(
    peer: SocketAddr,
    tracker: Arc<Mutex<GapTracker>>,
    decode_tx: mpsc::Sender<Batch>,
    stats: Arc<LinkStats>,
    period: Duration,
    request_max: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(%peer, ?period, "recovery client running");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let wanted = lock_tracker(&tracker).missing_tail(request_max);
                if wanted.is_empty() {
                    continue;
                }
                tracing::debug!(count = wanted.len(), "requesting resend");
                match fetch(peer, &wanted).await {
                    Ok(batches) => {
                        inject(batches, &tracker, &decode_tx, &stats).await;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "recovery cycle failed, will retry");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("recovery client stopped");
}

/// One request/response round trip.
pub async fn fetch(peer: SocketAddr, missing: &[u64]) -> Result<Vec<RecoveredBatch>, RecoveryError> {
    let round_trip = async {
        let mut stream = TcpStream::connect(peer).await?;

        let mut body = serde_json::to_vec(&RecoveryRequest {
            missing: missing.to_vec(),
        })
        .map_err(|e| RecoveryError::Protocol(e.to_string()))?;
        body.push(b'\n');
        stream.write_all(&body).await?;

        let mut response_buf = Vec::new();
        let mut reader = BufReader::new(stream).take(MAX_RESPONSE_LEN);
        reader.read_until(b'\n', &mut response_buf).await?;

        serde_json::from_slice(&response_buf).map_err(|e| RecoveryError::Protocol(e.to_string()))
    };

    match tokio::time::timeout(RECOVERY_RTT_TIMEOUT, round_trip).await {
        Ok(result) => result,
        Err(_) => Err(RecoveryError::Timeout),
    }
}

async fn inject(
    batches: Vec<RecoveredBatch>,
    tracker: &Arc<Mutex<GapTracker>>,
    decode_tx: &mpsc::Sender<Batch>,
    stats: &LinkStats,
) {
    for recovered in batches {
        // Stale replies (already filled by a reordered datagram) are ignored.
        if !lock_tracker(tracker).mark_recovered(recovered.seq) {
            continue;
        }
        stats.record_recovered();

        let frames: Vec<CanFrame> = recovered
            .msgs
            .iter()
            .filter_map(|m| {
                let frame = m.to_frame();
                if frame.is_none() {
                    tracing::warn!(seq = recovered.seq, "bad hex payload in recovery reply");
                }
                frame
            })
            .collect();

        tracing::debug!(seq = recovered.seq, frames = frames.len(), "batch recovered");
        if decode_tx
            .send(Batch {
                sequence: recovered.seq,
                frames,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

fn lock_tracker(tracker: &Arc<Mutex<GapTracker>>) -> std::sync::MutexGuard<'_, GapTracker> {
    match tracker.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::debug!("gap tracker lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
