// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Base-side datagram receiver
//!
//! Parses incoming datagrams, runs them through the gap tracker, and
//! forwards deliverable batches to the decode queue in wire-arrival order.
//! Malformed datagrams and duplicates are dropped and counted; they are
//! never fatal.

use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::codec::Batch;
use crate::gap::{GapTracker, Observation};
use crate::stats::LinkStats;

/// Datagram admission logic, separated from socket I/O for testability.
pub struct Receiver {
    tracker: Arc<Mutex<GapTracker>>,
    stats: Arc<LinkStats>,
}

impl Receiver {
    pub fn new(tracker: Arc<Mutex<GapTracker>>, stats: Arc<LinkStats>) -> Self {
        Self { tracker, stats }
    }

    /// Process one datagram. Returns the batch when its frames should be
    /// forwarded downstream, `None` when it was dropped.
    pub fn accept(&self, datagram: &[u8]) -> Option<Batch> {
        let batch = match Batch::decode(datagram) {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.record_malformed();
                tracing::debug!(error = %e, "dropping malformed datagram");
                return None;
            }
        };

        self.stats.record_received();

        let observation = {
            let mut tracker = match self.tracker.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::debug!("gap tracker lock poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            tracker.observe(batch.sequence)
        };

        match observation {
            Observation::Anchored => {
                tracing::info!(sequence = batch.sequence, "link anchored");
            }
            Observation::Gap { opened } => {
                self.stats.add_missing(opened);
                tracing::debug!(sequence = batch.sequence, opened, "gap detected");
            }
            Observation::Resync => {
                tracing::warn!(sequence = batch.sequence, "link resynchronized");
            }
            Observation::Filled => {
                tracing::debug!(sequence = batch.sequence, "gap filled by reordered datagram");
            }
            Observation::Duplicate | Observation::Late => {
                self.stats.record_discarded();
            }
            Observation::InOrder => {}
        }

        observation.deliver().then_some(batch)
    }
}

/// Run the receive loop until shutdown or the decode queue closes.
pub async fn run_receiver(
    socket: UdpSocket,
    receiver: Receiver,
    decode_tx: mpsc::Sender<Batch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 2048];

    if let Ok(addr) = socket.local_addr() {
        tracing::info!(%addr, "receiver listening");
    }

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let len = match result {
                    Ok((len, _peer)) => len,
                    Err(e) => {
                        tracing::debug!(error = %e, "UDP receive error");
                        continue;
                    }
                };
                if let Some(batch) = receiver.accept(&buf[..len]) {
                    if decode_tx.send(batch).await.is_err() {
                        tracing::warn!("decode queue closed, receiver stopping");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("receiver stopped");
}
