// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Car-side batching sender
//!
//! Frames from the CAN source are grouped into batches of at most
//! `batch_max`, or whatever accumulated when `batch_timeout` elapses since
//! the last emission attempt. Each batch gets the next sequence number,
//! goes out as one UDP datagram, and is retained in the retransmission ring
//! whether or not the send succeeded (the receiver can still recover it).
//!
//! Send failures are transient on a moving vehicle and never fatal; the
//! source channel closing leaves the sender idle until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::codec::{Batch, CanFrame};
use crate::ring::RetransmitRing;

/// Pure batching state machine: admission order in, sequenced batches out.
///
/// Sequences start at 1 and are never reused; a batch with sequence S holds
/// exactly the frames admitted between the emissions of S-1 and S.
#[derive(Debug)]
pub struct Batcher {
    pending: Vec<CanFrame>,
    next_seq: u64,
    batch_max: usize,
}

impl Batcher {
    pub fn new(batch_max: usize) -> Self {
        Self {
            pending: Vec::with_capacity(batch_max),
            next_seq: 1,
            batch_max: batch_max.max(1),
        }
    }

    /// Admit one frame; returns a batch when the size threshold is reached.
    pub fn push(&mut self, frame: CanFrame) -> Option<Batch> {
        self.pending.push(frame);
        (self.pending.len() >= self.batch_max).then(|| self.emit())
    }

    /// Emit whatever is pending, if anything (timeout and shutdown path).
    pub fn flush(&mut self) -> Option<Batch> {
        (!self.pending.is_empty()).then(|| self.emit())
    }

    fn emit(&mut self) -> Batch {
        let sequence = self.next_seq;
        self.next_seq += 1;
        Batch {
            sequence,
            frames: std::mem::take(&mut self.pending),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sequence the next emitted batch will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq
    }
}

/// Run the sender until shutdown, draining `frames` into datagrams.
pub async fn run_sender(
    mut frames: mpsc::Receiver<CanFrame>,
    socket: UdpSocket,
    peer: SocketAddr,
    ring: Arc<RetransmitRing>,
    batch_max: usize,
    batch_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batcher = Batcher::new(batch_max);
    let mut deadline = tokio::time::Instant::now() + batch_timeout;
    let mut source_open = true;

    tracing::info!(%peer, batch_max, ?batch_timeout, "sender running");

    loop {
        tokio::select! {
            maybe = frames.recv(), if source_open => {
                match maybe {
                    Some(frame) => {
                        if let Some(batch) = batcher.push(frame) {
                            emit(&socket, peer, &ring, batch).await;
                            deadline = tokio::time::Instant::now() + batch_timeout;
                        }
                    }
                    None => {
                        tracing::warn!("frame source closed, sender idling");
                        source_open = false;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if let Some(batch) = batcher.flush() {
                    emit(&socket, peer, &ring, batch).await;
                }
                deadline = tokio::time::Instant::now() + batch_timeout;
            }
            _ = shutdown.changed() => {
                if let Some(batch) = batcher.flush() {
                    emit(&socket, peer, &ring, batch).await;
                }
                break;
            }
        }
    }

    tracing::info!(
        last_sequence = batcher.next_sequence() - 1,
        "sender stopped"
    );
}

async fn emit(socket: &UdpSocket, peer: SocketAddr, ring: &RetransmitRing, batch: Batch) {
    let wire = batch.encode();
    if let Err(e) = socket.send_to(&wire, peer).await {
        // Link drops are routine on the radio; recovery covers the gap.
        tracing::debug!(sequence = batch.sequence, error = %e, "UDP send failed");
    }
    ring.retain(batch);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(i: u32) -> CanFrame {
        CanFrame::new(f64::from(i), i, &[i as u8; 8])
    }

    #[test]
    fn test_batcher_emits_at_threshold() {
        let mut batcher = Batcher::new(3);
        assert!(batcher.push(frame(1)).is_none());
        assert!(batcher.push(frame(2)).is_none());

        let batch = batcher.push(frame(3)).expect("threshold reached");
        assert_eq!(batch.sequence, 1);
        assert_eq!(batch.frames.len(), 3);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[test]
    fn test_batcher_sequences_are_contiguous_from_one() {
        let mut batcher = Batcher::new(1);
        let seqs: Vec<u64> = (0..5)
            .map(|i| batcher.push(frame(i)).expect("batch_max 1 emits").sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_batcher_flush_partial() {
        let mut batcher = Batcher::new(20);
        batcher.push(frame(1));
        batcher.push(frame(2));

        let batch = batcher.flush().expect("pending frames flush");
        assert_eq!(batch.sequence, 1);
        assert_eq!(batch.frames.len(), 2);
        assert!(batcher.flush().is_none(), "empty flush emits nothing");
        assert_eq!(batcher.next_sequence(), 2, "empty flush burns no sequence");
    }

    #[test]
    fn test_batcher_preserves_admission_order() {
        let mut batcher = Batcher::new(4);
        for i in [7u32, 3, 9, 1] {
            batcher.push(frame(i));
        }
        let batch = batcher.flush().expect("flush");
        let ids: Vec<u32> = batch.frames.iter().map(|f| f.can_id).collect();
        assert_eq!(ids, vec![7, 3, 9, 1]);
    }

    #[tokio::test]
    async fn test_run_sender_batch_timeout() {
        // 5 frames, batch_max 20: exactly one datagram after the timeout.
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let peer = receiver.local_addr().expect("addr");
        let sender_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");

        let ring = Arc::new(RetransmitRing::new(Duration::from_secs(60)));
        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_sender(
            rx,
            sender_socket,
            peer,
            Arc::clone(&ring),
            20,
            Duration::from_millis(50),
            shutdown_rx,
        ));

        for i in 0..5 {
            tx.send(frame(i)).await.expect("send");
        }

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("datagram arrives within timeout window")
            .expect("recv");

        let batch = Batch::decode(&buf[..len]).expect("valid datagram");
        assert_eq!(batch.sequence, 1);
        assert_eq!(batch.frames.len(), 5);

        // Nothing further pending: no second datagram shortly after.
        let quiet =
            tokio::time::timeout(Duration::from_millis(120), receiver.recv_from(&mut buf)).await;
        assert!(quiet.is_err(), "no extra datagram without new frames");

        assert!(ring.lookup(1).is_some(), "emitted batch retained in ring");

        shutdown_tx.send(true).expect("signal shutdown");
        handle.await.expect("sender task ends");
    }

    #[tokio::test]
    async fn test_run_sender_flushes_on_shutdown() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let peer = receiver.local_addr().expect("addr");
        let sender_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");

        let ring = Arc::new(RetransmitRing::new(Duration::from_secs(60)));
        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_sender(
            rx,
            sender_socket,
            peer,
            Arc::clone(&ring),
            20,
            Duration::from_secs(3600), // timeout never fires in this test
            shutdown_rx,
        ));

        tx.send(frame(9)).await.expect("send");
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("signal shutdown");

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("final flush arrives")
            .expect("recv");
        let batch = Batch::decode(&buf[..len]).expect("valid datagram");
        assert_eq!(batch.frames.len(), 1);
        assert_eq!(batch.frames[0].can_id, 9);

        handle.await.expect("sender task ends");
    }
}
