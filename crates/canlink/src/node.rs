// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Process wiring for the two link roles
//!
//! The car side runs the batching sender plus the recovery server over the
//! retention ring. The base side runs the receiver, recovery client,
//! decode loop, per-second stats publisher, and the external bus bridge.
//! Every actor owns its state and talks over channels; a single watch
//! signal shuts the whole assembly down.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::broker::{Broker, CHANNEL_CAN_MESSAGES, CHANNEL_DECODED, CHANNEL_STATS};
use crate::bus::BusBackend;
use crate::codec::{Batch, CanFrame};
use crate::config::NodeConfig;
use crate::database::CanDatabase;
use crate::decode::{frame_epoch_millis, FrameDecoder};
use crate::gap::GapTracker;
use crate::history::History;
use crate::receiver::{run_receiver, Receiver};
use crate::recovery::{run_recovery_client, run_recovery_server};
use crate::ring::RetransmitRing;
use crate::sender::run_sender;
use crate::stats::LinkStats;

/// Depth of the receiver -> decoder queue.
const DECODE_QUEUE_DEPTH: usize = 1024;

/// Node startup failures. Bind errors are the only unrecoverable ones.
#[derive(Debug)]
pub enum NodeError {
    Bind {
        what: &'static str,
        addr: String,
        source: String,
    },
    Config(String),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind { what, addr, source } => {
                write!(f, "cannot bind {} on {}: {}", what, addr, source)
            }
            Self::Config(s) => write!(f, "configuration error: {}", s),
        }
    }
}

impl std::error::Error for NodeError {}

/// Create the shutdown signal shared by every actor.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

// ===== Car side =====

/// Run the car side until shutdown: batcher/sender plus recovery server.
///
/// `frames` is the ingest channel fed by the CAN adapter or the simulator.
pub async fn run_car(
    config: &NodeConfig,
    frames: mpsc::Receiver<CanFrame>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), NodeError> {
    let ring = Arc::new(RetransmitRing::new(config.ring_age()));

    let listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
        .await
        .map_err(|e| NodeError::Bind {
            what: "recovery server",
            addr: format!("0.0.0.0:{}", config.tcp_port),
            source: e.to_string(),
        })?;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| NodeError::Bind {
            what: "UDP sender",
            addr: "0.0.0.0:0".to_string(),
            source: e.to_string(),
        })?;

    let peer: SocketAddr = config
        .remote_udp_addr()
        .parse()
        .map_err(|e| NodeError::Config(format!("REMOTE_IP: {}", e)))?;

    tracing::info!(%peer, "car node up");

    let server = run_recovery_server(listener, Arc::clone(&ring), shutdown.clone());
    let sender = run_sender(
        frames,
        socket,
        peer,
        ring,
        config.batch_max,
        config.batch_timeout(),
        shutdown,
    );
    tokio::join!(server, sender);
    Ok(())
}

// ===== Base side =====

/// Running base-station pipeline with the shared state the API serves from.
pub struct BaseNode {
    pub history: Arc<History>,
    pub broker: Arc<Broker>,
    pub decoder: Arc<FrameDecoder>,
    pub stats: Arc<LinkStats>,
    pub tracker: Arc<Mutex<GapTracker>>,
    /// Active external bus binding ("Redis Pub/Sub" or "Named Pipe").
    pub bus_mode: &'static str,
    tasks: Vec<JoinHandle<()>>,
}

impl BaseNode {
    /// Wait for every pipeline task, then end all subscriptions.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "pipeline task panicked");
            }
        }
        self.broker.close();
        tracing::info!("base pipeline stopped");
    }
}

/// Bind and spawn the base-station pipeline.
pub async fn spawn_base(
    config: &NodeConfig,
    database: Option<Arc<dyn CanDatabase>>,
    shutdown: watch::Receiver<bool>,
) -> Result<BaseNode, NodeError> {
    let socket = UdpSocket::bind(("0.0.0.0", config.udp_port))
        .await
        .map_err(|e| NodeError::Bind {
            what: "UDP receiver",
            addr: format!("0.0.0.0:{}", config.udp_port),
            source: e.to_string(),
        })?;

    let tracker = Arc::new(Mutex::new(GapTracker::new(
        config.missing_max,
        config.resync_threshold(),
    )));
    let stats = Arc::new(LinkStats::new());
    let history = Arc::new(History::new(config.history_limit));
    let broker = Broker::new(config.subscriber_queue_max);
    let decoder = Arc::new(FrameDecoder::new(database));

    let (decode_tx, decode_rx) = mpsc::channel(DECODE_QUEUE_DEPTH);

    let bus = BusBackend::connect(&config.redis_url, &config.pipe_path).await;
    let bus_mode = bus.mode();

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(run_receiver(
        socket,
        Receiver::new(Arc::clone(&tracker), Arc::clone(&stats)),
        decode_tx.clone(),
        shutdown.clone(),
    )));

    match config.remote_tcp_addr().parse::<SocketAddr>() {
        Ok(peer) => {
            tasks.push(tokio::spawn(run_recovery_client(
                peer,
                Arc::clone(&tracker),
                decode_tx,
                Arc::clone(&stats),
                config.recovery_period(),
                config.recovery_batch_max,
                shutdown.clone(),
            )));
        }
        Err(e) => {
            // Hostname remotes resolve at connect time elsewhere; here we
            // only take literal addresses and run without recovery if the
            // remote is unresolvable.
            tracing::warn!(remote = %config.remote_tcp_addr(), error = %e,
                "recovery disabled: remote is not a socket address");
            drop(decode_tx);
        }
    }

    tasks.push(tokio::spawn(run_decode_loop(
        decode_rx,
        Arc::clone(&decoder),
        Arc::clone(&history),
        Arc::clone(&broker),
        shutdown.clone(),
    )));

    tasks.push(tokio::spawn(run_stats_publisher(
        Arc::clone(&stats),
        Arc::clone(&broker),
        shutdown.clone(),
    )));

    tasks.push(tokio::spawn(run_bus_bridge(
        bus,
        Arc::clone(&broker),
        config.redis_channel.clone(),
        shutdown,
    )));

    tracing::info!(udp_port = config.udp_port, bus = bus_mode, "base node up");

    Ok(BaseNode {
        history,
        broker,
        decoder,
        stats,
        tracker,
        bus_mode,
        tasks,
    })
}

/// Decode every queued batch into history and the broker channels.
///
/// Runs until the queue closes; on shutdown it drains what is already
/// queued (recovered frames included) before exiting.
pub async fn run_decode_loop(
    mut decode_rx: mpsc::Receiver<Batch>,
    decoder: Arc<FrameDecoder>,
    history: Arc<History>,
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = decode_rx.recv() => {
                match maybe {
                    Some(batch) => decode_batch(&batch, &decoder, &history, &broker),
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                while let Ok(batch) = decode_rx.try_recv() {
                    decode_batch(&batch, &decoder, &history, &broker);
                }
                break;
            }
        }
    }
    tracing::info!("decode loop stopped");
}

fn decode_batch(
    batch: &Batch,
    decoder: &FrameDecoder,
    history: &History,
    broker: &Broker,
) {
    let received = Local::now();
    let mut wire_items = Vec::with_capacity(batch.frames.len());

    for frame in &batch.frames {
        wire_items.push(serde_json::json!({
            "time": frame_epoch_millis(frame.timestamp, received),
            "canId": frame.can_id,
            "data": frame.data,
        }));

        let record = decoder.record_from_frame(frame, received);
        match serde_json::to_string(&record) {
            Ok(payload) => {
                broker.publish(CHANNEL_DECODED, u64::from(record.can_id), Arc::from(payload));
            }
            Err(e) => tracing::error!(error = %e, "record serialization failed"),
        }
        history.append(record);
    }

    match serde_json::to_string(&wire_items) {
        Ok(payload) => {
            broker.publish(CHANNEL_CAN_MESSAGES, batch.sequence, Arc::from(payload));
        }
        Err(e) => tracing::error!(error = %e, "batch serialization failed"),
    }
}

/// Publish link counters once per second (deltas over the interval).
pub async fn run_stats_publisher(
    stats: Arc<LinkStats>,
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs(1);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut interval_id: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = stats.take_interval();
                interval_id += 1;
                match serde_json::to_string(&snapshot) {
                    Ok(payload) => {
                        broker.publish(CHANNEL_STATS, interval_id, Arc::from(payload));
                    }
                    Err(e) => tracing::error!(error = %e, "stats serialization failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("stats publisher stopped");
}

/// Forward broker channels to the external bus backend.
pub async fn run_bus_bridge(
    mut bus: BusBackend,
    broker: Arc<Broker>,
    frames_channel: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut frames_sub = broker.subscribe(CHANNEL_CAN_MESSAGES);
    let mut stats_sub = broker.subscribe(CHANNEL_STATS);

    loop {
        tokio::select! {
            maybe = frames_sub.recv() => {
                let Some(msg) = maybe else { break };
                if let Err(e) = bus.publish(&frames_channel, &msg.payload).await {
                    tracing::debug!(error = %e, "bus publish failed");
                }
            }
            maybe = stats_sub.recv() => {
                let Some(msg) = maybe else { break };
                if let Err(e) = bus.publish(CHANNEL_STATS, &msg.payload).await {
                    tracing::debug!(error = %e, "bus publish failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("bus bridge stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{FilterMode, HistoryQuery};

    #[tokio::test]
    async fn test_decode_loop_appends_and_publishes() {
        let decoder = Arc::new(FrameDecoder::new(None));
        let history = Arc::new(History::new(100));
        let broker = Broker::new(64);
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut decoded_sub = broker.subscribe(CHANNEL_DECODED);
        let mut batch_sub = broker.subscribe(CHANNEL_CAN_MESSAGES);

        let handle = tokio::spawn(run_decode_loop(
            rx,
            decoder,
            Arc::clone(&history),
            Arc::clone(&broker),
            shutdown_rx,
        ));

        let batch = Batch {
            sequence: 3,
            frames: vec![
                CanFrame::new(2.0, 0x10, &[1; 8]),
                CanFrame::new(2.5, 0x20, &[2; 8]),
            ],
        };
        tx.send(batch).await.expect("send");

        let decoded = tokio::time::timeout(Duration::from_secs(2), decoded_sub.recv())
            .await
            .expect("decoded record published")
            .expect("channel open");
        assert_eq!(decoded.id, 0x10);
        let record: serde_json::Value =
            serde_json::from_str(&decoded.payload).expect("record JSON");
        assert_eq!(record["message_name"], "Raw");

        let wire = tokio::time::timeout(Duration::from_secs(2), batch_sub.recv())
            .await
            .expect("batch array published")
            .expect("channel open");
        assert_eq!(wire.id, 3);
        let items: serde_json::Value = serde_json::from_str(&wire.payload).expect("array JSON");
        assert_eq!(items[0]["time"], 2000);
        assert_eq!(items[0]["canId"], 0x10);
        assert_eq!(items[1]["time"], 2500);

        // decode totality: both frames are in history exactly once
        assert_eq!(history.len(), 2);
        let rows = history.query(&HistoryQuery {
            filter_mode: FilterMode::All,
            ..Default::default()
        });
        assert_eq!(rows.len(), 2);

        shutdown_tx.send(true).expect("signal shutdown");
        handle.await.expect("decode loop ends");
    }

    #[tokio::test]
    async fn test_stats_publisher_emits_deltas() {
        let stats = Arc::new(LinkStats::new());
        let broker = Broker::new(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sub = broker.subscribe(CHANNEL_STATS);

        stats.record_received();
        stats.record_received();
        stats.add_missing(1);

        let handle = tokio::spawn(run_stats_publisher(
            Arc::clone(&stats),
            Arc::clone(&broker),
            shutdown_rx,
        ));

        let msg = tokio::time::timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("stats published within a second or so")
            .expect("channel open");
        let value: serde_json::Value = serde_json::from_str(&msg.payload).expect("stats JSON");
        assert_eq!(value["received"], 2);
        assert_eq!(value["missing"], 1);
        assert_eq!(value["recovered"], 0);

        // Counters were drained: the published values are per-interval deltas.
        assert_eq!(stats.snapshot().received, 0);

        shutdown_tx.send(true).expect("signal shutdown");
        handle.await.expect("stats task ends");
    }

    #[tokio::test]
    async fn test_run_car_fails_on_occupied_tcp_port() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = occupied.local_addr().expect("addr").port();

        let config = NodeConfig {
            tcp_port: port,
            ..Default::default()
        };
        let (_tx, frames) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = shutdown_channel();

        let err = run_car(&config, frames, shutdown_rx)
            .await
            .expect_err("occupied port is fatal");
        assert!(matches!(err, NodeError::Bind { .. }));
    }
}
