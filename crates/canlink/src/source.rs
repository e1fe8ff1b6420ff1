// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Simulated CAN source
//!
//! The real CAN adapter lives outside this crate and feeds the same ingest
//! channel. The simulator replaces it on bench setups: ~100 Hz of frames
//! cycling the usual subsystem ids with random payloads, enough to exercise
//! the full pipeline end to end.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};

use crate::codec::{CanFrame, CAN_DATA_LEN};

/// Subsystem ids used by the simulator: VCU, motor controller, BMS, wheels.
pub const SIM_IDS: [u32; 4] = [192, 256, 512, 768];

/// Default inter-frame interval (~100 Hz).
pub const SIM_PERIOD: Duration = Duration::from_millis(10);

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Generate one simulated frame.
pub fn sim_frame() -> CanFrame {
    let can_id = SIM_IDS[fastrand::usize(..SIM_IDS.len())];
    let mut data = [0u8; CAN_DATA_LEN];
    for byte in &mut data {
        *byte = fastrand::u8(..);
    }
    CanFrame::new(now_secs(), can_id, &data)
}

/// Push simulated frames into the ingest channel until shutdown.
pub async fn run_sim_source(
    tx: mpsc::Sender<CanFrame>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(?period, "simulation source running (no CAN hardware)");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tx.send(sim_frame()).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("simulation source stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_frame_shape() {
        for _ in 0..50 {
            let frame = sim_frame();
            assert!(SIM_IDS.contains(&frame.can_id));
            assert!(frame.timestamp > 0.0);
        }
    }

    #[tokio::test]
    async fn test_sim_source_produces_frames() {
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_sim_source(
            tx,
            Duration::from_millis(1),
            shutdown_rx,
        ));

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame produced")
            .expect("channel open");
        assert!(SIM_IDS.contains(&frame.can_id));

        shutdown_tx.send(true).expect("signal shutdown");
        handle.await.expect("source task ends");
    }
}
