// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Link counters published on the `system_stats` channel
//!
//! Counters accumulate between publishes; the stats task drains them once
//! per second, so the published values are deltas over that second.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Shared counters for the receiving side of the link.
#[derive(Debug, Default)]
pub struct LinkStats {
    received: AtomicU64,
    missing: AtomicU64,
    recovered: AtomicU64,
    malformed: AtomicU64,
    discarded: AtomicU64,
}

/// One interval's worth of counters, as published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub missing: u64,
    pub recovered: u64,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// One datagram accepted off the wire.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// `n` sequences newly detected as missing.
    pub fn add_missing(&self, n: u64) {
        self.missing.fetch_add(n, Ordering::Relaxed);
    }

    /// One batch recovered over the retransmission channel.
    pub fn record_recovered(&self) {
        self.recovered.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed datagram dropped before sequencing.
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Duplicate or unrecoverably late datagram dropped after sequencing.
    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the published counters, returning the delta since the last call.
    pub fn take_interval(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.swap(0, Ordering::Relaxed),
            missing: self.missing.swap(0, Ordering::Relaxed),
            recovered: self.recovered.swap(0, Ordering::Relaxed),
        }
    }

    /// Non-destructive view of the published counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn discarded_total(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}
