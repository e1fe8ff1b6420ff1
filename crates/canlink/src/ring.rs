// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Sender-side retention ring for batch retransmission
//!
//! Thread-safe store of recently sent batches, keyed by sequence, used
//! solely by the recovery server. The only retention criterion is age:
//! entries older than `max_age` are swept regardless of how fast sequence
//! numbers grow, so the ring stays bounded by `max_age x batch rate`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::codec::{Batch, CanFrame};

#[derive(Debug)]
struct RingEntry {
    sequence: u64,
    frames: Vec<CanFrame>,
    inserted_at: Instant,
}

/// Age-bounded retention store for sent batches.
pub struct RetransmitRing {
    entries: Mutex<VecDeque<RingEntry>>,
    max_age: Duration,
}

impl RetransmitRing {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_age,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RingEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::debug!("ring lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Insert a sent batch and sweep aged-out entries.
    ///
    /// Sequences arrive monotonically from the sender, so the deque stays
    /// sorted by construction.
    pub fn retain(&self, batch: Batch) {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.push_back(RingEntry {
            sequence: batch.sequence,
            frames: batch.frames,
            inserted_at: now,
        });
        Self::sweep_front(&mut entries, now, self.max_age);
    }

    /// Look up a retained batch by sequence. O(log n) over the sorted deque.
    pub fn lookup(&self, sequence: u64) -> Option<Batch> {
        let entries = self.lock();
        let idx = entries
            .binary_search_by_key(&sequence, |e| e.sequence)
            .ok()?;
        entries.get(idx).map(|entry| Batch {
            sequence: entry.sequence,
            frames: entry.frames.clone(),
        })
    }

    /// Evict all entries older than `max_age`.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.lock();
        Self::sweep_front(&mut entries, now, self.max_age);
    }

    fn sweep_front(entries: &mut VecDeque<RingEntry>, now: Instant, max_age: Duration) {
        let mut evicted = 0usize;
        while let Some(front) = entries.front() {
            if now.duration_since(front.inserted_at) > max_age {
                entries.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, remaining = entries.len(), "ring sweep");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn oldest_sequence(&self) -> Option<u64> {
        self.lock().front().map(|e| e.sequence)
    }

    pub fn newest_sequence(&self) -> Option<u64> {
        self.lock().back().map(|e| e.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(sequence: u64, n: usize) -> Batch {
        let frames = (0..n)
            .map(|i| CanFrame::new(sequence as f64, 0x100 + i as u32, &[i as u8; 8]))
            .collect();
        Batch { sequence, frames }
    }

    #[test]
    fn test_retain_lookup_identical_frames() {
        let ring = RetransmitRing::new(Duration::from_secs(60));
        let original = batch(4, 3);
        ring.retain(original.clone());

        let looked_up = ring.lookup(4).expect("retained batch is found");
        assert_eq!(looked_up, original);
        assert_eq!(ring.lookup(5), None);
    }

    #[test]
    fn test_lookup_across_many_entries() {
        let ring = RetransmitRing::new(Duration::from_secs(60));
        for seq in 1..=50 {
            ring.retain(batch(seq, 1));
        }
        assert_eq!(ring.len(), 50);
        assert_eq!(ring.oldest_sequence(), Some(1));
        assert_eq!(ring.newest_sequence(), Some(50));
        assert!(ring.lookup(1).is_some());
        assert!(ring.lookup(25).is_some());
        assert!(ring.lookup(50).is_some());
        assert!(ring.lookup(51).is_none());
    }

    #[test]
    fn test_sweep_evicts_only_aged_entries() {
        let ring = RetransmitRing::new(Duration::from_millis(40));
        ring.retain(batch(1, 1));
        std::thread::sleep(Duration::from_millis(60));
        ring.retain(batch(2, 1));

        // retain() already swept: entry 1 exceeded max_age.
        assert_eq!(ring.lookup(1), None);
        assert!(ring.lookup(2).is_some());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_zero_age_ring_retains_nothing_after_sweep() {
        let ring = RetransmitRing::new(Duration::ZERO);
        ring.retain(batch(1, 1));
        std::thread::sleep(Duration::from_millis(5));
        ring.sweep();
        assert!(ring.is_empty());
        assert_eq!(ring.lookup(1), None);
    }

    #[test]
    fn test_age_is_the_only_retention_criterion() {
        let ring = RetransmitRing::new(Duration::from_secs(60));
        for seq in 1..=500 {
            ring.retain(batch(seq, 1));
        }
        // Nothing aged out; growth in sequence alone evicts nothing.
        assert_eq!(ring.len(), 500);
    }
}
