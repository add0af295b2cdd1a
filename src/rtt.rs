//! Round-trip-time estimation over the system channel's ping/pong exchange.
//!
//! Grounded in `base/rtt.c`: a small ring buffer of in-flight pings keyed by
//! a wrapping 16-bit sequence number, and a fixed-size trailing window of
//! completed samples used to keep a running mean and population variance.
//! The mean/variance are exposed through atomics so a status/metrics read
//! from another thread never has to take the sample-history lock.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Number of outstanding pings tracked at once; older entries are silently
/// overwritten once the sequence space wraps back onto them.
pub const RTT_ENTRIES: usize = 20;

/// The ping sequence counter wraps at this modulus (fits exactly in `u16`).
pub const RTT_SEQ_MOD: u32 = 0x1_0000;

/// Trailing sample count used for the running mean/variance.
pub const RTT_SAMPLE_WINDOW: usize = 10;

#[derive(Clone, Copy)]
struct Entry {
    time: u64,
    sequence: u16,
    valid: bool,
}

impl Entry {
    const EMPTY: Entry = Entry {
        time: 0,
        sequence: 0,
        valid: false,
    };
}

struct Inner {
    entries: [Entry; RTT_ENTRIES],
    next_sequence: u32,
    samples: [i64; RTT_SAMPLE_WINDOW],
    sample_len: usize,
    sample_cursor: usize,
}

pub struct RttCalculator {
    inner: Mutex<Inner>,
    mean_bits: AtomicU64,
    variance_bits: AtomicU64,
}

impl Default for RttCalculator {
    fn default() -> Self {
        RttCalculator::new()
    }
}

impl RttCalculator {
    pub fn new() -> Self {
        RttCalculator {
            inner: Mutex::new(Inner {
                entries: [Entry::EMPTY; RTT_ENTRIES],
                next_sequence: 0,
                samples: [0; RTT_SAMPLE_WINDOW],
                sample_len: 0,
                sample_cursor: 0,
            }),
            mean_bits: AtomicU64::new(0f64.to_bits()),
            variance_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Records that a ping is about to be sent at `time` and returns the
    /// sequence number to stamp it with.
    pub fn next_entry(&self, time: u64) -> u16 {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence as u16;
        inner.next_sequence = (inner.next_sequence + 1) % RTT_SEQ_MOD;

        let index = sequence as usize % RTT_ENTRIES;
        inner.entries[index] = Entry {
            time,
            sequence,
            valid: true,
        };
        sequence
    }

    /// Completes the ping identified by `sequence` with the matching pong's
    /// receive time, folding a new sample into the running mean/variance.
    /// Returns `false` (no-op) for an unknown, already-consumed, or
    /// sequence-mismatched (wrapped past) entry.
    pub fn submit_entry(&self, sequence: u16, recv_time: u64, reply_delta_time: u64) -> bool {
        let mut inner = self.inner.lock();
        let index = sequence as usize % RTT_ENTRIES;
        let entry = &mut inner.entries[index];
        if !entry.valid || entry.sequence != sequence {
            return false;
        }
        let sent_time = entry.time;
        entry.valid = false;

        let value = recv_time as i64 - sent_time as i64 - reply_delta_time as i64;

        let cursor = inner.sample_cursor;
        inner.samples[cursor] = value;
        inner.sample_cursor = (cursor + 1) % RTT_SAMPLE_WINDOW;
        inner.sample_len = (inner.sample_len + 1).min(RTT_SAMPLE_WINDOW);

        let len = inner.sample_len;
        let samples = &inner.samples[..len];
        let sum: i64 = samples.iter().sum();
        let sum_sq: f64 = samples.iter().map(|&v| (v as f64) * (v as f64)).sum();
        let mean = sum as f64 / len as f64;
        let variance = (sum_sq / len as f64) - mean * mean;

        self.mean_bits.store(mean.to_bits(), Ordering::Release);
        self.variance_bits.store(variance.max(0.0).to_bits(), Ordering::Release);
        true
    }

    /// Sent time for a still-outstanding entry, or `None` if it was never
    /// issued, already completed, or overwritten by sequence wraparound.
    pub fn entry_time(&self, sequence: u16) -> Option<u64> {
        let inner = self.inner.lock();
        let index = sequence as usize % RTT_ENTRIES;
        let entry = &inner.entries[index];
        (entry.valid && entry.sequence == sequence).then_some(entry.time)
    }

    pub fn mean(&self) -> f64 {
        f64::from_bits(self.mean_bits.load(Ordering::Acquire))
    }

    pub fn variance(&self) -> f64 {
        f64::from_bits(self.variance_bits.load(Ordering::Acquire))
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_updates_mean() {
        let rtt = RttCalculator::new();
        let sequence = rtt.next_entry(1_000);
        assert_eq!(rtt.entry_time(sequence), Some(1_000));

        assert!(rtt.submit_entry(sequence, 1_050, 0));
        assert_eq!(rtt.mean(), 50.0);
        assert_eq!(rtt.entry_time(sequence), None); // consumed
    }

    #[test]
    fn reply_delta_is_subtracted() {
        let rtt = RttCalculator::new();
        let sequence = rtt.next_entry(1_000);
        rtt.submit_entry(sequence, 1_100, 20);
        assert_eq!(rtt.mean(), 80.0);
    }

    #[test]
    fn unknown_sequence_is_noop() {
        let rtt = RttCalculator::new();
        assert!(!rtt.submit_entry(42, 1_000, 0));
        assert_eq!(rtt.mean(), 0.0);
    }

    #[test]
    fn double_submit_is_rejected() {
        let rtt = RttCalculator::new();
        let sequence = rtt.next_entry(0);
        assert!(rtt.submit_entry(sequence, 10, 0));
        assert!(!rtt.submit_entry(sequence, 20, 0));
    }

    #[test]
    fn sample_window_keeps_only_trailing_entries() {
        let rtt = RttCalculator::new();
        // 10 samples of value 100 ...
        for _ in 0..RTT_SAMPLE_WINDOW {
            let sequence = rtt.next_entry(0);
            rtt.submit_entry(sequence, 100, 0);
        }
        assert_eq!(rtt.mean(), 100.0);
        assert_eq!(rtt.variance(), 0.0);

        // ... then one outlier pushes the oldest sample out of the window.
        let sequence = rtt.next_entry(0);
        rtt.submit_entry(sequence, 1_100, 0);
        assert!(rtt.mean() > 100.0);
    }

    #[test]
    fn sequence_wraparound_reuses_ring_slots() {
        let rtt = RttCalculator::new();
        let first = rtt.next_entry(0);
        // Drive next_sequence all the way around the 16-bit space.
        for _ in 0..(RTT_SEQ_MOD - 1) {
            rtt.next_entry(0);
        }
        let wrapped = rtt.next_entry(0);
        assert_eq!(wrapped, first); // sequence space wrapped back to 0
    }
}
