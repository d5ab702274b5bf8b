//! Per-connection bookkeeping behind the UDP transport's reliable delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::datagram::sequence_greater_than;

/// Smoothed round-trip time in milliseconds. Starts from a typical internet
/// path until the first ack arrives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttEstimate {
    pub smoothed_ms: f32,
    pub variance_ms: f32,
}

impl Default for RttEstimate {
    fn default() -> Self {
        Self {
            smoothed_ms: 100.0,
            variance_ms: 50.0,
        }
    }
}

impl RttEstimate {
    fn sample(&mut self, rtt: Duration) {
        const GAIN: f32 = 0.125;
        const VARIANCE_GAIN: f32 = 0.25;

        let rtt = rtt.as_secs_f32() * 1000.0;
        let deviation = (rtt - self.smoothed_ms).abs();
        self.variance_ms += VARIANCE_GAIN * (deviation - self.variance_ms);
        self.smoothed_ms += GAIN * (rtt - self.smoothed_ms);
    }
}

/// Datagrams sent and not yet acknowledged, with the reliable frame each one
/// carried. The oldest entries are forgotten once `capacity` is reached.
#[derive(Debug)]
pub struct SentLedger {
    sent: HashMap<u32, (Instant, Option<u32>)>,
    order: VecDeque<u32>,
    capacity: usize,
    rtt: RttEstimate,
}

impl SentLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            sent: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            rtt: RttEstimate::default(),
        }
    }

    pub fn record(&mut self, sequence: u32, reliable_id: Option<u32>) {
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.sent.remove(&oldest);
            }
        }
        self.order.push_back(sequence);
        self.sent.insert(sequence, (Instant::now(), reliable_id));
    }

    /// Retires `ack` and every earlier sequence flagged in `bitfield` (bit n
    /// stands for `ack - n - 1`). Returns the reliable frames now delivered.
    pub fn acknowledge(&mut self, ack: u32, bitfield: u32) -> Vec<u32> {
        let now = Instant::now();
        let covered = std::iter::once(ack).chain(
            (1..=32u32)
                .filter(|bit| bitfield & (1 << (bit - 1)) != 0)
                .map(|bit| ack.wrapping_sub(bit)),
        );

        let mut delivered = Vec::new();
        for sequence in covered {
            if let Some((sent_at, reliable_id)) = self.sent.remove(&sequence) {
                self.rtt.sample(now.duration_since(sent_at));
                delivered.extend(reliable_id);
            }
        }
        self.order.retain(|sequence| self.sent.contains_key(sequence));
        delivered
    }

    pub fn rtt(&self) -> RttEstimate {
        self.rtt
    }

    pub fn outstanding(&self) -> usize {
        self.sent.len()
    }
}

/// Receive side of the ack scheme: the newest sequence seen plus one bit for
/// each of the 32 sequences before it.
#[derive(Debug, Default)]
pub struct AckWindow {
    latest: Option<u32>,
    bits: u32,
}

impl AckWindow {
    /// False for a sequence already inside the window. Sequences older than
    /// the window cannot be checked and are let through.
    pub fn record(&mut self, sequence: u32) -> bool {
        let Some(latest) = self.latest else {
            self.latest = Some(sequence);
            return true;
        };
        if sequence == latest {
            return false;
        }

        if sequence_greater_than(sequence, latest) {
            let shift = sequence.wrapping_sub(latest);
            self.bits = if shift > 32 {
                0
            } else {
                ((u64::from(self.bits) << shift) | (1u64 << (shift - 1))) as u32
            };
            self.latest = Some(sequence);
            return true;
        }

        let age = latest.wrapping_sub(sequence);
        if age > 32 {
            return true;
        }
        let mask = 1 << (age - 1);
        let fresh = self.bits & mask == 0;
        self.bits |= mask;
        fresh
    }

    pub fn ack_fields(&self) -> (u32, u32) {
        (self.latest.unwrap_or(0), self.bits)
    }
}

/// Recently delivered reliable frame ids, so resends are not delivered twice.
#[derive(Debug)]
pub struct DuplicateFilter {
    seen: HashSet<u32>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl DuplicateFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn first_sighting(&mut self, id: u32) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}
