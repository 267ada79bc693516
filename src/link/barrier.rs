//! Validation barriers for decoded avionics words.
//!
//! Barriers run in a fixed order and the first rejection wins:
//! parity, then plausibility (allow-list and per-label rate limit).

use super::arinc::{has_odd_parity, label};
use log::debug;

/// Default minimum gap between two accepted words with the same label (50 Hz).
pub const DEFAULT_MIN_INTERVAL_MS: u32 = 20;

/// Outcome of the barrier chain for one word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    BadParity,
    /// Label is not on the allow-list.
    LabelNotAllowed(u8),
    /// Label arrived before its minimum interval elapsed.
    RateLimited(u8),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct LabelRecord {
    allowed: bool,
    /// Time of the last accepted occurrence, `None` before the first one.
    last_accepted_ms: Option<u32>,
}

/// Per-label allow-list and rate limiter.
#[derive(Clone, Debug)]
pub struct Plausibility {
    labels: [LabelRecord; 256],
    min_interval_ms: u32,
}

impl Plausibility {
    /// Creates a table with an empty allow-list.
    pub fn new(min_interval_ms: u32) -> Self {
        Self {
            labels: [LabelRecord::default(); 256],
            min_interval_ms,
        }
    }

    /// Creates a table allowing `labels`.
    pub fn with_allowed(min_interval_ms: u32, labels: &[u8]) -> Self {
        let mut table = Self::new(min_interval_ms);
        for label in labels {
            table.allow(*label);
        }
        table
    }

    pub fn allow(&mut self, label: u8) {
        self.labels[label as usize].allowed = true;
    }

    pub fn deny(&mut self, label: u8) {
        self.labels[label as usize].allowed = false;
    }

    pub fn is_allowed(&self, label: u8) -> bool {
        self.labels[label as usize].allowed
    }

    pub fn min_interval_ms(&self) -> u32 {
        self.min_interval_ms
    }

    pub fn last_accepted_ms(&self, label: u8) -> Option<u32> {
        self.labels[label as usize].last_accepted_ms
    }

    /// Checks `label` at `now_ms` and records it when accepted.
    ///
    /// Intervals use wrapping subtraction so clock wrap-around is tolerated.
    pub fn check(&mut self, label: u8, now_ms: u32) -> Verdict {
        let record = &mut self.labels[label as usize];
        if !record.allowed {
            return Verdict::LabelNotAllowed(label);
        }
        if let Some(last) = record.last_accepted_ms {
            if now_ms.wrapping_sub(last) < self.min_interval_ms {
                return Verdict::RateLimited(label);
            }
        }
        record.last_accepted_ms = Some(now_ms);
        Verdict::Accepted
    }
}

/// Ordered chain of acceptance tests.
#[derive(Clone, Debug)]
pub struct BarrierChain {
    plausibility: Plausibility,
}

impl BarrierChain {
    pub fn new(plausibility: Plausibility) -> Self {
        Self { plausibility }
    }

    pub fn plausibility(&self) -> &Plausibility {
        &self.plausibility
    }

    pub fn plausibility_mut(&mut self) -> &mut Plausibility {
        &mut self.plausibility
    }

    /// Classifies a word that already passed the codec.
    pub fn evaluate(&mut self, word: u32, now_ms: u32) -> Verdict {
        if !has_odd_parity(word) {
            debug!("Parity barrier rejected 0x{:08X}", word);
            return Verdict::BadParity;
        }
        let verdict = self.plausibility.check(label(word), now_ms);
        if verdict != Verdict::Accepted {
            debug!("Plausibility barrier rejected 0x{:08X}: {:?}", word, verdict);
        }
        verdict
    }
}
