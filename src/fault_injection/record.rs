use super::sites::SiteId;
use std::fmt;

/// Default depth of the event ring buffer.
pub const EVENT_LOG_DEPTH: usize = 128;

/// Which decisions end up in the event log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordMode {
    /// Only decisions that fired.
    FiredOnly,
    /// Every decision that passed the enable and mask gates.
    #[default]
    AllDecisions,
}

/// One recorded fault decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiEvent {
    pub ts_ms: u32,
    pub site: SiteId,
    pub fired: bool,
    /// Hit count of the site at evaluation time.
    pub hit: u32,
    /// Opaque diagnostic words supplied by the call site.
    pub extra: u32,
    pub data_peek: u32,
}

impl fmt::Display for FiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>8} ms] {:<18} {} hit={} extra=0x{:08X} peek=0x{:08X}",
            self.ts_ms,
            self.site.to_string(),
            if self.fired { "FIRE" } else { "pass" },
            self.hit,
            self.extra,
            self.data_peek
        )
    }
}

/// Fixed capacity ring buffer of [`FiEvent`]s.
///
/// Once full, every write overwrites the oldest entry.
#[derive(Clone, Debug)]
pub struct EventLog<const N: usize = EVENT_LOG_DEPTH> {
    entries: [Option<FiEvent>; N],
    written: u64,
}

impl<const N: usize> EventLog<N> {
    pub fn new() -> Self {
        Self {
            entries: [None; N],
            written: 0,
        }
    }

    pub(crate) fn push(&mut self, event: FiEvent) {
        if N == 0 {
            return;
        }
        let slot = (self.written % N as u64) as usize;
        self.entries[slot] = Some(event);
        self.written += 1;
    }

    /// Total number of events ever written, including overwritten ones.
    pub fn total_written(&self) -> u64 {
        self.written
    }

    pub fn len(&self) -> usize {
        self.written.min(N as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Iterates from the oldest retained event to the newest.
    pub fn iter(&self) -> impl Iterator<Item = &FiEvent> + '_ {
        let len = self.len();
        let start = if N == 0 {
            0
        } else {
            ((self.written - len as u64) % N as u64) as usize
        };
        (0..len).filter_map(move |offset| self.entries[(start + offset) % N].as_ref())
    }

    pub fn latest(&self) -> Option<&FiEvent> {
        self.iter().last()
    }
}

impl<const N: usize> Default for EventLog<N> {
    fn default() -> Self {
        Self::new()
    }
}
