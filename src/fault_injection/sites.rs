use super::EngineError;
use std::fmt;

/// Number of fault injection sites.
pub const SITE_COUNT: usize = 7;

/// Fault injection points of the link.
///
/// The ordinal of a site is also its bit in the engine feature mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SiteId {
    /// Bit flips on received bytes before they reach the parser.
    RxCorrupt = 0,
    /// Label substitution on transmitted avionics words.
    LabelTamper = 1,
    /// Forced bad parity on transmitted avionics words.
    ParityTamper = 2,
    /// Transmit API reports busy without touching the transport.
    TxApiFail = 3,
    /// Transfer completion is lost, the stall monitor has to recover.
    TxStall = 4,
    /// Burst noise on outbound word frames.
    TxNoise = 5,
    /// Memory bit flips on outbound telemetry frames.
    MemBitFlip = 6,
}

/// All sites in ordinal order.
pub const ALL_SITES: [SiteId; SITE_COUNT] = [
    SiteId::RxCorrupt,
    SiteId::LabelTamper,
    SiteId::ParityTamper,
    SiteId::TxApiFail,
    SiteId::TxStall,
    SiteId::TxNoise,
    SiteId::MemBitFlip,
];

impl SiteId {
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit of this site in the engine feature mask.
    pub fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Short name used by the control surface.
    pub fn cli_name(self) -> &'static str {
        match self {
            SiteId::RxCorrupt => "rx",
            SiteId::LabelTamper => "label",
            SiteId::ParityTamper => "parity",
            SiteId::TxApiFail => "txbusy",
            SiteId::TxStall => "txstall",
            SiteId::TxNoise => "noise",
            SiteId::MemBitFlip => "mem",
        }
    }

    /// Look up a site by its control name or its upper case log name.
    pub fn from_name(input: &str) -> Result<Self, EngineError> {
        ALL_SITES
            .iter()
            .copied()
            .find(|site| {
                site.cli_name().eq_ignore_ascii_case(input) || site.to_string() == input
            })
            .ok_or_else(|| EngineError::UnknownSite(input.to_string()))
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SiteId::RxCorrupt => "RX_CORRUPT",
            SiteId::LabelTamper => "A429_LABEL_TAMPER",
            SiteId::ParityTamper => "A429_PARITY_TAMPER",
            SiteId::TxApiFail => "TX_API_FAIL",
            SiteId::TxStall => "TX_STALL",
            SiteId::TxNoise => "TX_NOISE",
            SiteId::MemBitFlip => "MEM_BITFLIP",
        };
        f.write_str(name)
    }
}

/// How an every-N policy behaves once its hit count reaches N.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Eligible on the N-th hit only, then spent until rearmed.
    #[default]
    OneShot,
    /// Eligible whenever `hit_count % n == 0`.
    Repeating,
}

/// Quantity a window policy is compared against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowBasis {
    #[default]
    Hits,
    Millis,
}

/// Arming policy of a site.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    #[default]
    Disabled,
    EveryN { n: u32, trigger: Trigger },
    /// Half open window `[start, end)`.
    Window {
        start: u32,
        end: u32,
        basis: WindowBasis,
    },
}

impl Policy {
    pub fn validate(&self) -> Result<(), EngineError> {
        match *self {
            Policy::EveryN { n: 0, .. } => Err(EngineError::ZeroInterval),
            Policy::Window { start, end, .. } if end < start => {
                Err(EngineError::InvertedWindow { start, end })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Disabled => write!(f, "disabled"),
            Policy::EveryN { n, trigger } => match trigger {
                Trigger::OneShot => write!(f, "every {n} (one-shot)"),
                Trigger::Repeating => write!(f, "every {n} (repeating)"),
            },
            Policy::Window { start, end, basis } => match basis {
                WindowBasis::Hits => write!(f, "window [{start},{end}) hits"),
                WindowBasis::Millis => write!(f, "window [{start},{end}) ms"),
            },
        }
    }
}

/// Snapshot of the counters of one site.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SiteCounters {
    pub hit: u32,
    pub fire: u32,
}

/// Configuration and counters of one site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SiteState {
    pub policy: Policy,
    pub hit_count: u32,
    pub fire_count: u32,
    /// Number of bits flipped per corrupted byte.
    pub bits_to_flip: u8,
    /// One-shot policy already consumed its single eligible hit.
    spent: bool,
}

impl Default for SiteState {
    fn default() -> Self {
        Self {
            policy: Policy::Disabled,
            hit_count: 0,
            fire_count: 0,
            bits_to_flip: 1,
            spent: false,
        }
    }
}

impl SiteState {
    /// Records a hit and tells whether the policy makes this hit eligible.
    ///
    /// `now_ms` is only consulted by millisecond windows.
    pub(crate) fn register_hit(&mut self, now_ms: u32) -> bool {
        self.hit_count = self.hit_count.wrapping_add(1);
        match self.policy {
            Policy::Disabled => false,
            Policy::EveryN { n, trigger } => {
                if n == 0 {
                    return false;
                }
                match trigger {
                    Trigger::OneShot => {
                        if self.spent || self.hit_count != n {
                            return false;
                        }
                        self.spent = true;
                        true
                    }
                    Trigger::Repeating => self.hit_count % n == 0,
                }
            }
            Policy::Window { start, end, basis } => {
                let value = match basis {
                    WindowBasis::Hits => self.hit_count,
                    WindowBasis::Millis => now_ms,
                };
                value >= start && value < end
            }
        }
    }

    pub fn counters(&self) -> SiteCounters {
        SiteCounters {
            hit: self.hit_count,
            fire: self.fire_count,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }
}

/// Fixed table of all sites, indexed by [`SiteId`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiteTable {
    sites: [SiteState; SITE_COUNT],
}

impl SiteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the policy of a site and rearms one-shot triggers.
    ///
    /// Counters are kept so that `hit >= fire` holds across rearming.
    pub fn configure(&mut self, site: SiteId, policy: Policy) -> Result<(), EngineError> {
        policy.validate()?;
        let state = &mut self.sites[site.index()];
        state.policy = policy;
        state.spent = false;
        Ok(())
    }

    /// Forces every site to [`Policy::Disabled`].
    pub fn disable_all(&mut self) {
        for state in self.sites.iter_mut() {
            state.policy = Policy::Disabled;
            state.spent = false;
        }
    }

    pub fn set_bits_to_flip(&mut self, site: SiteId, bits: u8) {
        self.sites[site.index()].bits_to_flip = bits.max(1);
    }

    pub fn counters(&self, site: SiteId) -> SiteCounters {
        self.sites[site.index()].counters()
    }

    pub fn get(&self, site: SiteId) -> &SiteState {
        &self.sites[site.index()]
    }

    pub(crate) fn get_mut(&mut self, site: SiteId) -> &mut SiteState {
        &mut self.sites[site.index()]
    }

    /// Iterates over `(site, state)` pairs in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = (SiteId, &SiteState)> {
        ALL_SITES.iter().copied().zip(self.sites.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_names_round_trip() {
        for site in ALL_SITES {
            assert_eq!(SiteId::from_name(site.cli_name()).unwrap(), site);
            assert_eq!(SiteId::from_name(&site.to_string()).unwrap(), site);
        }
        assert!(SiteId::from_name("bogus").is_err());
    }

    #[test]
    fn mask_bits_are_distinct() {
        let all = ALL_SITES.iter().fold(0u32, |acc, s| acc | s.mask_bit());
        assert_eq!(all.count_ones() as usize, SITE_COUNT);
    }

    #[test]
    fn one_shot_is_eligible_once() {
        let mut state = SiteState {
            policy: Policy::EveryN {
                n: 3,
                trigger: Trigger::OneShot,
            },
            ..Default::default()
        };
        let eligible: Vec<bool> = (0..10).map(|_| state.register_hit(0)).collect();
        assert_eq!(eligible.iter().filter(|e| **e).count(), 1);
        assert!(eligible[2]);
        assert!(state.is_spent());
    }

    #[test]
    fn repeating_follows_modulus() {
        let mut state = SiteState {
            policy: Policy::EveryN {
                n: 4,
                trigger: Trigger::Repeating,
            },
            ..Default::default()
        };
        let hits: Vec<u32> = (1..=12).filter(|_| state.register_hit(0)).collect();
        assert_eq!(hits, vec![4, 8, 12]);
    }

    #[test]
    fn millisecond_window_uses_clock() {
        let mut state = SiteState {
            policy: Policy::Window {
                start: 100,
                end: 200,
                basis: WindowBasis::Millis,
            },
            ..Default::default()
        };
        assert!(!state.register_hit(99));
        assert!(state.register_hit(100));
        assert!(state.register_hit(199));
        assert!(!state.register_hit(200));
    }

    #[test]
    fn configure_rejects_invalid_policies() {
        let mut table = SiteTable::new();
        assert!(table
            .configure(
                SiteId::RxCorrupt,
                Policy::EveryN {
                    n: 0,
                    trigger: Trigger::OneShot
                }
            )
            .is_err());
        assert!(table
            .configure(
                SiteId::TxStall,
                Policy::Window {
                    start: 10,
                    end: 5,
                    basis: WindowBasis::Hits
                }
            )
            .is_err());
        assert_eq!(table.get(SiteId::TxStall).policy, Policy::Disabled);
    }

    #[test]
    fn disable_all_clears_every_policy() {
        let mut table = SiteTable::new();
        for site in ALL_SITES {
            table
                .configure(
                    site,
                    Policy::EveryN {
                        n: 1,
                        trigger: Trigger::Repeating,
                    },
                )
                .unwrap();
        }
        table.disable_all();
        assert!(table.iter().all(|(_, s)| s.policy == Policy::Disabled));
    }
}
