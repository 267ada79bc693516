//! Deterministic fault injection engine.
//!
//! All engine state (enable flag, feature mask, probability, PRNG, site table
//! and event log) lives in one [`FaultEngine`] value that is passed explicitly
//! to every call site. Two engines built from the same [`EngineConfig`] and
//! driven with the same call sequence make identical decisions.

pub mod control;
pub mod prng;
pub mod record;
pub mod sites;

use log::{debug, info};
use prng::Xorshift32;
use record::{EventLog, FiEvent, RecordMode};
use sites::{Policy, SiteCounters, SiteId, SiteState, SiteTable, Trigger, WindowBasis};
use thiserror::Error;

/// Errors from the fault engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Probability {0} is out of range (0..=100)")]
    ProbabilityOutOfRange(u32),

    #[error("Every-N interval must be non-zero")]
    ZeroInterval,

    #[error("Window end {end} precedes start {start}")]
    InvertedWindow { start: u32, end: u32 },

    #[error("Unknown fault site: {0:?}")]
    UnknownSite(String),
}

/// Start-up configuration of a [`FaultEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub seed: u32,
    pub enabled: bool,
    pub mask: u32,
    /// Fire probability in percent.
    pub probability: u8,
    /// Trigger used by [`FaultEngine::arm_every_n`].
    pub every_n_trigger: Trigger,
    pub record_mode: RecordMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 0xC0FF_EE01,
            enabled: false,
            mask: u32::MAX,
            probability: 100,
            every_n_trigger: Trigger::OneShot,
            record_mode: RecordMode::AllDecisions,
        }
    }
}

/// The fault injection decision engine.
#[derive(Clone, Debug)]
pub struct FaultEngine {
    enabled: bool,
    mask: u32,
    probability: u8,
    rng: Xorshift32,
    sites: SiteTable,
    log: EventLog,
    now_ms: u32,
    every_n_trigger: Trigger,
    record_mode: RecordMode,
}

impl FaultEngine {
    /// Creates an engine with every site disabled.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            enabled: config.enabled,
            mask: config.mask,
            probability: config.probability.min(100),
            rng: Xorshift32::new(config.seed),
            sites: SiteTable::new(),
            log: EventLog::new(),
            now_ms: 0,
            every_n_trigger: config.every_n_trigger,
            record_mode: config.record_mode,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        info!("Fault injection {}", if enabled { "enabled" } else { "disabled" });
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_mask(&mut self, mask: u32) {
        self.mask = mask;
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn set_probability(&mut self, percent: u32) -> Result<(), EngineError> {
        if percent > 100 {
            return Err(EngineError::ProbabilityOutOfRange(percent));
        }
        self.probability = percent as u8;
        Ok(())
    }

    pub fn probability(&self) -> u8 {
        self.probability
    }

    /// Reseeds the PRNG. Site counters and the event log are left untouched.
    pub fn set_seed(&mut self, seed: u32) {
        self.rng.seed(seed);
    }

    /// Updates the engine clock used for time windows and event timestamps.
    pub fn set_now_ms(&mut self, now_ms: u32) {
        self.now_ms = now_ms;
    }

    pub fn now_ms(&self) -> u32 {
        self.now_ms
    }

    pub fn every_n_trigger(&self) -> Trigger {
        self.every_n_trigger
    }

    pub fn set_every_n_trigger(&mut self, trigger: Trigger) {
        self.every_n_trigger = trigger;
    }

    pub fn set_record_mode(&mut self, mode: RecordMode) {
        self.record_mode = mode;
    }

    /// Replaces the policy of `site` and rearms it.
    pub fn configure(&mut self, site: SiteId, policy: Policy) -> Result<(), EngineError> {
        self.sites.configure(site, policy)?;
        info!("Armed {} with {}", site, policy);
        Ok(())
    }

    /// Arms `site` to become eligible on its `n`-th hit.
    pub fn arm_every_n(&mut self, site: SiteId, n: u32) -> Result<(), EngineError> {
        let trigger = self.every_n_trigger;
        self.configure(site, Policy::EveryN { n, trigger })
    }

    /// Arms `site` for hit counts in `[start, end)`.
    pub fn arm_window(&mut self, site: SiteId, start: u32, end: u32) -> Result<(), EngineError> {
        self.configure(
            site,
            Policy::Window {
                start,
                end,
                basis: WindowBasis::Hits,
            },
        )
    }

    /// Arms `site` for engine clock values in `[start_ms, end_ms)`.
    pub fn arm_window_ms(
        &mut self,
        site: SiteId,
        start_ms: u32,
        end_ms: u32,
    ) -> Result<(), EngineError> {
        self.configure(
            site,
            Policy::Window {
                start: start_ms,
                end: end_ms,
                basis: WindowBasis::Millis,
            },
        )
    }

    pub fn disable_all(&mut self) {
        info!("All fault sites disabled");
        self.sites.disable_all();
    }

    pub fn set_bits_to_flip(&mut self, site: SiteId, bits: u8) {
        self.sites.set_bits_to_flip(site, bits);
    }

    pub fn counters(&self, site: SiteId) -> SiteCounters {
        self.sites.counters(site)
    }

    pub fn site(&self, site: SiteId) -> &SiteState {
        self.sites.get(site)
    }

    pub fn sites(&self) -> &SiteTable {
        &self.sites
    }

    pub fn events(&self) -> &EventLog {
        &self.log
    }

    /// Decides whether the fault at `site` fires now.
    pub fn should_fire(&mut self, site: SiteId) -> bool {
        self.should_fire_traced(site, 0, 0)
    }

    /// Like [`should_fire`](Self::should_fire), attaching two diagnostic words
    /// to the recorded event.
    pub fn should_fire_traced(&mut self, site: SiteId, extra: u32, data_peek: u32) -> bool {
        if !self.enabled || self.mask & site.mask_bit() == 0 {
            return false;
        }

        let now_ms = self.now_ms;
        let state = self.sites.get_mut(site);
        let eligible = state.register_hit(now_ms);
        let hit = state.hit_count;

        // The draw is only taken for eligible hits so that the PRNG stream
        // depends on policy outcomes, not on raw traffic volume.
        let fired = eligible && self.rng.next_u32() % 100 < u32::from(self.probability);
        if fired {
            let state = self.sites.get_mut(site);
            state.fire_count = state.fire_count.wrapping_add(1);
            debug!("{} fired at hit {}", site, hit);
        }

        if fired || self.record_mode == RecordMode::AllDecisions {
            self.log.push(FiEvent {
                ts_ms: now_ms,
                site,
                fired,
                hit,
                extra,
                data_peek,
            });
        }
        fired
    }

    /// Flips one PRNG-chosen bit in every `every_n`-th byte, starting at index 0.
    pub fn corrupt_bytes(&mut self, buffer: &mut [u8], every_n: usize) {
        if every_n == 0 {
            return;
        }
        for byte in buffer.iter_mut().step_by(every_n) {
            *byte ^= 1 << (self.rng.next_u32() & 0x7);
        }
    }

    /// Flips `flip_count` PRNG-chosen bit positions of `byte` one after another.
    ///
    /// The same position may be picked twice, cancelling the earlier flip.
    pub fn corrupt_byte_multi(&mut self, byte: u8, flip_count: u8) -> u8 {
        (0..flip_count).fold(byte, |out, _| out ^ (1 << (self.rng.next_u32() & 0x7)))
    }

    /// Corrupts `byte` with the bits-to-flip setting of `site`.
    pub fn corrupt_byte(&mut self, site: SiteId, byte: u8) -> u8 {
        let flips = self.sites.get(site).bits_to_flip.max(1);
        self.corrupt_byte_multi(byte, flips)
    }
}

impl Default for FaultEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
