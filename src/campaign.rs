//! Fault injection campaign over a loopback link.
//!
//! A [`Campaign`] owns the fault engine, both endpoints and the two loopback
//! transports. It is the single writer of all of them, so a campaign driven
//! with the same clock values produces the same counters and event log.

use crate::fault_injection::control::{dump_counters, dump_log, Command, ControlError};
use crate::fault_injection::record::FiEvent;
use crate::fault_injection::sites::{SiteCounters, SiteId, ALL_SITES};
use crate::fault_injection::FaultEngine;
use crate::link::queue::{AckReason, ALL_ACK_REASONS};
use crate::link::resilience::{LinkError, LinkHealth, TxCounters};
use crate::link::transport::LoopbackTransport;
use crate::node::{RxCounters, Source, SourceConfig, SourceCounters, Station, StationConfig};
use itertools::Itertools;
use log::{error, info};
use std::fmt;

/// Wire speed of the loopback link per campaign step; a word frame fits in one step.
pub const DEFAULT_BYTES_PER_PUMP: usize = 8;

/// Counters collected at the end of a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignReport {
    pub elapsed_ms: u32,
    pub sites: Vec<(SiteId, SiteCounters)>,
    pub events_written: u64,
    pub rx: RxCounters,
    pub station_tx: TxCounters,
    pub station_queue_dropped: u32,
    pub station_health: LinkHealth,
    pub source: SourceCounters,
    pub source_tx: TxCounters,
    pub words_emitted: u32,
    pub acks: Vec<(AckReason, u32)>,
}

impl CampaignReport {
    pub fn site(&self, site: SiteId) -> SiteCounters {
        self.sites
            .iter()
            .find(|(id, _)| *id == site)
            .map(|(_, counters)| *counters)
            .unwrap_or_default()
    }

    pub fn ack_count(&self, reason: AckReason) -> u32 {
        self.acks
            .iter()
            .find(|(r, _)| *r == reason)
            .map_or(0, |(_, count)| *count)
    }
}

impl fmt::Display for CampaignReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Campaign report after {} ms", self.elapsed_ms)?;
        writeln!(f, "  Fault sites:")?;
        for (site, counters) in &self.sites {
            writeln!(
                f,
                "    {:<18} hit={:<6} fire={}",
                site.to_string(),
                counters.hit,
                counters.fire
            )?;
        }
        writeln!(f, "  Events recorded: {}", self.events_written)?;
        writeln!(f, "  Station RX: {}", self.rx)?;
        writeln!(
            f,
            "  Station TX: retry={} fail={} recov={} started={} done={} queue_drop={} health={:?}",
            self.station_tx.retries,
            self.station_tx.failures,
            self.station_tx.recoveries,
            self.station_tx.started,
            self.station_tx.completed,
            self.station_queue_dropped,
            self.station_health
        )?;
        writeln!(
            f,
            "  Source: words={} queued={} tlm={} tlm_refused={} queue_full={} sent={}",
            self.words_emitted,
            self.source.words_queued,
            self.source.telemetry_queued,
            self.source.telemetry_refused,
            self.source.queue_full,
            self.source_tx.completed
        )?;
        let acks = self
            .acks
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .join(" ");
        write!(f, "  Acks received: {}", acks)
    }
}

pub struct Campaign {
    engine: FaultEngine,
    source: Source,
    station: Station,
    source_link: LoopbackTransport,
    station_link: LoopbackTransport,
    now_ms: u32,
    started_ms: Option<u32>,
}

impl Campaign {
    pub fn new(
        engine: FaultEngine,
        source: SourceConfig,
        station: &StationConfig,
        bytes_per_pump: usize,
    ) -> Self {
        let (source_link, station_link) = LoopbackTransport::pair(bytes_per_pump);
        Self {
            engine,
            source: Source::new(source),
            station: Station::new(station),
            source_link,
            station_link,
            now_ms: 0,
            started_ms: None,
        }
    }

    pub fn engine(&self) -> &FaultEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut FaultEngine {
        &mut self.engine
    }

    pub fn station(&self) -> &Station {
        &self.station
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Transport on the station side, e.g. to inject raw bytes or errors.
    pub fn station_link_mut(&mut self) -> &mut LoopbackTransport {
        &mut self.station_link
    }

    pub fn source_link_mut(&mut self) -> &mut LoopbackTransport {
        &mut self.source_link
    }

    pub fn now_ms(&self) -> u32 {
        self.now_ms
    }

    /// Applies a control command to the engine.
    pub fn apply(&mut self, command: &Command) -> Result<String, ControlError> {
        command.apply(&mut self.engine)
    }

    /// One pass of the main loop at clock value `now_ms`.
    ///
    /// Source first, then the wire towards the station, then the station and
    /// the wire back.
    pub fn step(&mut self, now_ms: u32) -> Result<(), LinkError> {
        if self.started_ms.is_none() {
            info!("Campaign started at {} ms", now_ms);
            self.started_ms = Some(now_ms);
        }
        self.now_ms = now_ms;
        self.engine.set_now_ms(now_ms);

        self.source
            .poll(&mut self.engine, &mut self.source_link, now_ms)?;
        self.source_link.pump();
        let result = self
            .station
            .poll(&mut self.engine, &mut self.station_link, now_ms);
        self.station_link.pump();
        if let Err(e) = &result {
            error!("Campaign halted: {}", e);
        }
        result
    }

    /// Runs on a simulated clock from the current time for `duration_ms`,
    /// one step every `step_ms`.
    pub fn run_for(
        &mut self,
        duration_ms: u32,
        step_ms: u32,
    ) -> Result<CampaignReport, LinkError> {
        let step_ms = step_ms.max(1);
        let start = self.now_ms;
        let mut elapsed = 0;
        while elapsed <= duration_ms {
            self.step(start.wrapping_add(elapsed))?;
            elapsed = match elapsed.checked_add(step_ms) {
                Some(next) => next,
                None => break,
            };
        }
        info!("Campaign finished at {} ms", self.now_ms);
        Ok(self.report())
    }

    pub fn report(&self) -> CampaignReport {
        CampaignReport {
            elapsed_ms: self
                .now_ms
                .wrapping_sub(self.started_ms.unwrap_or(self.now_ms)),
            sites: ALL_SITES
                .iter()
                .map(|site| (*site, self.engine.counters(*site)))
                .collect(),
            events_written: self.engine.events().total_written(),
            rx: self.station.counters(),
            station_tx: self.station.tx_counters(),
            station_queue_dropped: self.station.queue().dropped(),
            station_health: self.station.tx().health(),
            source: self.source.counters(),
            source_tx: self.source.tx_counters(),
            words_emitted: self.source.words_emitted(),
            acks: ALL_ACK_REASONS
                .iter()
                .map(|reason| (*reason, self.source.acks().count(*reason)))
                .collect(),
        }
    }

    pub fn events(&self) -> Vec<FiEvent> {
        self.engine.events().iter().copied().collect()
    }

    pub fn dump_counters(&self) -> String {
        dump_counters(&self.engine)
    }

    pub fn dump_log(&self) -> String {
        dump_log(&self.engine)
    }
}
