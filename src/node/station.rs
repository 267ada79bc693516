//! Receiving station.
//!
//! Every received byte passes the `RX_CORRUPT` injection point, then the
//! frame parsers, then the barrier chain. Each avionics frame outcome is
//! acknowledged to the peer through the outbound queue.

use crate::fault_injection::sites::SiteId;
use crate::fault_injection::FaultEngine;
use crate::link::barrier::{BarrierChain, Plausibility, Verdict, DEFAULT_MIN_INTERVAL_MS};
use crate::link::codec::{FrameFormat, ParseOutcome, Parser, ParserCounters};
use crate::link::queue::{AckReason, OutboundMessage, OutboundQueue, DEFAULT_QUEUE_DEPTH};
use crate::link::resilience::{LinkError, TxConfig, TxCounters, TxManager};
use crate::link::transport::Transport;
use log::{debug, info, warn};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationConfig {
    pub allowed_labels: Vec<u8>,
    pub min_interval_ms: u32,
    pub queue_depth: usize,
    pub tx: TxConfig,
    /// Period of the counter summary log line, 0 disables it.
    pub telemetry_period_ms: u32,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            allowed_labels: vec![0x01, 0x02, 0x03, 0x04],
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            tx: TxConfig::default(),
            telemetry_period_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxCounters {
    pub rx_ok: u32,
    pub bad_checksum: u32,
    pub bad_parity: u32,
    pub bad_plausibility: u32,
    pub bad_length: u32,
    pub telemetry_ok: u32,
    pub telemetry_bad: u32,
    /// Acknowledgements lost to queue overflow.
    pub tx_drops: u32,
}

impl fmt::Display for RxCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx_ok={} bad_chk={} bad_parity={} bad_plaus={} bad_len={} tlm_ok={} tlm_bad={} tx_drop={}",
            self.rx_ok,
            self.bad_checksum,
            self.bad_parity,
            self.bad_plausibility,
            self.bad_length,
            self.telemetry_ok,
            self.telemetry_bad,
            self.tx_drops
        )
    }
}

/// What a single received byte completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent {
    None,
    Word { word: u32, verdict: Verdict },
    BadLength(u8),
    BadChecksum,
    /// Telemetry frame with its sequence counter.
    Telemetry(u32),
    TelemetryRejected,
}

/// Trace of one byte through the inbound pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxStep {
    /// Byte as read from the transport.
    pub raw: u8,
    /// Byte as handed to the parsers.
    pub delivered: u8,
    pub corrupted: bool,
    pub event: RxEvent,
}

#[derive(Debug, Clone)]
pub struct Station {
    word_parser: Parser,
    telemetry_parser: Parser,
    barriers: BarrierChain,
    queue: OutboundQueue,
    tx: TxManager,
    counters: RxCounters,
    last_good_word: Option<u32>,
    telemetry_period_ms: u32,
    last_telemetry_ms: u32,
}

impl Station {
    pub fn new(config: &StationConfig) -> Self {
        Self {
            word_parser: Parser::new(FrameFormat::AVIONICS),
            telemetry_parser: Parser::new(FrameFormat::TELEMETRY),
            barriers: BarrierChain::new(Plausibility::with_allowed(
                config.min_interval_ms,
                &config.allowed_labels,
            )),
            queue: OutboundQueue::with_capacity(config.queue_depth),
            tx: TxManager::new(config.tx),
            counters: RxCounters::default(),
            last_good_word: None,
            telemetry_period_ms: config.telemetry_period_ms,
            last_telemetry_ms: 0,
        }
    }

    pub fn counters(&self) -> RxCounters {
        self.counters
    }

    pub fn word_parser_counters(&self) -> ParserCounters {
        self.word_parser.counters()
    }

    pub fn telemetry_parser_counters(&self) -> ParserCounters {
        self.telemetry_parser.counters()
    }

    pub fn tx_counters(&self) -> TxCounters {
        self.tx.counters()
    }

    pub fn tx(&self) -> &TxManager {
        &self.tx
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn barriers(&self) -> &BarrierChain {
        &self.barriers
    }

    /// Most recent word that passed every barrier.
    pub fn last_good_word(&self) -> Option<u32> {
        self.last_good_word
    }

    /// One pass of the station main loop.
    ///
    /// Order is fixed: drain received bytes, service the outbound queue,
    /// run the stall monitor, emit the periodic summary.
    pub fn poll<T: Transport>(
        &mut self,
        engine: &mut FaultEngine,
        transport: &mut T,
        now_ms: u32,
    ) -> Result<(), LinkError> {
        while let Some(byte) = transport.read_byte_nonblocking() {
            self.ingest(engine, byte, now_ms);
        }
        self.tx.service(engine, transport, &mut self.queue, now_ms)?;
        self.tx.poll_stall(transport, now_ms);
        self.report_periodic(now_ms);
        Ok(())
    }

    /// Runs one received byte through the inbound pipeline.
    pub fn ingest(&mut self, engine: &mut FaultEngine, byte: u8, now_ms: u32) -> RxStep {
        let corrupted =
            engine.should_fire_traced(SiteId::RxCorrupt, u32::from(byte), u32::from(byte));
        let delivered = if corrupted {
            engine.corrupt_byte(SiteId::RxCorrupt, byte)
        } else {
            byte
        };
        if corrupted {
            debug!("RX byte 0x{:02X} corrupted to 0x{:02X}", byte, delivered);
        }
        RxStep {
            raw: byte,
            delivered,
            corrupted,
            event: self.dispatch(delivered, now_ms),
        }
    }

    /// A byte goes to a parser unless the other one is in the middle of a frame.
    fn dispatch(&mut self, byte: u8, now_ms: u32) -> RxEvent {
        let word_turn = self.telemetry_parser.is_idle();
        let telemetry_turn = self.word_parser.is_idle();

        let mut event = RxEvent::None;
        if word_turn {
            let outcome = self.word_parser.feed(byte);
            event = self.on_word_outcome(outcome, now_ms);
        }
        if telemetry_turn {
            let outcome = self.telemetry_parser.feed(byte);
            let telemetry = self.on_telemetry_outcome(outcome);
            if event == RxEvent::None {
                event = telemetry;
            }
        }
        event
    }

    fn on_word_outcome(&mut self, outcome: ParseOutcome, now_ms: u32) -> RxEvent {
        match outcome {
            ParseOutcome::Pending => RxEvent::None,
            ParseOutcome::BadLength(len) => {
                self.counters.bad_length += 1;
                warn!("Avionics frame with bad length {}", len);
                self.acknowledge(AckReason::BadLength);
                RxEvent::BadLength(len)
            }
            ParseOutcome::BadChecksum { expected, received } => {
                self.counters.bad_checksum += 1;
                warn!(
                    "Avionics frame checksum 0x{:02X}, expected 0x{:02X}",
                    received, expected
                );
                self.acknowledge(AckReason::BadChecksum);
                RxEvent::BadChecksum
            }
            ParseOutcome::WordOk(word) => {
                let verdict = self.barriers.evaluate(word, now_ms);
                let reason = match verdict {
                    Verdict::Accepted => {
                        self.counters.rx_ok += 1;
                        self.last_good_word = Some(word);
                        AckReason::Ok
                    }
                    Verdict::BadParity => {
                        self.counters.bad_parity += 1;
                        AckReason::BadParity
                    }
                    Verdict::LabelNotAllowed(_) | Verdict::RateLimited(_) => {
                        self.counters.bad_plausibility += 1;
                        AckReason::BadPlausibility
                    }
                };
                self.acknowledge(reason);
                RxEvent::Word { word, verdict }
            }
            ParseOutcome::FrameOk(payload) => {
                debug!("Unexpected avionics payload {:02X?}", payload.as_slice());
                RxEvent::None
            }
        }
    }

    fn on_telemetry_outcome(&mut self, outcome: ParseOutcome) -> RxEvent {
        match outcome {
            ParseOutcome::Pending => RxEvent::None,
            ParseOutcome::FrameOk(payload) => match payload.word() {
                Some(counter) => {
                    self.counters.telemetry_ok += 1;
                    debug!("Telemetry frame #{}", counter);
                    RxEvent::Telemetry(counter)
                }
                None => RxEvent::None,
            },
            ParseOutcome::WordOk(_)
            | ParseOutcome::BadLength(_)
            | ParseOutcome::BadChecksum { .. } => {
                self.counters.telemetry_bad += 1;
                RxEvent::TelemetryRejected
            }
        }
    }

    /// Queues an acknowledgement.
    ///
    /// The last free slot is reserved for a `TxDrop` notice. Once that is
    /// taken as well, the queue's own drop counter records further losses.
    fn acknowledge(&mut self, reason: AckReason) {
        if self.queue.remaining() > 1 && self.queue.push(OutboundMessage::ack(reason)).is_ok() {
            return;
        }
        self.counters.tx_drops += 1;
        warn!("Outbound queue full, ack {} dropped", reason);
        if self
            .queue
            .push(OutboundMessage::ack(AckReason::TxDrop))
            .is_err()
        {
            debug!(
                "Overflow notice dropped too ({} total)",
                self.queue.dropped()
            );
        }
    }

    fn report_periodic(&mut self, now_ms: u32) {
        if self.telemetry_period_ms == 0
            || now_ms.wrapping_sub(self.last_telemetry_ms) < self.telemetry_period_ms
        {
            return;
        }
        self.last_telemetry_ms = now_ms;
        let tx = self.tx.counters();
        info!(
            "[{} ms] {} | tx_retry={} tx_fail={} tx_recov={}",
            now_ms, self.counters, tx.retries, tx.failures, tx.recoveries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_injection::EngineConfig;
    use crate::link::arinc::ArincWord;
    use crate::link::codec::{pack_word, telemetry_frame};

    fn quiet_engine() -> FaultEngine {
        FaultEngine::new(EngineConfig::default())
    }

    fn feed(
        station: &mut Station,
        engine: &mut FaultEngine,
        bytes: &[u8],
        now_ms: u32,
    ) -> Vec<RxEvent> {
        bytes
            .iter()
            .map(|b| station.ingest(engine, *b, now_ms).event)
            .filter(|event| *event != RxEvent::None)
            .collect()
    }

    fn acks(station: &Station) -> Vec<AckReason> {
        station
            .queue()
            .iter()
            .filter_map(|m| m.ack_reason())
            .collect()
    }

    #[test]
    fn accepted_word_is_acked_ok() {
        let mut engine = quiet_engine();
        let mut station = Station::new(&StationConfig::default());
        let word = ArincWord::new(0x02, 1, 1234, 3);
        let frame = pack_word(&word, false);

        let events = feed(&mut station, &mut engine, frame.as_slice(), 0);
        assert_eq!(
            events,
            vec![RxEvent::Word {
                word: word.pack(false),
                verdict: Verdict::Accepted
            }]
        );
        assert_eq!(station.counters().rx_ok, 1);
        assert_eq!(station.last_good_word(), Some(word.pack(false)));
        assert_eq!(acks(&station), vec![AckReason::Ok]);
    }

    #[test]
    fn each_rejection_class_is_counted_and_acked() {
        let mut engine = quiet_engine();
        let mut station = Station::new(&StationConfig::default());

        let bad_parity = pack_word(&ArincWord::new(0x01, 0, 1, 0), true);
        let unknown_label = pack_word(&ArincWord::new(0x77, 0, 1, 0), false);
        let mut bad_checksum = pack_word(&ArincWord::new(0x01, 0, 1, 0), false);
        bad_checksum.as_mut_slice()[3] ^= 0x10;

        feed(&mut station, &mut engine, bad_parity.as_slice(), 0);
        feed(&mut station, &mut engine, unknown_label.as_slice(), 0);
        feed(&mut station, &mut engine, bad_checksum.as_slice(), 0);
        feed(&mut station, &mut engine, &[0xA5, 9], 0);

        let counters = station.counters();
        assert_eq!(counters.bad_parity, 1);
        assert_eq!(counters.bad_plausibility, 1);
        assert_eq!(counters.bad_checksum, 1);
        assert_eq!(counters.bad_length, 1);
        assert_eq!(
            acks(&station),
            vec![
                AckReason::BadParity,
                AckReason::BadPlausibility,
                AckReason::BadChecksum,
                AckReason::BadLength
            ]
        );
    }

    #[test]
    fn telemetry_and_words_share_the_wire() {
        let mut engine = quiet_engine();
        let mut station = Station::new(&StationConfig::default());
        let mut stream = Vec::new();
        // Telemetry payload bytes include the avionics sync byte.
        stream.extend_from_slice(telemetry_frame(0xA5).as_slice());
        stream.extend_from_slice(pack_word(&ArincWord::new(0x03, 0, 7, 0), false).as_slice());

        let events = feed(&mut station, &mut engine, &stream, 0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], RxEvent::Telemetry(0xA5));
        assert!(matches!(
            events[1],
            RxEvent::Word {
                verdict: Verdict::Accepted,
                ..
            }
        ));
        assert_eq!(station.counters().telemetry_ok, 1);
    }

    #[test]
    fn overflow_reserves_last_slot_for_notice() {
        let mut engine = quiet_engine();
        let config = StationConfig {
            queue_depth: 3,
            ..Default::default()
        };
        let mut station = Station::new(&config);
        for _ in 0..5 {
            feed(&mut station, &mut engine, &[0xA5, 0], 0);
        }
        assert_eq!(
            acks(&station),
            vec![AckReason::BadLength, AckReason::BadLength, AckReason::TxDrop]
        );
        assert_eq!(station.counters().tx_drops, 3);
        assert_eq!(station.queue().dropped(), 2);
    }

    #[test]
    fn rx_corruption_is_traced() {
        let mut engine = FaultEngine::new(EngineConfig {
            enabled: true,
            ..Default::default()
        });
        engine.arm_every_n(SiteId::RxCorrupt, 2).unwrap();
        let mut station = Station::new(&StationConfig::default());

        let first = station.ingest(&mut engine, 0x10, 0);
        let second = station.ingest(&mut engine, 0x10, 0);
        assert!(!first.corrupted);
        assert_eq!(first.delivered, 0x10);
        assert!(second.corrupted);
        assert_eq!((second.raw ^ second.delivered).count_ones(), 1);
        let event = engine.events().latest().unwrap();
        assert_eq!(event.site, SiteId::RxCorrupt);
        assert!(event.fired);
        assert_eq!(event.extra, 0x10);
    }
}
