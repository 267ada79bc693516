//! Word source: the transmitting end of the link.
//!
//! Produces a paced stream of avionics words and periodic telemetry frames,
//! passing them through the transmit side injection points, and decodes the
//! acknowledgements sent back by the station.

use crate::fault_injection::sites::SiteId;
use crate::fault_injection::FaultEngine;
use crate::link::arinc::{ArincWord, DATA_MASK};
use crate::link::codec::{pack_word, telemetry_frame, FrameFormat};
use crate::link::queue::{
    AckReason, OutboundMessage, OutboundQueue, ACK_REASON_COUNT, ACK_SYNC, ALL_ACK_REASONS,
    DEFAULT_QUEUE_DEPTH,
};
use crate::link::resilience::{LinkError, TxConfig, TxCounters, TxManager};
use crate::link::transport::Transport;
use itertools::Itertools;
use log::{debug, warn};
use std::fmt;

/// Label bits flipped by the label tamper site.
pub const LABEL_TAMPER_BITS: u8 = 0x1F;
/// Outbound word frames get every n-th byte corrupted by `TX_NOISE`.
pub const TX_NOISE_STRIDE: usize = 2;
/// Telemetry frames get every n-th byte corrupted by `MEM_BITFLIP`.
pub const MEM_BITFLIP_STRIDE: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Labels emitted in rotation.
    pub labels: Vec<u8>,
    pub word_period_ms: u32,
    /// Stop after this many words, `None` runs forever.
    pub word_count: Option<u32>,
    /// Telemetry frame period, 0 disables telemetry.
    pub telemetry_period_ms: u32,
    pub queue_depth: usize,
    pub tx: TxConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            labels: vec![0x01, 0x02, 0x03, 0x04],
            word_period_ms: 25,
            word_count: None,
            telemetry_period_ms: 1000,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            tx: TxConfig::default(),
        }
    }
}

/// Counts acknowledgements received from the station.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckDecoder {
    in_ack: bool,
    counts: [u32; ACK_REASON_COUNT],
    unknown: u32,
}

impl AckDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte, returns the reason once an acknowledgement completes.
    pub fn feed(&mut self, byte: u8) -> Option<AckReason> {
        if !std::mem::take(&mut self.in_ack) {
            self.in_ack = byte == ACK_SYNC;
            return None;
        }
        match AckReason::from_code(byte) {
            Some(reason) => {
                self.counts[reason.code() as usize] += 1;
                Some(reason)
            }
            None => {
                self.unknown += 1;
                // The byte may start the next acknowledgement.
                self.in_ack = byte == ACK_SYNC;
                None
            }
        }
    }

    pub fn count(&self, reason: AckReason) -> u32 {
        self.counts[reason.code() as usize]
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    pub fn unknown(&self) -> u32 {
        self.unknown
    }
}

impl fmt::Display for AckDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = ALL_ACK_REASONS
            .iter()
            .map(|reason| format!("{}={}", reason, self.count(*reason)))
            .join(" ");
        write!(f, "{} unknown={}", counts, self.unknown)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCounters {
    pub words_queued: u32,
    pub telemetry_queued: u32,
    /// Telemetry frames that failed the transmit self-check.
    pub telemetry_refused: u32,
    /// Messages not queued because the queue was full.
    pub queue_full: u32,
}

#[derive(Debug, Clone)]
pub struct Source {
    config: SourceConfig,
    queue: OutboundQueue,
    tx: TxManager,
    acks: AckDecoder,
    counters: SourceCounters,
    words_emitted: u32,
    next_word_ms: u32,
    telemetry_counter: u32,
    last_telemetry_ms: u32,
}

impl Source {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            queue: OutboundQueue::with_capacity(config.queue_depth),
            tx: TxManager::without_injection(config.tx),
            acks: AckDecoder::new(),
            counters: SourceCounters::default(),
            words_emitted: 0,
            next_word_ms: 0,
            telemetry_counter: 0,
            last_telemetry_ms: 0,
            config,
        }
    }

    pub fn counters(&self) -> SourceCounters {
        self.counters
    }

    pub fn acks(&self) -> &AckDecoder {
        &self.acks
    }

    pub fn tx_counters(&self) -> TxCounters {
        self.tx.counters()
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn words_emitted(&self) -> u32 {
        self.words_emitted
    }

    /// True once the configured word count has been emitted.
    pub fn is_exhausted(&self) -> bool {
        self.config
            .word_count
            .is_some_and(|count| self.words_emitted >= count)
    }

    /// The next word of the stream: labels in rotation, data is the sequence
    /// number.
    pub fn next_word(&self) -> ArincWord {
        let label = match self.config.labels.as_slice() {
            [] => 0,
            labels => labels[self.words_emitted as usize % labels.len()],
        };
        ArincWord::new(label, 0, self.words_emitted & DATA_MASK, 3)
    }

    /// One pass of the source main loop.
    pub fn poll<T: Transport>(
        &mut self,
        engine: &mut FaultEngine,
        transport: &mut T,
        now_ms: u32,
    ) -> Result<(), LinkError> {
        while let Some(byte) = transport.read_byte_nonblocking() {
            if let Some(reason) = self.acks.feed(byte) {
                debug!("Ack received: {}", reason);
            }
        }

        if !self.is_exhausted() && now_ms.wrapping_sub(self.next_word_ms) < u32::MAX / 2 {
            let word = self.next_word();
            self.emit_word(engine, word);
            self.words_emitted += 1;
            self.next_word_ms = now_ms.wrapping_add(self.config.word_period_ms);
        }

        if self.config.telemetry_period_ms != 0
            && now_ms.wrapping_sub(self.last_telemetry_ms) >= self.config.telemetry_period_ms
        {
            self.last_telemetry_ms = now_ms;
            self.telemetry_counter = self.telemetry_counter.wrapping_add(1);
            self.emit_telemetry(engine, self.telemetry_counter);
        }

        self.tx.service(engine, transport, &mut self.queue, now_ms)?;
        self.tx.poll_stall(transport, now_ms);
        Ok(())
    }

    /// Runs `word` through the transmit tampers and queues its frame.
    ///
    /// Returns the bytes that were queued, or `None` when the queue is full.
    pub fn emit_word(
        &mut self,
        engine: &mut FaultEngine,
        mut word: ArincWord,
    ) -> Option<OutboundMessage> {
        if engine.should_fire_traced(SiteId::LabelTamper, u32::from(word.label), word.data) {
            word.label ^= LABEL_TAMPER_BITS;
            debug!("Label tampered to 0x{:02X}", word.label);
        }
        let bad_parity =
            engine.should_fire_traced(SiteId::ParityTamper, u32::from(word.label), word.data);

        let mut frame = pack_word(&word, bad_parity);
        let head = u32::from(frame.as_slice()[0]);
        if engine.should_fire_traced(SiteId::TxNoise, frame.len() as u32, head) {
            engine.corrupt_bytes(frame.as_mut_slice(), TX_NOISE_STRIDE);
        }

        let message = OutboundMessage::from_frame(&frame);
        self.enqueue(message)?;
        self.counters.words_queued += 1;
        Some(message)
    }

    /// Queues telemetry frame `counter` unless the self-check finds it damaged.
    pub fn emit_telemetry(&mut self, engine: &mut FaultEngine, counter: u32) -> bool {
        let mut frame = telemetry_frame(counter);
        if engine.should_fire_traced(SiteId::MemBitFlip, counter, u32::from(frame.as_slice()[2])) {
            engine.corrupt_bytes(frame.as_mut_slice(), MEM_BITFLIP_STRIDE);
        }
        if !FrameFormat::TELEMETRY.verify(frame.as_slice()) {
            self.counters.telemetry_refused += 1;
            warn!("Telemetry frame #{} failed self-check, not sent", counter);
            return false;
        }
        if self.enqueue(OutboundMessage::from_frame(&frame)).is_none() {
            return false;
        }
        self.counters.telemetry_queued += 1;
        true
    }

    fn enqueue(&mut self, message: OutboundMessage) -> Option<()> {
        if self.queue.push(message).is_err() {
            self.counters.queue_full += 1;
            warn!("Source queue full, message dropped");
            return None;
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_injection::EngineConfig;
    use crate::link::arinc::has_odd_parity;
    use crate::link::codec::{ParseOutcome, Parser};

    fn enabled_engine() -> FaultEngine {
        FaultEngine::new(EngineConfig {
            enabled: true,
            ..Default::default()
        })
    }

    fn decode(message: &OutboundMessage) -> Vec<ParseOutcome> {
        let mut parser = Parser::new(FrameFormat::AVIONICS);
        message
            .as_slice()
            .iter()
            .map(|b| parser.feed(*b))
            .filter(|o| *o != ParseOutcome::Pending)
            .collect()
    }

    #[test]
    fn words_rotate_labels() {
        let mut engine = enabled_engine();
        let mut source = Source::new(SourceConfig::default());
        let labels: Vec<u8> = (0..6)
            .map(|_| {
                let word = source.next_word();
                source.emit_word(&mut engine, word);
                source.words_emitted += 1;
                word.label
            })
            .collect();
        assert_eq!(labels, vec![1, 2, 3, 4, 1, 2]);
        assert_eq!(source.counters().words_queued, 6);
    }

    #[test]
    fn label_tamper_flips_low_bits() {
        let mut engine = enabled_engine();
        engine.arm_every_n(SiteId::LabelTamper, 1).unwrap();
        let mut source = Source::new(SourceConfig::default());
        let message = source
            .emit_word(&mut engine, ArincWord::new(0x01, 0, 5, 0))
            .unwrap();
        match decode(&message).as_slice() {
            [ParseOutcome::WordOk(word)] => {
                assert_eq!(word & 0xFF, 0x1E);
                assert!(has_odd_parity(*word));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parity_tamper_produces_even_word() {
        let mut engine = enabled_engine();
        engine.arm_every_n(SiteId::ParityTamper, 1).unwrap();
        let mut source = Source::new(SourceConfig::default());
        let message = source
            .emit_word(&mut engine, ArincWord::new(0x02, 0, 5, 0))
            .unwrap();
        match decode(&message).as_slice() {
            [ParseOutcome::WordOk(word)] => assert!(!has_odd_parity(*word)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn noise_corrupts_even_bytes() {
        let mut engine = enabled_engine();
        engine.arm_every_n(SiteId::TxNoise, 1).unwrap();
        let mut source = Source::new(SourceConfig::default());
        let word = ArincWord::new(0x03, 0, 5, 0);
        let clean = pack_word(&word, false);
        let noisy = source.emit_word(&mut engine, word).unwrap();
        for (i, (a, b)) in clean.as_slice().iter().zip(noisy.as_slice()).enumerate() {
            let flipped = (a ^ b).count_ones();
            if i % TX_NOISE_STRIDE == 0 {
                assert_eq!(flipped, 1, "byte {i}");
            } else {
                assert_eq!(flipped, 0, "byte {i}");
            }
        }
    }

    #[test]
    fn damaged_telemetry_is_refused() {
        let mut engine = enabled_engine();
        engine.arm_every_n(SiteId::MemBitFlip, 2).unwrap();
        let mut source = Source::new(SourceConfig::default());
        assert!(source.emit_telemetry(&mut engine, 1));
        assert!(!source.emit_telemetry(&mut engine, 2));
        assert_eq!(source.counters().telemetry_queued, 1);
        assert_eq!(source.counters().telemetry_refused, 1);
        assert_eq!(source.queue().len(), 1);
    }

    #[test]
    fn ack_decoder_counts_reasons() {
        let mut decoder = AckDecoder::new();
        let stream = [0x00, 0xAC, 0, 0xAC, 3, 0xAC, 0xAC, 2, 0xAC, 9];
        let decoded: Vec<AckReason> = stream.iter().filter_map(|b| decoder.feed(*b)).collect();
        assert_eq!(
            decoded,
            vec![AckReason::Ok, AckReason::BadPlausibility, AckReason::BadParity]
        );
        assert_eq!(decoder.total(), 3);
        assert_eq!(decoder.unknown(), 2);
    }
}
