//! Transport and clock collaborators of the link.
//!
//! [`LoopbackTransport`] connects two endpoints in memory over a pair of
//! `crossbeam-channel` byte wires. Outgoing bytes are only moved onto the wire
//! by [`LoopbackTransport::pump`], a few at a time, so that send progress is
//! observable by polling like on a real UART.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Immediate result of a non-blocking send request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// Transfer started.
    Success,
    /// A transfer is already in flight, try again later.
    Busy,
    /// The transport refused the request.
    Error,
}

/// Byte transport consumed by the link endpoints. No method may block.
pub trait Transport {
    fn send_nonblocking(&mut self, bytes: &[u8]) -> SendStatus;

    fn read_byte_nonblocking(&mut self) -> Option<u8>;

    /// Bytes of the current transfer that left the transport so far.
    fn bytes_sent_so_far(&self) -> u32;

    /// True while a started transfer has bytes left to send.
    fn send_in_progress(&self) -> bool;

    /// Cancels the current transfer. No-op when idle.
    fn abort_send(&mut self);
}

/// Monotonic millisecond source. Wrap-around is allowed.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Millisecond counter shared between a tick source and the main loop.
///
/// The counter is the only state shared across threads; it is written with
/// a single atomic add and read with a single atomic load.
#[derive(Clone, Debug, Default)]
pub struct TickClock {
    millis: Arc<AtomicU32>,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock, wrapping at `u32::MAX`.
    pub fn advance(&self, ms: u32) {
        self.millis.fetch_add(ms, Ordering::Release);
    }
}

impl Clock for TickClock {
    fn now_ms(&self) -> u32 {
        self.millis.load(Ordering::Acquire)
    }
}

/// In-memory transport endpoint.
#[derive(Debug)]
pub struct LoopbackTransport {
    wire_out: Sender<u8>,
    wire_in: Receiver<u8>,
    pending: VecDeque<u8>,
    sent_so_far: u32,
    bytes_per_pump: usize,
    paused: bool,
    fail_next_send: bool,
}

impl LoopbackTransport {
    /// Creates two endpoints wired to each other.
    pub fn pair(bytes_per_pump: usize) -> (Self, Self) {
        let (a_to_b, b_from_a) = unbounded();
        let (b_to_a, a_from_b) = unbounded();
        (
            Self::new(a_to_b, a_from_b, bytes_per_pump),
            Self::new(b_to_a, b_from_a, bytes_per_pump),
        )
    }

    fn new(wire_out: Sender<u8>, wire_in: Receiver<u8>, bytes_per_pump: usize) -> Self {
        Self {
            wire_out,
            wire_in,
            pending: VecDeque::new(),
            sent_so_far: 0,
            bytes_per_pump: bytes_per_pump.max(1),
            paused: false,
            fail_next_send: false,
        }
    }

    /// Moves up to `bytes_per_pump` pending bytes onto the wire.
    ///
    /// Returns the number of bytes moved. A disconnected peer swallows the
    /// bytes, like an unplugged cable.
    pub fn pump(&mut self) -> usize {
        if self.paused {
            return 0;
        }
        let count = self.bytes_per_pump.min(self.pending.len());
        for byte in self.pending.drain(..count) {
            if self.wire_out.send(byte).is_err() {
                debug!("Loopback peer disconnected, byte 0x{:02X} lost", byte);
            }
        }
        self.sent_so_far = self.sent_so_far.wrapping_add(count as u32);
        count
    }

    /// Freezes the wire so that a transfer makes no progress.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Makes the next send request fail with [`SendStatus::Error`].
    pub fn fail_next_send(&mut self) {
        self.fail_next_send = true;
    }

    /// Pushes raw bytes onto the wire, bypassing the transfer machinery.
    pub fn inject_raw(&self, bytes: &[u8]) {
        for byte in bytes {
            if self.wire_out.send(*byte).is_err() {
                break;
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Transport for LoopbackTransport {
    fn send_nonblocking(&mut self, bytes: &[u8]) -> SendStatus {
        if std::mem::take(&mut self.fail_next_send) {
            return SendStatus::Error;
        }
        if !self.pending.is_empty() {
            return SendStatus::Busy;
        }
        self.pending.extend(bytes.iter().copied());
        self.sent_so_far = 0;
        SendStatus::Success
    }

    fn read_byte_nonblocking(&mut self) -> Option<u8> {
        self.wire_in.try_recv().ok()
    }

    fn bytes_sent_so_far(&self) -> u32 {
        self.sent_so_far
    }

    fn send_in_progress(&self) -> bool {
        !self.pending.is_empty()
    }

    fn abort_send(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(transport: &mut LoopbackTransport) -> Vec<u8> {
        std::iter::from_fn(|| transport.read_byte_nonblocking()).collect()
    }

    #[test]
    fn bytes_cross_the_wire_per_pump() {
        let (mut a, mut b) = LoopbackTransport::pair(2);
        assert_eq!(a.send_nonblocking(&[1, 2, 3]), SendStatus::Success);
        assert!(a.send_in_progress());
        assert_eq!(a.pump(), 2);
        assert_eq!(a.bytes_sent_so_far(), 2);
        assert_eq!(drain(&mut b), vec![1, 2]);
        assert_eq!(a.pump(), 1);
        assert!(!a.send_in_progress());
        assert_eq!(a.bytes_sent_so_far(), 3);
        assert_eq!(drain(&mut b), vec![3]);
    }

    #[test]
    fn busy_while_in_flight() {
        let (mut a, _b) = LoopbackTransport::pair(1);
        assert_eq!(a.send_nonblocking(&[9, 9]), SendStatus::Success);
        assert_eq!(a.send_nonblocking(&[7]), SendStatus::Busy);
        a.abort_send();
        assert_eq!(a.send_nonblocking(&[7]), SendStatus::Success);
        assert_eq!(a.bytes_sent_so_far(), 0);
    }

    #[test]
    fn error_hook_fires_once() {
        let (mut a, _b) = LoopbackTransport::pair(1);
        a.fail_next_send();
        assert_eq!(a.send_nonblocking(&[1]), SendStatus::Error);
        assert_eq!(a.send_nonblocking(&[1]), SendStatus::Success);
    }

    #[test]
    fn paused_wire_makes_no_progress() {
        let (mut a, mut b) = LoopbackTransport::pair(4);
        a.send_nonblocking(&[1, 2]);
        a.set_paused(true);
        assert_eq!(a.pump(), 0);
        assert_eq!(a.bytes_sent_so_far(), 0);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn tick_clock_wraps() {
        let clock = TickClock::new();
        clock.advance(u32::MAX);
        clock.advance(11);
        assert_eq!(clock.now_ms(), 10);
        let shared = clock.clone();
        shared.advance(5);
        assert_eq!(clock.now_ms(), 15);
    }
}
