use super::codec::{Frame, MAX_FRAME};
use std::fmt;

/// Sync byte of acknowledgement messages.
pub const ACK_SYNC: u8 = 0xAC;
/// Default outbound queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Reason code carried by an acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AckReason {
    Ok = 0,
    BadChecksum = 1,
    BadParity = 2,
    BadPlausibility = 3,
    BadLength = 4,
    /// The sender had to drop acknowledgements.
    TxDrop = 5,
}

pub const ACK_REASON_COUNT: usize = 6;

pub const ALL_ACK_REASONS: [AckReason; ACK_REASON_COUNT] = [
    AckReason::Ok,
    AckReason::BadChecksum,
    AckReason::BadParity,
    AckReason::BadPlausibility,
    AckReason::BadLength,
    AckReason::TxDrop,
];

impl AckReason {
    pub fn from_code(code: u8) -> Option<Self> {
        ALL_ACK_REASONS.get(code as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for AckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckReason::Ok => "ok",
            AckReason::BadChecksum => "bad_chk",
            AckReason::BadParity => "bad_parity",
            AckReason::BadPlausibility => "bad_plaus",
            AckReason::BadLength => "bad_len",
            AckReason::TxDrop => "tx_drop",
        };
        f.write_str(name)
    }
}

/// A small fixed size message waiting for transmission.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OutboundMessage {
    bytes: [u8; MAX_FRAME],
    len: u8,
}

impl OutboundMessage {
    /// Two byte acknowledgement `[ACK_SYNC][reason]`.
    pub fn ack(reason: AckReason) -> Self {
        let mut bytes = [0; MAX_FRAME];
        bytes[0] = ACK_SYNC;
        bytes[1] = reason.code();
        Self { bytes, len: 2 }
    }

    pub fn from_frame(frame: &Frame) -> Self {
        let mut bytes = [0; MAX_FRAME];
        bytes[..frame.len()].copy_from_slice(frame.as_slice());
        Self {
            bytes,
            len: frame.len() as u8,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Reason code when this message is an acknowledgement.
    pub fn ack_reason(&self) -> Option<AckReason> {
        match self.as_slice() {
            [ACK_SYNC, code] => AckReason::from_code(*code),
            _ => None,
        }
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutboundMessage({:02X?})", self.as_slice())
    }
}

/// Returned by [`OutboundQueue::push`] when the queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFull;

/// Bounded circular queue of outbound messages.
///
/// A failed push leaves the contents untouched and increments the drop
/// counter.
/// The slot array is allocated once by [`OutboundQueue::with_capacity`].
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    slots: Box<[Option<OutboundMessage>]>,
    head: usize,
    len: usize,
    dropped: u32,
}

impl OutboundQueue {
    /// Creates a queue of [`DEFAULT_QUEUE_DEPTH`] slots.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_DEPTH)
    }

    /// Creates a queue holding `capacity` messages (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)].into_boxed_slice(),
            head: 0,
            len: 0,
            dropped: 0,
        }
    }

    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Free slots.
    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn push(&mut self, message: OutboundMessage) -> Result<(), QueueFull> {
        if self.is_full() {
            self.dropped = self.dropped.wrapping_add(1);
            return Err(QueueFull);
        }
        let slot = self.slot(self.len);
        self.slots[slot] = Some(message);
        self.len += 1;
        Ok(())
    }

    /// Head of the queue without removing it.
    pub fn peek(&self) -> Option<&OutboundMessage> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    pub fn pop(&mut self) -> Option<OutboundMessage> {
        if self.is_empty() {
            return None;
        }
        let message = self.slots[self.head].take();
        self.head = self.slot(1);
        self.len -= 1;
        message
    }

    /// Iterates from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> + '_ {
        (0..self.len).filter_map(move |offset| self.slots[self.slot(offset)].as_ref())
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::codec::FrameFormat;

    #[test]
    fn ack_layout() {
        let ack = OutboundMessage::ack(AckReason::BadParity);
        assert_eq!(ack.as_slice(), &[0xAC, 2]);
        assert_eq!(ack.ack_reason(), Some(AckReason::BadParity));
    }

    #[test]
    fn frames_are_not_acks() {
        let frame = FrameFormat::AVIONICS.encode(&[1, 2, 3, 4]);
        let message = OutboundMessage::from_frame(&frame);
        assert_eq!(message.as_slice(), frame.as_slice());
        assert_eq!(message.ack_reason(), None);
    }

    #[test]
    fn fifo_order_and_peek() {
        let mut queue = OutboundQueue::with_capacity(4);
        queue.push(OutboundMessage::ack(AckReason::Ok)).unwrap();
        queue.push(OutboundMessage::ack(AckReason::BadLength)).unwrap();
        assert_eq!(queue.peek().and_then(|m| m.ack_reason()), Some(AckReason::Ok));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().and_then(|m| m.ack_reason()), Some(AckReason::Ok));
        assert_eq!(queue.pop().and_then(|m| m.ack_reason()), Some(AckReason::BadLength));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn overflow_counts_and_preserves_contents() {
        let mut queue = OutboundQueue::with_capacity(3);
        for reason in [AckReason::Ok, AckReason::BadChecksum, AckReason::BadParity] {
            queue.push(OutboundMessage::ack(reason)).unwrap();
        }
        let before: Vec<OutboundMessage> = queue.iter().copied().collect();
        assert_eq!(queue.push(OutboundMessage::ack(AckReason::TxDrop)), Err(QueueFull));
        assert_eq!(queue.push(OutboundMessage::ack(AckReason::TxDrop)), Err(QueueFull));
        assert_eq!(queue.dropped(), 2);
        let after: Vec<OutboundMessage> = queue.iter().copied().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn indices_wrap_cleanly() {
        let mut queue = OutboundQueue::with_capacity(2);
        for round in 0..100u8 {
            let reason = AckReason::from_code(round % 6).unwrap();
            queue.push(OutboundMessage::ack(reason)).unwrap();
            assert_eq!(queue.pop().and_then(|m| m.ack_reason()), Some(reason));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.remaining(), 2);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = OutboundQueue::with_capacity(0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(OutboundQueue::new().capacity(), DEFAULT_QUEUE_DEPTH);
    }
}
