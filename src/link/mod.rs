//! Serial link: framing, avionics words, validation barriers, the outbound
//! queue and the resilient transmit path.

pub mod arinc;
pub mod barrier;
pub mod codec;
pub mod queue;
pub mod resilience;
pub mod transport;
