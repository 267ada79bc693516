//! The two ends of the simulated link.

pub mod source;
pub mod station;

pub use source::{AckDecoder, Source, SourceConfig, SourceCounters};
pub use station::{RxCounters, RxEvent, RxStep, Station, StationConfig};
