pub mod campaign;
pub mod config;
pub mod control_thread;
pub mod fault_injection;
pub mod link;
pub mod node;
pub mod tick_thread;

pub mod prelude {
    pub use crate::campaign::{Campaign, CampaignReport};
    pub use crate::config::{Args, Config, ConfigError};
    pub use crate::control_thread::ControlThread;
    pub use crate::fault_injection::control::{Command, ControlError};
    pub use crate::fault_injection::record::{FiEvent, RecordMode};
    pub use crate::fault_injection::sites::{Policy, SiteCounters, SiteId, Trigger, WindowBasis};
    pub use crate::fault_injection::{EngineConfig, EngineError, FaultEngine};
    pub use crate::link::arinc::ArincWord;
    pub use crate::link::barrier::{BarrierChain, Plausibility, Verdict};
    pub use crate::link::codec::{FrameFormat, ParseOutcome, Parser};
    pub use crate::link::queue::{AckReason, OutboundMessage, OutboundQueue};
    pub use crate::link::resilience::{LinkError, LinkHealth, TxConfig, TxManager};
    pub use crate::link::transport::{Clock, LoopbackTransport, SendStatus, TickClock, Transport};
    pub use crate::node::{Source, SourceConfig, Station, StationConfig};
    pub use crate::tick_thread::TickThread;
}
