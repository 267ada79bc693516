//! Transmit resilience manager.
//!
//! Wraps a non-blocking [`Transport`] with the `TX_API_FAIL` and `TX_STALL`
//! injection points, progress based stall detection and the queue servicing
//! policy:
//!
//! * the head of the [`OutboundQueue`] is peeked, never popped, while a send
//!   is attempted or in flight;
//! * `Busy` leaves it queued and counts a retry;
//! * a genuine transport error pops and drops it;
//! * it is popped once the transfer completes;
//! * a stalled transfer is aborted and the same message is sent again.
//!
//! A simulated stall swallows the completion of an otherwise healthy
//! transfer, so a recovered message may reach the peer twice.

use super::queue::OutboundQueue;
use super::transport::{SendStatus, Transport};
use crate::fault_injection::sites::SiteId;
use crate::fault_injection::FaultEngine;
use log::{debug, error, info, warn};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Transmit path entered safe mode after {0} consecutive busy responses")]
    SafeMode(u32),
}

/// Timing and retry budget of a [`TxManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Cadence of [`TxManager::poll_stall`] checks.
    pub poll_interval_ms: u32,
    /// A transfer without progress for longer than this is aborted.
    pub stall_threshold_ms: u32,
    /// Consecutive `Busy` results that trigger safe mode.
    pub max_busy_retries: u32,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            stall_threshold_ms: 100,
            max_busy_retries: 3,
        }
    }
}

/// State of the outstanding transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxSession {
    pub ongoing: bool,
    pub last_progress: u32,
    pub last_progress_ms: u32,
    /// The completion of this transfer is swallowed.
    pub stall_simulated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxCounters {
    /// `Busy` results, injected or real.
    pub retries: u32,
    /// Messages dropped after a genuine transport error.
    pub failures: u32,
    /// Stalled transfers aborted by the monitor.
    pub recoveries: u32,
    /// Transfers started.
    pub started: u32,
    /// Transfers completed and popped.
    pub completed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkHealth {
    #[default]
    Normal,
    /// Terminal fail-safe state, every send is refused.
    SafeMode,
}

/// Result of one [`TxManager::poll_stall`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCheck {
    /// Poll cadence not reached yet.
    NotDue,
    /// No transfer in flight.
    Idle,
    Progressing,
    /// No progress, threshold not exceeded.
    Waiting,
    /// Transfer aborted; the queued message will be sent again.
    Recovered,
}

/// Result of one [`TxManager::service`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Nothing queued.
    Idle,
    InFlight,
    Started,
    Completed,
    /// Transport busy, message stays queued.
    Retry,
    /// Transport error, message dropped.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct TxManager {
    config: TxConfig,
    session: TxSession,
    counters: TxCounters,
    health: LinkHealth,
    consecutive_busy: u32,
    last_poll_ms: Option<u32>,
    inject: bool,
}

impl TxManager {
    pub fn new(config: TxConfig) -> Self {
        Self {
            config,
            session: TxSession::default(),
            counters: TxCounters::default(),
            health: LinkHealth::Normal,
            consecutive_busy: 0,
            last_poll_ms: None,
            inject: true,
        }
    }

    /// A manager that never consults the transmit fault sites.
    pub fn without_injection(config: TxConfig) -> Self {
        Self {
            inject: false,
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn session(&self) -> &TxSession {
        &self.session
    }

    pub fn counters(&self) -> TxCounters {
        self.counters
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    pub fn is_busy(&self) -> bool {
        self.session.ongoing
    }

    /// Attempts to start sending `bytes`.
    ///
    /// An injected API failure returns `Busy` without touching the transport.
    /// The stall site is only consulted once a transfer has started; a stall
    /// marks the session so its completion is ignored.
    pub fn send_async<T: Transport>(
        &mut self,
        engine: &mut FaultEngine,
        transport: &mut T,
        bytes: &[u8],
        now_ms: u32,
    ) -> Result<SendStatus, LinkError> {
        if self.health == LinkHealth::SafeMode {
            return Err(LinkError::SafeMode(self.consecutive_busy));
        }

        let len = bytes.len() as u32;
        let head = u32::from(bytes.first().copied().unwrap_or(0));
        if self.inject && engine.should_fire_traced(SiteId::TxApiFail, len, head) {
            debug!("Injected TX API failure");
            return Ok(SendStatus::Busy);
        }

        let status = transport.send_nonblocking(bytes);
        if status == SendStatus::Success {
            let stall = self.inject && engine.should_fire_traced(SiteId::TxStall, len, head);
            self.session = TxSession {
                ongoing: true,
                last_progress: 0,
                last_progress_ms: now_ms,
                stall_simulated: stall,
            };
            if stall {
                debug!("Injected TX stall on {} byte transfer", len);
            }
        }
        Ok(status)
    }

    /// Stall monitor, runs at most once per poll interval.
    pub fn poll_stall<T: Transport>(&mut self, transport: &mut T, now_ms: u32) -> StallCheck {
        if let Some(last) = self.last_poll_ms {
            if now_ms.wrapping_sub(last) < self.config.poll_interval_ms {
                return StallCheck::NotDue;
            }
        }
        self.last_poll_ms = Some(now_ms);

        if !self.session.ongoing {
            return StallCheck::Idle;
        }
        let progress = transport.bytes_sent_so_far();
        if progress != self.session.last_progress {
            self.session.last_progress = progress;
            self.session.last_progress_ms = now_ms;
            return StallCheck::Progressing;
        }
        if now_ms.wrapping_sub(self.session.last_progress_ms) > self.config.stall_threshold_ms {
            self.counters.recoveries += 1;
            warn!(
                "TX stall detected at {} ms (send_count={}), aborting and retrying",
                now_ms, progress
            );
            self.abort(transport);
            return StallCheck::Recovered;
        }
        StallCheck::Waiting
    }

    /// Aborts the transfer in flight. Returns false when nothing was in flight.
    pub fn abort<T: Transport>(&mut self, transport: &mut T) -> bool {
        if !self.session.ongoing {
            return false;
        }
        transport.abort_send();
        self.session = TxSession::default();
        true
    }

    /// Runs one pass of the queue servicing policy.
    pub fn service<T: Transport>(
        &mut self,
        engine: &mut FaultEngine,
        transport: &mut T,
        queue: &mut OutboundQueue,
        now_ms: u32,
    ) -> Result<ServiceOutcome, LinkError> {
        if self.session.ongoing {
            if self.session.stall_simulated || transport.send_in_progress() {
                return Ok(ServiceOutcome::InFlight);
            }
            self.session = TxSession::default();
            queue.pop();
            self.counters.completed += 1;
            return Ok(ServiceOutcome::Completed);
        }

        let Some(message) = queue.peek().copied() else {
            return Ok(ServiceOutcome::Idle);
        };

        match self.send_async(engine, transport, message.as_slice(), now_ms)? {
            SendStatus::Success => {
                self.consecutive_busy = 0;
                self.counters.started += 1;
                Ok(ServiceOutcome::Started)
            }
            SendStatus::Busy => {
                self.counters.retries += 1;
                self.consecutive_busy += 1;
                if self.consecutive_busy >= self.config.max_busy_retries {
                    self.health = LinkHealth::SafeMode;
                    error!(
                        "{} consecutive busy responses, entering safe mode",
                        self.consecutive_busy
                    );
                    return Err(LinkError::SafeMode(self.consecutive_busy));
                }
                Ok(ServiceOutcome::Retry)
            }
            SendStatus::Error => {
                self.consecutive_busy = 0;
                self.counters.failures += 1;
                queue.pop();
                info!("TX failure, dropped {:?}", message);
                Ok(ServiceOutcome::Dropped)
            }
        }
    }
}
