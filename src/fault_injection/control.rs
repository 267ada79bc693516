//! Control surface of the fault engine.
//!
//! Commands are small text lines, e.g. `arm rx every 200 bits 3`. A leading
//! `fi` token is accepted and ignored.
//!
//! ```text
//!   en 0|1                          enable / disable injection
//!   msk HEX                         feature mask
//!   pct 0..100                      fire probability
//!   seed HEX                        reseed the PRNG
//!   arm SITE every N [bits M]       every-N policy
//!   arm SITE window START END [ms]  window policy (hits, or milliseconds)
//!   off                             disable all sites
//!   dump                            per-site counters
//!   log                             event log
//! ```

use super::sites::{SiteId, ALL_SITES};
use super::{EngineError, FaultEngine};
use crate::config::parse_hex;
use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("Missing argument for {0}")]
    MissingArgument(&'static str),

    #[error("Invalid number {0:?}")]
    InvalidNumber(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A parsed control command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Enable(bool),
    SetMask(u32),
    SetProbability(u32),
    SetSeed(u32),
    ArmEveryN {
        site: SiteId,
        n: u32,
        bits: Option<u8>,
    },
    ArmWindow {
        site: SiteId,
        start: u32,
        end: u32,
        millis: bool,
    },
    DisableAll,
    DumpCounters,
    DumpLog,
}

fn parse_dec(token: &str) -> Result<u32, ControlError> {
    let parsed = match token.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => token.parse::<u32>(),
    };
    parsed.map_err(|_| ControlError::InvalidNumber(token.to_string()))
}

fn next_arg<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    name: &'static str,
) -> Result<&'a str, ControlError> {
    tokens.next().ok_or(ControlError::MissingArgument(name))
}

fn parse_hex_u32(token: &str) -> Result<u32, ControlError> {
    parse_hex(token)
        .ok()
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| ControlError::InvalidNumber(token.to_string()))
}

impl Command {
    /// Parses one command line.
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let mut tokens = line.split_whitespace().peekable();
        if tokens.peek() == Some(&"fi") {
            tokens.next();
        }
        let command = tokens.next().ok_or(ControlError::Empty)?;

        match command {
            "en" => Ok(Command::Enable(next_arg(&mut tokens, "en")? == "1")),
            "msk" => Ok(Command::SetMask(parse_hex_u32(next_arg(&mut tokens, "msk")?)?)),
            "pct" => Ok(Command::SetProbability(parse_dec(next_arg(&mut tokens, "pct")?)?)),
            "seed" => Ok(Command::SetSeed(parse_hex_u32(next_arg(&mut tokens, "seed")?)?)),
            "off" => Ok(Command::DisableAll),
            "dump" => Ok(Command::DumpCounters),
            "log" => Ok(Command::DumpLog),
            "arm" => {
                let site = SiteId::from_name(next_arg(&mut tokens, "arm")?)?;
                match next_arg(&mut tokens, "policy")? {
                    "every" => {
                        let n = parse_dec(next_arg(&mut tokens, "every")?)?;
                        let bits = match tokens.next() {
                            Some("bits") => {
                                let bits = parse_dec(next_arg(&mut tokens, "bits")?)?;
                                Some(bits.min(u32::from(u8::MAX)) as u8)
                            }
                            Some(other) => {
                                return Err(ControlError::UnknownCommand(other.to_string()))
                            }
                            None => None,
                        };
                        Ok(Command::ArmEveryN { site, n, bits })
                    }
                    "window" => {
                        let start = parse_dec(next_arg(&mut tokens, "window start")?)?;
                        let end = parse_dec(next_arg(&mut tokens, "window end")?)?;
                        let millis = tokens.next() == Some("ms");
                        Ok(Command::ArmWindow {
                            site,
                            start,
                            end,
                            millis,
                        })
                    }
                    other => Err(ControlError::UnknownCommand(other.to_string())),
                }
            }
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }

    /// Applies the command and returns the text reply for the operator.
    pub fn apply(&self, engine: &mut FaultEngine) -> Result<String, ControlError> {
        match *self {
            Command::Enable(enabled) => {
                engine.set_enabled(enabled);
                Ok(format!("FI enabled={}", u8::from(engine.is_enabled())))
            }
            Command::SetMask(mask) => {
                engine.set_mask(mask);
                Ok(format!("mask=0x{:08x}", engine.mask()))
            }
            Command::SetProbability(percent) => {
                engine.set_probability(percent)?;
                Ok(format!("pct={}", engine.probability()))
            }
            Command::SetSeed(seed) => {
                engine.set_seed(seed);
                Ok("seed set".to_string())
            }
            Command::ArmEveryN { site, n, bits } => {
                engine.arm_every_n(site, n)?;
                if let Some(bits) = bits {
                    engine.set_bits_to_flip(site, bits);
                }
                Ok(format!("Armed {} EVERY {}", site, n))
            }
            Command::ArmWindow {
                site,
                start,
                end,
                millis,
            } => {
                if millis {
                    engine.arm_window_ms(site, start, end)?;
                } else {
                    engine.arm_window(site, start, end)?;
                }
                Ok(format!(
                    "Armed {} WINDOW [{},{}){}",
                    site,
                    start,
                    end,
                    if millis { " ms" } else { "" }
                ))
            }
            Command::DisableAll => {
                engine.disable_all();
                Ok("FI disabled (all sites)".to_string())
            }
            Command::DumpCounters => Ok(dump_counters(engine)),
            Command::DumpLog => Ok(dump_log(engine)),
        }
    }
}

/// Formats the per-site policy and counters table.
pub fn dump_counters(engine: &FaultEngine) -> String {
    let header = format!(
        "FI sites (enabled={} mask=0x{:08x} pct={}):",
        u8::from(engine.is_enabled()),
        engine.mask(),
        engine.probability()
    );
    let rows = ALL_SITES.iter().map(|site| {
        let state = engine.site(*site);
        format!(
            "  {:<18} policy={:<28} hit={} fire={} bits={}",
            site.to_string(),
            state.policy.to_string(),
            state.hit_count,
            state.fire_count,
            state.bits_to_flip
        )
    });
    std::iter::once(header).chain(rows).join("\n")
}

/// Formats the retained event log, oldest first.
pub fn dump_log(engine: &FaultEngine) -> String {
    let log = engine.events();
    let header = format!(
        "FI event log ({} of {} retained):",
        log.len(),
        log.total_written()
    );
    std::iter::once(header)
        .chain(log.iter().map(|event| format!("  {event}")))
        .join("\n")
}
