use crate::campaign::{Campaign, DEFAULT_BYTES_PER_PUMP};
use crate::fault_injection::control::{Command, ControlError};
use crate::fault_injection::record::RecordMode;
use crate::fault_injection::sites::Trigger;
use crate::fault_injection::{EngineConfig, EngineError, FaultEngine};
use crate::link::barrier::DEFAULT_MIN_INTERVAL_MS;
use crate::link::queue::DEFAULT_QUEUE_DEPTH;
use crate::link::resilience::TxConfig;
use crate::node::{SourceConfig, StationConfig};
use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse JSON5 config: {0}")]
    Parse(String),

    #[error("Invalid arming command {command:?}: {source}")]
    Arming {
        command: String,
        source: ControlError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Parses a hex number with or without `0x` prefix.
pub fn parse_hex(s: &str) -> Result<u64, String> {
    let cleaned = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(cleaned, 16)
        .map_err(|e| format!("'{}' is not a valid hex number: {}", s, e))
}

/// Hex parser for 32 bit CLI values.
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let value = parse_hex(s)?;
    u32::try_from(value).map_err(|_| format!("'{}' does not fit in 32 bits", s))
}

fn hex_value<E: serde::de::Error>(value: serde_json::Value) -> Result<u64, E> {
    match value {
        serde_json::Value::String(s) => parse_hex(&s).map_err(E::custom),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| E::custom("Number must be a positive integer")),
        _ => Err(E::custom("Value must be a hex string or a number")),
    }
}

/// Accepts `"0xC0FFEE01"` or a plain number.
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = hex_value(serde_json::Value::deserialize(deserializer)?)?;
    u32::try_from(value)
        .map_err(|_| D::Error::custom(format!("{:#x} does not fit in 32 bits", value)))
}

/// Custom deserializer for label lists that can handle both hex strings and numbers
fn deserialize_labels<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct LabelsVisitor;

    impl<'de> Visitor<'de> for LabelsVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an array of labels (strings like \"0x1A\" or numbers)")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Vec<u8>, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut labels = Vec::new();
            while let Some(value) = seq.next_element::<serde_json::Value>()? {
                let label = hex_value::<A::Error>(value)?;
                let label = u8::try_from(label)
                    .map_err(|_| de::Error::custom(format!("Label {:#x} exceeds 8 bits", label)))?;
                labels.push(label);
            }
            Ok(labels)
        }
    }

    deserializer.deserialize_seq(LabelsVisitor)
}

/// Configuration structure that can be loaded from JSON5
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub seed: u32,
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub mask: u32,
    pub probability: u8,
    pub every_n_trigger: Trigger,
    pub record_mode: RecordMode,
    /// Control commands applied before the campaign starts.
    pub arm: Vec<String>,
    #[serde(deserialize_with = "deserialize_labels")]
    pub allowed_labels: Vec<u8>,
    pub min_interval_ms: u32,
    pub tx: TxConfig,
    pub queue_depth: usize,
    pub word_period_ms: u32,
    /// Words to emit, unlimited when absent.
    pub words: Option<u32>,
    pub telemetry_period_ms: u32,
    pub tick_ms: u32,
    pub duration_ms: u32,
    pub bytes_per_pump: usize,
}

impl Default for Config {
    /// The deterministic reference campaign.
    fn default() -> Self {
        Self {
            seed: 0xC0FF_EE01,
            enabled: true,
            mask: u32::MAX,
            probability: 100,
            every_n_trigger: Trigger::OneShot,
            record_mode: RecordMode::AllDecisions,
            arm: vec![
                "arm rx every 200 bits 3".to_string(),
                "arm txbusy every 100".to_string(),
                "arm txstall window 500 520".to_string(),
            ],
            allowed_labels: vec![0x01, 0x02, 0x03, 0x04],
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            tx: TxConfig::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            word_period_ms: 25,
            words: None,
            telemetry_period_ms: 1000,
            tick_ms: 10,
            duration_ms: 20_000,
            bytes_per_pump: DEFAULT_BYTES_PER_PUMP,
        }
    }
}

impl Config {
    /// Load configuration from JSON5 file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_json5(&content)
    }

    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Override config values with command line arguments
    pub fn override_with_args(&mut self, args: &Args) {
        // Only values given on the command line replace file values
        if let Some(seed) = args.seed {
            self.seed = seed;
        }
        if let Some(mask) = args.mask {
            self.mask = mask;
        }
        if let Some(probability) = args.probability {
            self.probability = probability;
        }
        if args.enable {
            self.enabled = true;
        }
        if args.disable {
            self.enabled = false;
        }
        if let Some(duration_ms) = args.duration_ms {
            self.duration_ms = duration_ms;
        }
        if args.words.is_some() {
            self.words = args.words;
        }
        if !args.arm.is_empty() {
            self.arm = args.arm.clone();
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            seed: self.seed,
            enabled: self.enabled,
            mask: self.mask,
            probability: self.probability,
            every_n_trigger: self.every_n_trigger,
            record_mode: self.record_mode,
        }
    }

    pub fn station_config(&self) -> StationConfig {
        StationConfig {
            allowed_labels: self.allowed_labels.clone(),
            min_interval_ms: self.min_interval_ms,
            queue_depth: self.queue_depth,
            tx: self.tx,
            telemetry_period_ms: self.telemetry_period_ms,
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            labels: self.allowed_labels.clone(),
            word_period_ms: self.word_period_ms,
            word_count: self.words,
            telemetry_period_ms: self.telemetry_period_ms,
            queue_depth: self.queue_depth,
            tx: self.tx,
        }
    }

    /// Builds an engine with every arming command applied.
    pub fn build_engine(&self) -> Result<FaultEngine, ConfigError> {
        if self.probability > 100 {
            return Err(EngineError::ProbabilityOutOfRange(u32::from(self.probability)).into());
        }
        let mut engine = FaultEngine::new(self.engine_config());
        for line in &self.arm {
            Command::parse(line)
                .and_then(|command| command.apply(&mut engine))
                .map_err(|source| ConfigError::Arming {
                    command: line.clone(),
                    source,
                })?;
        }
        Ok(engine)
    }

    pub fn build_campaign(&self) -> Result<Campaign, ConfigError> {
        Ok(Campaign::new(
            self.build_engine()?,
            self.source_config(),
            &self.station_config(),
            self.bytes_per_pump,
        ))
    }
}

/// Command-line arguments of the link fault injector.
///
/// Values given here override the configuration file, which in turn
/// overrides the built-in reference campaign.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load configuration from JSON5 file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// PRNG seed (hex)
    #[arg(short, long, value_parser = parse_hex_u32)]
    pub seed: Option<u32>,

    /// Site feature mask (hex), bit n enables site n
    #[arg(short, long, value_parser = parse_hex_u32)]
    pub mask: Option<u32>,

    /// Fire probability in percent
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub probability: Option<u8>,

    /// Enable fault injection
    #[arg(long, default_value_t = false)]
    pub enable: bool,

    /// Disable fault injection (clean run)
    #[arg(long, default_value_t = false, conflicts_with = "enable")]
    pub disable: bool,

    /// Campaign duration in milliseconds
    #[arg(short, long)]
    pub duration_ms: Option<u32>,

    /// Number of avionics words to send
    #[arg(short, long)]
    pub words: Option<u32>,

    /// Arming command, replaces the configured arming list. Repeatable.
    ///   E.g.: --arm "arm rx every 200 bits 3" --arm "arm txbusy every 100"
    #[arg(long, verbatim_doc_comment)]
    pub arm: Vec<String>,

    /// Run against the wall clock and read control commands from stdin
    #[arg(short, long, default_value_t = false)]
    pub interactive: bool,

    /// Print the fault event log after the run
    #[arg(long, default_value_t = false)]
    pub dump_log: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_injection::sites::{Policy, SiteId, WindowBasis};

    #[test]
    fn hex_parsing() {
        assert_eq!(parse_hex("0xC0FFEE01"), Ok(0xC0FF_EE01));
        assert_eq!(parse_hex("1f"), Ok(0x1F));
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex_u32("0x100000000").is_err());
        assert!(parse_hex_u32("100000000").is_err());
    }

    #[test]
    fn default_campaign_arming() {
        let engine = Config::default().build_engine().unwrap();
        assert!(engine.is_enabled());
        assert_eq!(
            engine.site(SiteId::RxCorrupt).policy,
            Policy::EveryN {
                n: 200,
                trigger: Trigger::OneShot
            }
        );
        assert_eq!(engine.site(SiteId::RxCorrupt).bits_to_flip, 3);
        assert_eq!(
            engine.site(SiteId::TxStall).policy,
            Policy::Window {
                start: 500,
                end: 520,
                basis: WindowBasis::Hits
            }
        );
        assert_eq!(engine.site(SiteId::LabelTamper).policy, Policy::Disabled);
    }

    #[test]
    fn json5_file_with_hex_values() {
        let config = Config::from_json5(
            r#"{
                // comments are fine in JSON5
                seed: "0x1234",
                mask: 3,
                probability: 50,
                every_n_trigger: "repeating",
                record_mode: "fired_only",
                allowed_labels: ["0x10", 17],
                tx: { max_busy_retries: 5 },
                arm: ["arm label every 4"],
                words: 10,
            }"#,
        )
        .unwrap();
        assert_eq!(config.seed, 0x1234);
        assert_eq!(config.mask, 3);
        assert_eq!(config.every_n_trigger, Trigger::Repeating);
        assert_eq!(config.record_mode, RecordMode::FiredOnly);
        assert_eq!(config.allowed_labels, vec![0x10, 0x11]);
        assert_eq!(config.tx.max_busy_retries, 5);
        assert_eq!(config.tx.stall_threshold_ms, 100);
        assert_eq!(config.words, Some(10));
        assert_eq!(config.duration_ms, Config::default().duration_ms);

        let engine = config.build_engine().unwrap();
        assert_eq!(
            engine.site(SiteId::LabelTamper).policy,
            Policy::EveryN {
                n: 4,
                trigger: Trigger::Repeating
            }
        );
    }

    #[test]
    fn unknown_fields_and_bad_labels_are_rejected() {
        assert!(matches!(
            Config::from_json5("{ sead: 1 }"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_json5("{ allowed_labels: [256] }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn bad_arming_command_is_reported() {
        let config = Config {
            arm: vec!["arm rx every 0".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.build_engine(),
            Err(ConfigError::Arming {
                source: ControlError::Engine(EngineError::ZeroInterval),
                ..
            })
        ));
    }

    #[test]
    fn cli_overrides_file() {
        let mut config = Config::default();
        let args = Args {
            seed: Some(7),
            disable: true,
            words: Some(3),
            arm: vec!["off".to_string()],
            ..Default::default()
        };
        config.override_with_args(&args);
        assert_eq!(config.seed, 7);
        assert!(!config.enabled);
        assert_eq!(config.words, Some(3));
        assert_eq!(config.arm, vec!["off".to_string()]);
        assert_eq!(config.mask, u32::MAX);
    }
}
