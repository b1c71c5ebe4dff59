use std::{fs, ops::Not, path::Path, time::Duration};

use log::warn;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;

const DEFAULT_EVENT_WAIT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 64;
const DEFAULT_EVENT_HISTORY_CAPACITY: usize = 32;
const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// Direction and bias of a requested line.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinMode {
    Output,
    Input,
    PullUp,
    PullDown,
}

impl PinMode {
    pub fn is_output(&self) -> bool {
        matches!(self, PinMode::Output)
    }

    pub fn is_input(&self) -> bool {
        matches!(self, PinMode::Input | PinMode::PullUp | PinMode::PullDown)
    }
}

// Numbering follows the classic wrapper enum: input, output, pull-up, pull-down.
impl From<u8> for PinMode {
    fn from(raw: u8) -> Self {
        match raw {
            0 => PinMode::Input,
            1 => PinMode::Output,
            2 => PinMode::PullUp,
            3 => PinMode::PullDown,
            other => {
                warn!("invalid pin mode {other}, falling back to floating input");
                PinMode::Input
            }
        }
    }
}

impl From<&str> for PinMode {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "output" | "out" => PinMode::Output,
            "input" | "in" | "floating" => PinMode::Input,
            "pull-up" | "pullup" => PinMode::PullUp,
            "pull-down" | "pulldown" => PinMode::PullDown,
            other => {
                warn!("invalid pin mode {other:?}, falling back to floating input");
                PinMode::Input
            }
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> Self {
        match level {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Self::Output {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Edge filter of an interrupt registration.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    pub fn matches(&self, observed: EdgeKind) -> bool {
        match self {
            Edge::Rising => observed == EdgeKind::Rising,
            Edge::Falling => observed == EdgeKind::Falling,
            Edge::Both => true,
        }
    }
}

/// Direction of an observed edge event.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Rising,
    Falling,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WrapperConfig {
    #[serde(default)]
    pub chip: u32,
    #[serde(default = "default_consumer")]
    pub consumer: String,
    #[serde(default = "default_event_wait_timeout_ms")]
    pub event_wait_timeout_ms: u64,
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default)]
    pub pins: FxHashMap<u32, PinMode>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            chip: 0,
            consumer: default_consumer(),
            event_wait_timeout_ms: DEFAULT_EVENT_WAIT_TIMEOUT_MS,
            event_buffer_capacity: DEFAULT_EVENT_BUFFER_CAPACITY,
            event_history_capacity: DEFAULT_EVENT_HISTORY_CAPACITY,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            pins: FxHashMap::default(),
        }
    }
}

impl WrapperConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.event_wait_timeout_ms == 0 {
            return Err(GpioError::Config(
                "event_wait_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.event_buffer_capacity == 0 || self.broadcast_capacity == 0 {
            return Err(GpioError::Config(
                "event buffer and broadcast capacities must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn chip_path(&self) -> String {
        chip_path(self.chip)
    }

    pub fn event_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.event_wait_timeout_ms)
    }
}

pub fn chip_path(index: u32) -> String {
    format!("/dev/gpiochip{index}")
}

fn default_consumer() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_event_wait_timeout_ms() -> u64 {
    DEFAULT_EVENT_WAIT_TIMEOUT_MS
}

fn default_event_buffer_capacity() -> usize {
    DEFAULT_EVENT_BUFFER_CAPACITY
}

fn default_event_history_capacity() -> usize {
    DEFAULT_EVENT_HISTORY_CAPACITY
}

fn default_broadcast_capacity() -> usize {
    DEFAULT_BROADCAST_CAPACITY
}
