use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::{Level, PinMode};
use crate::error::GpioError;
use crate::gpio::{LineDriver, LineRequest};

struct PinEntry<L> {
    mode: PinMode,
    line: Arc<L>,
}

/// Owns the line request of every configured pin.
///
/// The registry holds the only strong reference to a line; background tasks
/// hold weak ones, so removing an entry is what releases the line.
pub struct PinRegistry<L: LineRequest> {
    pins: RwLock<FxHashMap<u32, PinEntry<L>>>, // keyed by line offset
}

impl<L: LineRequest> Default for PinRegistry<L> {
    fn default() -> Self {
        Self {
            pins: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<L: LineRequest> PinRegistry<L> {
    /// Requests the line unless the pin is already present. Returns whether a
    /// new request was made.
    pub fn configure<D>(&self, driver: &D, pin: u32, mode: PinMode) -> Result<bool, GpioError>
    where
        D: LineDriver<Line = L>,
    {
        if let Some(entry) = self.pins.read().get(&pin) {
            if entry.mode != mode {
                warn!(
                    "pin {pin} already configured as {:?}, ignoring {mode:?}",
                    entry.mode
                );
            }
            return Ok(false);
        }

        let line = driver.request_line(pin, mode)?;
        self.pins.write().insert(
            pin,
            PinEntry {
                mode,
                line: Arc::new(line),
            },
        );
        debug!("pin {pin} configured as {mode:?}");
        Ok(true)
    }

    pub fn contains(&self, pin: u32) -> bool {
        self.pins.read().contains_key(&pin)
    }

    pub fn mode(&self, pin: u32) -> Result<PinMode, GpioError> {
        self.pins
            .read()
            .get(&pin)
            .map(|entry| entry.mode)
            .ok_or(GpioError::NotConfigured(pin))
    }

    pub fn line(&self, pin: u32) -> Result<Arc<L>, GpioError> {
        self.pins
            .read()
            .get(&pin)
            .map(|entry| entry.line.clone())
            .ok_or(GpioError::NotConfigured(pin))
    }

    pub fn pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.pins.read().keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    pub fn set(&self, pin: u32, level: Level) -> Result<(), GpioError> {
        self.line(pin)?.set_value(pin, level)
    }

    pub fn get(&self, pin: u32) -> Result<Level, GpioError> {
        self.line(pin)?.value(pin)
    }

    /// Drops the entry, releasing the line. No-op if absent.
    pub fn release(&self, pin: u32) -> bool {
        let entry = self.pins.write().remove(&pin);
        match entry {
            Some(entry) => {
                drop(entry);
                debug!("pin {pin} released");
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let drained: Vec<(u32, PinEntry<L>)> = self.pins.write().drain().collect();
        for (pin, entry) in drained {
            drop(entry);
            debug!("pin {pin} released");
        }
    }
}
