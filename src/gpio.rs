use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::{Edge, EdgeKind, Level, PinMode, WrapperConfig};
use crate::error::GpioError;
use crate::interrupt::{Dispatcher, IntoInterruptHandler};
use crate::pattern::{self, PatternSpec, Repeat};
use crate::registry::PinRegistry;
use crate::supervisor::{PinLocks, TaskKind, TaskSupervisor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeEvent {
    pub pin: u32,
    pub edge: EdgeKind,
    pub timestamp_ns: u64,
}

/// Records dispatched edges per pin and fans them out to subscribers.
pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: RwLock<FxHashMap<u32, VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
}

impl EventCallbackHandler {
    pub fn new(broadcast_capacity: usize, event_history_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            event_tx,
            event_history: RwLock::new(FxHashMap::default()),
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        if self.event_history_capacity > 0 {
            let mut history = self.event_history.write();
            let events = history.entry(event.pin).or_default();
            while events.len() >= self.event_history_capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        // no subscribers is not an error
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_tx.subscribe()
    }

    pub fn events(&self, pin: u32, limit: Option<usize>) -> Vec<EdgeEvent> {
        let history = self.event_history.read();
        let Some(events) = history.get(&pin) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |lim| events.len().saturating_sub(lim));
        events.iter().skip(skip).cloned().collect()
    }

    pub fn last_event(&self, pin: u32) -> Option<EdgeEvent> {
        self.event_history
            .read()
            .get(&pin)
            .and_then(|events| events.back().cloned())
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

/// A chip capable of handing out single line requests. Dropping the driver
/// closes the chip.
pub trait LineDriver: Send + Sync + 'static {
    type Line: LineRequest;

    fn request_line(&self, offset: u32, mode: PinMode) -> Result<Self::Line, GpioError>;
}

/// One requested line. Dropping it releases the line.
pub trait LineRequest: Send + Sync + 'static {
    fn set_value(&self, offset: u32, level: Level) -> Result<(), GpioError>;
    fn value(&self, offset: u32) -> Result<Level, GpioError>;
    fn set_edge_detection(&self, offset: u32, edge: Option<Edge>) -> Result<(), GpioError>;
    /// Returns `Ok(false)` when the timeout elapsed without an event.
    fn wait_edge_events(&self, timeout: Duration) -> Result<bool, GpioError>;
    fn read_edge_events(&self) -> Result<Vec<EdgeEvent>, GpioError>;
}

/// Pin level access plus blink, pwm, pattern and interrupt helpers on top of
/// a single GPIO chip.
///
/// Dropping the wrapper stops every background task before any line is
/// released, then closes the chip.
pub struct GpioWrapper<D: LineDriver> {
    config: WrapperConfig,
    supervisor: TaskSupervisor,
    registry: PinRegistry<D::Line>,
    pin_locks: PinLocks,
    event_handler: EventHandler,
    driver: D, // dropped last
}

impl<D: LineDriver> GpioWrapper<D> {
    pub fn with_driver(driver: D, config: WrapperConfig) -> Result<Self, GpioError> {
        config.validate()?;

        let event_handler = Arc::new(EventCallbackHandler::new(
            config.broadcast_capacity,
            config.event_history_capacity,
        ));
        let wrapper = Self {
            supervisor: TaskSupervisor::default(),
            registry: PinRegistry::default(),
            pin_locks: PinLocks::default(),
            event_handler,
            driver,
            config,
        };

        let mut initial: Vec<(u32, PinMode)> = wrapper
            .config
            .pins
            .iter()
            .map(|(pin, mode)| (*pin, *mode))
            .collect();
        initial.sort_unstable_by_key(|(pin, _)| *pin);
        for (pin, mode) in initial {
            wrapper.configure_pin(pin, mode)?;
        }

        Ok(wrapper)
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    // ----------------- basic access -----------------

    pub fn configure_pin(&self, pin: u32, mode: impl Into<PinMode>) -> Result<(), GpioError> {
        let mode = mode.into();
        self.with_pin_lock(pin, || {
            self.registry.configure(&self.driver, pin, mode)?;
            Ok(())
        })
    }

    pub fn set_pin(&self, pin: u32, level: Level) -> Result<(), GpioError> {
        self.registry.set(pin, level)
    }

    pub fn get_pin(&self, pin: u32) -> Result<Level, GpioError> {
        self.registry.get(pin)
    }

    pub fn toggle_pin(&self, pin: u32) -> Result<Level, GpioError> {
        self.require_output(pin)?;
        let level = !self.registry.get(pin)?;
        self.registry.set(pin, level)?;
        Ok(level)
    }

    /// Stops the pattern and interrupt tasks of `pin`, then releases its line.
    pub fn reset_pin(&self, pin: u32) -> Result<(), GpioError> {
        self.with_pin_lock(pin, || {
            if !self.registry.contains(pin) {
                return Err(GpioError::NotConfigured(pin));
            }
            self.supervisor.stop(pin, TaskKind::Pattern);
            self.supervisor.stop(pin, TaskKind::Interrupt);
            self.registry.release(pin);
            info!("pin {pin} reset");
            Ok(())
        })
    }

    pub fn is_configured(&self, pin: u32) -> bool {
        self.registry.contains(pin)
    }

    pub fn configured_pins(&self) -> Vec<u32> {
        self.registry.pins()
    }

    pub fn pin_mode(&self, pin: u32) -> Result<PinMode, GpioError> {
        self.registry.mode(pin)
    }

    // ----------------- patterns -----------------

    pub fn blink_pin(&self, pin: u32, interval_ms: u64, repeat: Repeat) -> Result<(), GpioError> {
        self.start_pattern(pin, PatternSpec::blink(interval_ms, repeat)?)
    }

    pub fn pwm_pin(&self, pin: u32, duty_percent: u32, frequency_hz: u32) -> Result<(), GpioError> {
        self.start_pattern(pin, PatternSpec::pwm(duty_percent, frequency_hz)?)
    }

    /// Alternates `pin` between two levels every `interval_ms` until stopped.
    pub fn detach_pin(
        &self,
        pin: u32,
        first: Level,
        second: Level,
        interval_ms: u64,
    ) -> Result<(), GpioError> {
        self.start_pattern(pin, PatternSpec::alternate(first, second, interval_ms)?)
    }

    /// Runs `spec` on `pin`, stopping and joining any pattern already running there.
    pub fn start_pattern(&self, pin: u32, spec: PatternSpec) -> Result<(), GpioError> {
        self.with_pin_lock(pin, || {
            let line = Arc::downgrade(&self.require_output(pin)?);
            self.supervisor.start(pin, TaskKind::Pattern, move |cancel| {
                pattern::run(pin, line, spec, &cancel)
            })?;
            debug!("pattern started on pin {pin}");
            Ok(())
        })
    }

    /// Returns whether a pattern was attached, including one that already
    /// finished on its own.
    pub fn stop_pattern(&self, pin: u32) -> bool {
        self.with_pin_lock(pin, || {
            self.supervisor.stop(pin, TaskKind::Pattern).is_some()
        })
    }

    /// False once a finite pattern has run out or after it was stopped.
    pub fn is_pattern_running(&self, pin: u32) -> bool {
        self.supervisor.is_running(pin, TaskKind::Pattern)
    }

    // ----------------- interrupts -----------------

    /// Calls `callback` for every `edge` seen on `pin`, replacing any listener
    /// already attached. The callback may take no argument or the pin number.
    pub fn attach_interrupt<F, Args>(
        &self,
        pin: u32,
        edge: Edge,
        callback: F,
    ) -> Result<(), GpioError>
    where
        F: IntoInterruptHandler<Args>,
    {
        let callback = callback.into_handler();
        self.with_pin_lock(pin, || {
            let mode = self.registry.mode(pin)?;
            if !mode.is_input() {
                return Err(GpioError::InvalidState(format!(
                    "pin {pin} must be in an input mode to attach an interrupt"
                )));
            }
            let line = self.registry.line(pin)?;

            // reconfigure first so a failure leaves the old listener in place
            if let Err(e) = line.set_edge_detection(pin, Some(edge)) {
                warn!("failed to enable {edge:?} edge detection on pin {pin}: {e}");
                return Err(e);
            }
            self.supervisor.stop(pin, TaskKind::Interrupt);

            let dispatcher = Dispatcher {
                pin,
                edge,
                line: Arc::downgrade(&line),
                callback,
                events: self.event_handler.clone(),
                wait_timeout: self.config.event_wait_timeout(),
            };
            drop(line);

            if let Err(e) = self
                .supervisor
                .start(pin, TaskKind::Interrupt, move |cancel| dispatcher.run(&cancel))
            {
                warn!("failed to start interrupt listener on pin {pin}: {e}");
                self.disable_edge_detection(pin);
                return Err(e);
            }
            debug!("interrupt attached on pin {pin} for {edge:?} edges");
            Ok(())
        })
    }

    /// Stops and joins the listener of `pin`. Returns whether one was attached,
    /// including one that already exited on its own.
    pub fn detach_interrupt(&self, pin: u32) -> bool {
        self.with_pin_lock(pin, || {
            if self.supervisor.stop(pin, TaskKind::Interrupt).is_none() {
                return false;
            }
            self.disable_edge_detection(pin);
            debug!("interrupt detached from pin {pin}");
            true
        })
    }

    pub fn has_interrupt(&self, pin: u32) -> bool {
        self.supervisor.contains(pin, TaskKind::Interrupt)
    }

    /// False once the listener has exited, whether stopped or after giving up
    /// on driver errors.
    pub fn is_interrupt_running(&self, pin: u32) -> bool {
        self.supervisor.is_running(pin, TaskKind::Interrupt)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_handler.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<EdgeEvent> {
        BroadcastStream::new(self.event_handler.subscribe())
    }

    pub fn events(&self, pin: u32, limit: Option<usize>) -> Result<Vec<EdgeEvent>, GpioError> {
        self.registry.mode(pin)?;
        Ok(self.event_handler.events(pin, limit))
    }

    pub fn last_event(&self, pin: u32) -> Result<Option<EdgeEvent>, GpioError> {
        self.registry.mode(pin)?;
        Ok(self.event_handler.last_event(pin))
    }

    fn disable_edge_detection(&self, pin: u32) {
        if let Ok(line) = self.registry.line(pin)
            && let Err(e) = line.set_edge_detection(pin, None)
        {
            warn!("failed to disable edge detection on pin {pin}: {e}");
        }
    }

    /// Runs a lifecycle operation under the per-pin lock. The lock entry is
    /// dropped again once the pin is not configured.
    fn with_pin_lock<T>(&self, pin: u32, op: impl FnOnce() -> T) -> T {
        let lock = self.pin_locks.get(pin);
        let result = {
            let _guard = lock.lock();
            op()
        };
        if !self.registry.contains(pin) {
            self.pin_locks.prune(pin, &lock);
        }
        result
    }

    fn require_output(&self, pin: u32) -> Result<Arc<D::Line>, GpioError> {
        if !self.registry.mode(pin)?.is_output() {
            return Err(GpioError::InvalidState(format!(
                "pin {pin} must be in output mode"
            )));
        }
        self.registry.line(pin)
    }
}

impl<D: LineDriver> Drop for GpioWrapper<D> {
    fn drop(&mut self) {
        let exits = self.supervisor.stop_all();
        if !exits.is_empty() {
            debug!("stopped {} background tasks", exits.len());
        }
        self.registry.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDriver;

    fn wrapper() -> GpioWrapper<MockDriver> {
        GpioWrapper::with_driver(MockDriver::default(), WrapperConfig::default()).unwrap()
    }

    #[test]
    fn pin_locks_are_dropped_for_unconfigured_pins() {
        let gpio = wrapper();

        assert!(matches!(gpio.reset_pin(5), Err(GpioError::NotConfigured(5))));
        assert!(!gpio.stop_pattern(6));
        assert!(!gpio.detach_interrupt(7));
        assert!(gpio.set_pin(8, Level::High).is_err());
        assert_eq!(gpio.pin_locks.len(), 0);

        gpio.configure_pin(5, PinMode::Output).unwrap();
        assert_eq!(gpio.pin_locks.len(), 1);
        gpio.reset_pin(5).unwrap();
        assert_eq!(gpio.pin_locks.len(), 0);
    }

    #[test]
    fn failed_configure_leaves_no_lock_behind() {
        let gpio = wrapper();
        gpio.driver().fail_requests(9);

        assert!(gpio.configure_pin(9, PinMode::Input).is_err());
        assert_eq!(gpio.pin_locks.len(), 0);
    }
}
