use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::config::Edge;
use crate::gpio::{EventHandler, LineRequest};
use crate::supervisor::{DriverErrorBudget, park_unless_cancelled};

/// Callback invoked with the pin number of a matching edge.
pub type InterruptHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Converts user callbacks taking either no argument or the pin number into
/// an [`InterruptHandler`].
pub trait IntoInterruptHandler<Args> {
    fn into_handler(self) -> InterruptHandler;
}

impl<F> IntoInterruptHandler<()> for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn into_handler(self) -> InterruptHandler {
        Arc::new(move |_pin: u32| self())
    }
}

impl<F> IntoInterruptHandler<(u32,)> for F
where
    F: Fn(u32) + Send + Sync + 'static,
{
    fn into_handler(self) -> InterruptHandler {
        Arc::new(self)
    }
}

pub(crate) struct Dispatcher<L> {
    pub pin: u32,
    pub edge: Edge,
    pub line: Weak<L>,
    pub callback: InterruptHandler,
    pub events: EventHandler,
    pub wait_timeout: Duration,
}

impl<L: LineRequest> Dispatcher<L> {
    /// Waits for edges with a bounded timeout so the flag is rechecked at
    /// least once per timeout even on a silent line. Driver errors back off
    /// and the listener exits once they turn out to be persistent.
    pub fn run(self, cancel: &AtomicBool) {
        let pin = self.pin;
        let mut errors = DriverErrorBudget::new(self.wait_timeout);

        while !cancel.load(Ordering::Acquire) {
            let Some(line) = self.line.upgrade() else {
                warn!("line for pin {pin} was released, stopping interrupt listener");
                break;
            };

            let result = line
                .wait_edge_events(self.wait_timeout)
                .and_then(|has_event| {
                    if has_event {
                        line.read_edge_events()
                    } else {
                        Ok(Vec::new())
                    }
                });
            drop(line);

            let events = match result {
                Ok(evts) => evts,
                Err(e) => {
                    warn!("edge event error for pin {pin}: {e}");
                    let Some(backoff) = errors.failure(&e) else {
                        warn!("giving up interrupt listener on pin {pin} after driver errors");
                        break;
                    };
                    if !park_unless_cancelled(backoff, cancel) {
                        break;
                    }
                    continue;
                }
            };
            errors.success();

            for evt in events {
                if !self.edge.matches(evt.edge) {
                    continue;
                }
                let callback = &self.callback;
                if panic::catch_unwind(AssertUnwindSafe(|| callback(pin))).is_err() {
                    warn!("interrupt callback for pin {pin} panicked");
                }
                self.events.dispatch(evt);
            }
        }

        debug!("interrupt listener on pin {pin} exited");
    }
}
