use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};

use crate::config::Level;
use crate::error::GpioError;
use crate::gpio::LineRequest;
use crate::supervisor::{DriverErrorBudget, park_unless_cancelled};

const MAX_SET_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Forever,
    Times(u32),
}

impl From<i64> for Repeat {
    /// Negative counts mean forever.
    fn from(count: i64) -> Self {
        if count < 0 {
            Repeat::Forever
        } else {
            Repeat::Times(u32::try_from(count).unwrap_or(u32::MAX))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub level: Level,
    pub duration: Duration,
}

impl Step {
    pub fn new(level: Level, duration: Duration) -> Self {
        Self { level, duration }
    }
}

/// A validated sequence of steps and how often to run through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSpec {
    steps: Vec<Step>,
    repeat: Repeat,
}

impl PatternSpec {
    pub fn new(steps: Vec<Step>, repeat: Repeat) -> Result<Self, GpioError> {
        if steps.is_empty() {
            return Err(GpioError::InvalidParameter(
                "pattern needs at least one step".into(),
            ));
        }
        if steps.iter().all(|step| step.duration.is_zero()) {
            return Err(GpioError::InvalidParameter(
                "pattern steps must not all be zero length".into(),
            ));
        }
        Ok(Self { steps, repeat })
    }

    pub fn blink(interval_ms: u64, repeat: Repeat) -> Result<Self, GpioError> {
        let interval = non_zero_interval(interval_ms)?;
        Self::new(
            vec![
                Step::new(Level::High, interval),
                Step::new(Level::Low, interval),
            ],
            repeat,
        )
    }

    pub fn pwm(duty_percent: u32, frequency_hz: u32) -> Result<Self, GpioError> {
        if frequency_hz == 0 {
            return Err(GpioError::InvalidParameter(
                "pwm frequency must be greater than zero".into(),
            ));
        }
        if duty_percent > 100 {
            return Err(GpioError::InvalidParameter(format!(
                "pwm duty cycle {duty_percent}% is outside 0..=100"
            )));
        }

        let period = Duration::from_secs(1) / frequency_hz;
        let high = period * duty_percent / 100;
        let low = period - high;

        // 0% and 100% collapse into a steady level
        let steps = [Step::new(Level::High, high), Step::new(Level::Low, low)]
            .into_iter()
            .filter(|step| !step.duration.is_zero())
            .collect();
        Self::new(steps, Repeat::Forever)
    }

    pub fn alternate(first: Level, second: Level, interval_ms: u64) -> Result<Self, GpioError> {
        let interval = non_zero_interval(interval_ms)?;
        Self::new(
            vec![Step::new(first, interval), Step::new(second, interval)],
            Repeat::Forever,
        )
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn repeat(&self) -> Repeat {
        self.repeat
    }
}

fn non_zero_interval(interval_ms: u64) -> Result<Duration, GpioError> {
    if interval_ms == 0 {
        return Err(GpioError::InvalidParameter(
            "interval must be greater than zero".into(),
        ));
    }
    Ok(Duration::from_millis(interval_ms))
}

/// Drives `pin` through `spec` until cancelled, the repeat count runs out,
/// the line is released or the driver keeps failing.
pub(crate) fn run<L: LineRequest>(
    pin: u32,
    line: Weak<L>,
    spec: PatternSpec,
    cancel: &AtomicBool,
) {
    let mut cycles: u32 = 0;
    let mut errors = DriverErrorBudget::new(MAX_SET_ERROR_BACKOFF);

    'cycles: loop {
        if let Repeat::Times(times) = spec.repeat
            && cycles >= times
        {
            break;
        }

        for step in &spec.steps {
            if cancel.load(Ordering::Acquire) {
                break 'cycles;
            }
            let Some(request) = line.upgrade() else {
                warn!("line for pin {pin} was released, stopping pattern");
                break 'cycles;
            };
            let result = request.set_value(pin, step.level);
            drop(request);

            match result {
                Ok(()) => errors.success(),
                Err(e) => {
                    warn!("pattern set value error for pin {pin}: {e}");
                    let Some(backoff) = errors.failure(&e) else {
                        warn!("giving up pattern on pin {pin} after driver errors");
                        break 'cycles;
                    };
                    if !park_unless_cancelled(backoff, cancel) {
                        break 'cycles;
                    }
                }
            }

            if !park_unless_cancelled(step.duration, cancel) {
                break 'cycles;
            }
        }
        cycles = cycles.saturating_add(1);
    }

    debug!("pattern on pin {pin} finished after {cycles} cycles");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::backend::MockDriver;
    use crate::config::PinMode;
    use crate::gpio::LineDriver;
    use crate::supervisor::{TaskKind, TaskSupervisor};

    #[test]
    fn pwm_half_duty_at_two_hertz() {
        let spec = PatternSpec::pwm(50, 2).unwrap();
        assert_eq!(
            spec.steps(),
            &[
                Step::new(Level::High, Duration::from_millis(250)),
                Step::new(Level::Low, Duration::from_millis(250)),
            ]
        );
        assert_eq!(spec.repeat(), Repeat::Forever);
    }

    #[test]
    fn pwm_rejects_zero_frequency_and_excess_duty() {
        assert!(matches!(
            PatternSpec::pwm(50, 0),
            Err(GpioError::InvalidParameter(_))
        ));
        assert!(matches!(
            PatternSpec::pwm(101, 10),
            Err(GpioError::InvalidParameter(_))
        ));
    }

    #[test]
    fn pwm_full_and_zero_duty_are_steady() {
        let on = PatternSpec::pwm(100, 4).unwrap();
        assert_eq!(
            on.steps(),
            &[Step::new(Level::High, Duration::from_millis(250))]
        );
        let off = PatternSpec::pwm(0, 4).unwrap();
        assert_eq!(
            off.steps(),
            &[Step::new(Level::Low, Duration::from_millis(250))]
        );
    }

    #[test]
    fn blink_steps_and_repeat() {
        let spec = PatternSpec::blink(500, Repeat::Times(3)).unwrap();
        assert_eq!(
            spec.steps(),
            &[
                Step::new(Level::High, Duration::from_millis(500)),
                Step::new(Level::Low, Duration::from_millis(500)),
            ]
        );
        assert_eq!(spec.repeat(), Repeat::Times(3));
        assert!(PatternSpec::blink(0, Repeat::Forever).is_err());
    }

    #[test]
    fn negative_repeat_count_means_forever() {
        assert_eq!(Repeat::from(-1i64), Repeat::Forever);
        assert_eq!(Repeat::from(10i64), Repeat::Times(10));
    }

    #[test]
    fn exits_when_line_is_dropped() {
        let driver = MockDriver::default();
        let line = Arc::new(driver.request_line(17, PinMode::Output).unwrap());
        let weak = Arc::downgrade(&line);
        drop(line);

        let supervisor = TaskSupervisor::default();
        let spec = PatternSpec::blink(5, Repeat::Forever).unwrap();
        supervisor
            .start(17, TaskKind::Pattern, move |cancel| run(17, weak, spec, &cancel))
            .unwrap();

        assert!(wait_finished(&supervisor, 17));
        let exit = supervisor.stop(17, TaskKind::Pattern).unwrap();
        assert!(!exit.panicked);
        assert!(driver.sets(17).is_empty());
    }

    #[test]
    fn exits_when_line_is_disconnected() {
        let driver = MockDriver::default();
        let line = Arc::new(driver.request_line(17, PinMode::Output).unwrap());
        driver.disconnect(17);

        let supervisor = TaskSupervisor::default();
        let spec = PatternSpec::blink(5, Repeat::Forever).unwrap();
        let weak = Arc::downgrade(&line);
        supervisor
            .start(17, TaskKind::Pattern, move |cancel| run(17, weak, spec, &cancel))
            .unwrap();

        assert!(wait_finished(&supervisor, 17));
        // the registry-side reference is still alive, the task left on its own
        assert_eq!(Arc::strong_count(&line), 1);
        let exit = supervisor.stop(17, TaskKind::Pattern).unwrap();
        assert!(!exit.panicked);
    }

    fn wait_finished(supervisor: &TaskSupervisor, pin: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if !supervisor.is_running(pin, TaskKind::Pattern) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}
