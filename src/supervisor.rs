use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::GpioError;

const MAX_CONSECUTIVE_DRIVER_ERRORS: u32 = 8;
const INITIAL_ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Pattern,
    Interrupt,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Pattern => f.write_str("pattern"),
            TaskKind::Interrupt => f.write_str("interrupt"),
        }
    }
}

/// Outcome of stopping a task, observed after the join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExit {
    pub pin: u32,
    pub kind: TaskKind,
    pub cancelled: bool,
    pub panicked: bool,
}

/// A background thread bound to one pin plus the flag used to stop it.
///
/// Dropping the handle cancels and joins the thread, so a handle can never
/// outlive its task silently.
pub struct TaskHandle {
    pin: u32,
    kind: TaskKind,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F>(pin: u32, kind: TaskKind, body: F) -> Result<Self, GpioError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();

        let handle = thread::Builder::new()
            .name(format!("gpio-{kind}-{pin}"))
            .spawn(move || body(cancel_flag))
            .map_err(|e| GpioError::Gpio(format!("spawn {kind} task for pin {pin}: {e}")))?;
        debug!("{kind} task started for pin {pin}");

        Ok(Self {
            pin,
            kind,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Requests a stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Cancels and joins the task.
    pub fn stop(mut self) -> TaskExit {
        self.join()
    }

    fn join(&mut self) -> TaskExit {
        self.cancel();
        let panicked = match self.handle.take() {
            Some(handle) => handle.join().is_err(),
            None => false,
        };
        if panicked {
            warn!("{} task for pin {} panicked", self.kind, self.pin);
        } else {
            debug!("{} task stopped for pin {}", self.kind, self.pin);
        }
        TaskExit {
            pin: self.pin,
            kind: self.kind,
            cancelled: self.cancel.load(Ordering::Acquire),
            panicked,
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.join();
        }
    }
}

/// Per pin slots for at most one pattern task and one interrupt task.
///
/// Map locks are only held to insert or remove a handle, never across a join,
/// so stopping a task on one pin does not stall other pins.
#[derive(Default)]
pub struct TaskSupervisor {
    patterns: Mutex<FxHashMap<u32, TaskHandle>>,
    interrupts: Mutex<FxHashMap<u32, TaskHandle>>,
}

impl TaskSupervisor {
    fn slots(&self, kind: TaskKind) -> &Mutex<FxHashMap<u32, TaskHandle>> {
        match kind {
            TaskKind::Pattern => &self.patterns,
            TaskKind::Interrupt => &self.interrupts,
        }
    }

    /// Stops any task of `kind` on `pin`, then spawns `body` into the slot.
    pub fn start<F>(&self, pin: u32, kind: TaskKind, body: F) -> Result<(), GpioError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        if let Some(exit) = self.stop(pin, kind) {
            debug!("replaced {kind} task on pin {pin} (panicked: {})", exit.panicked);
        }

        let task = TaskHandle::spawn(pin, kind, body)?;
        let previous = self.slots(kind).lock().insert(pin, task);
        // only reachable when two starts on one pin are not serialized by the caller
        if let Some(previous) = previous {
            warn!("concurrent {kind} start on pin {pin}, stopping the older task");
            previous.stop();
        }
        Ok(())
    }

    pub fn stop(&self, pin: u32, kind: TaskKind) -> Option<TaskExit> {
        let task = self.slots(kind).lock().remove(&pin);
        task.map(TaskHandle::stop)
    }

    pub fn contains(&self, pin: u32, kind: TaskKind) -> bool {
        self.slots(kind).lock().contains_key(&pin)
    }

    pub fn is_running(&self, pin: u32, kind: TaskKind) -> bool {
        self.slots(kind)
            .lock()
            .get(&pin)
            .is_some_and(|task| !task.is_finished())
    }

    /// Cancels every task first, then joins them all.
    pub fn stop_all(&self) -> Vec<TaskExit> {
        let mut tasks: Vec<TaskHandle> = Vec::new();
        for kind in [TaskKind::Pattern, TaskKind::Interrupt] {
            tasks.extend(self.slots(kind).lock().drain().map(|(_, task)| task));
        }
        for task in &tasks {
            task.cancel();
        }
        tasks.into_iter().map(TaskHandle::stop).collect()
    }
}

/// Parks for `duration` or until the flag is raised. Returns false when
/// cancelled. Stopping a task unparks it, so the wake up is immediate.
pub(crate) fn park_unless_cancelled(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::park_timeout(deadline - now);
    }
}

/// Tracks consecutive driver failures of a background task.
///
/// Failures back off exponentially up to `max_backoff`. A fatal error or
/// running out of the budget tells the task to give up.
pub(crate) struct DriverErrorBudget {
    consecutive: u32,
    max_backoff: Duration,
}

impl DriverErrorBudget {
    pub fn new(max_backoff: Duration) -> Self {
        Self {
            consecutive: 0,
            max_backoff,
        }
    }

    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns how long to back off, or `None` when the task should exit.
    pub fn failure(&mut self, err: &GpioError) -> Option<Duration> {
        if err.is_fatal() {
            return None;
        }
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_DRIVER_ERRORS {
            return None;
        }
        let backoff = INITIAL_ERROR_BACKOFF.saturating_mul(1 << (self.consecutive - 1));
        Some(backoff.min(self.max_backoff))
    }
}

/// Serializes lifecycle operations on one pin without serializing across pins.
#[derive(Default)]
pub struct PinLocks {
    locks: Mutex<FxHashMap<u32, Arc<Mutex<()>>>>,
}

impl PinLocks {
    pub fn get(&self, pin: u32) -> Arc<Mutex<()>> {
        self.locks.lock().entry(pin).or_default().clone()
    }

    /// Drops the entry for `pin` when `lock` is its only outside holder.
    pub fn prune(&self, pin: u32, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // the map and `lock` are the only references, nobody can be waiting
        if locks
            .get(&pin)
            .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) == 2)
        {
            locks.remove(&pin);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn spin_until_cancelled(cancel: Arc<AtomicBool>) {
        while !cancel.load(Ordering::Acquire) {
            thread::park_timeout(Duration::from_millis(50));
        }
    }

    #[test]
    fn stop_joins_and_reports_cancellation() {
        let task = TaskHandle::spawn(4, TaskKind::Interrupt, spin_until_cancelled).unwrap();
        assert!(!task.is_finished());

        let exit = task.stop();
        assert_eq!(exit.pin, 4);
        assert_eq!(exit.kind, TaskKind::Interrupt);
        assert!(exit.cancelled);
        assert!(!exit.panicked);
    }

    #[test]
    fn start_replaces_previous_task_after_it_exited() {
        let supervisor = TaskSupervisor::default();
        let live = Arc::new(AtomicUsize::new(0));
        let max_live = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let live = live.clone();
            let max_live = max_live.clone();
            supervisor
                .start(7, TaskKind::Pattern, move |cancel| {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    max_live.fetch_max(now, Ordering::SeqCst);
                    spin_until_cancelled(cancel);
                    live.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert!(supervisor.is_running(7, TaskKind::Pattern));
        assert_eq!(max_live.load(Ordering::SeqCst), 1);

        let exits = supervisor.stop_all();
        assert_eq!(exits.len(), 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(!supervisor.contains(7, TaskKind::Pattern));
    }

    #[test]
    fn panicking_task_is_still_joinable() {
        let supervisor = TaskSupervisor::default();
        supervisor
            .start(1, TaskKind::Interrupt, |_| panic!("callback blew up"))
            .unwrap();

        let exit = supervisor.stop(1, TaskKind::Interrupt).unwrap();
        assert!(exit.panicked);
        assert!(supervisor.stop(1, TaskKind::Interrupt).is_none());
    }

    #[test]
    fn error_budget_backs_off_then_gives_up() {
        let mut budget = DriverErrorBudget::new(Duration::from_millis(50));
        let err = GpioError::Gpio("EIO".into());

        assert_eq!(budget.failure(&err), Some(Duration::from_millis(10)));
        assert_eq!(budget.failure(&err), Some(Duration::from_millis(20)));
        assert_eq!(budget.failure(&err), Some(Duration::from_millis(40)));
        assert_eq!(budget.failure(&err), Some(Duration::from_millis(50)));
        budget.success();
        assert_eq!(budget.failure(&err), Some(Duration::from_millis(10)));

        let mut exhausted = None;
        for _ in 0..MAX_CONSECUTIVE_DRIVER_ERRORS {
            exhausted = budget.failure(&err);
        }
        assert_eq!(exhausted, None);

        let mut fresh = DriverErrorBudget::new(Duration::from_millis(50));
        assert_eq!(
            fresh.failure(&GpioError::Disconnected("ENODEV".into())),
            None
        );
    }

    #[test]
    fn park_returns_early_when_cancelled() {
        let cancel = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!park_unless_cancelled(Duration::from_secs(5), &cancel));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn pin_lock_is_pruned_only_without_other_holders() {
        let locks = PinLocks::default();

        let lock = locks.get(5);
        let other = locks.get(5);
        locks.prune(5, &lock);
        assert_eq!(locks.len(), 1);

        drop(other);
        locks.prune(5, &lock);
        assert_eq!(locks.len(), 0);

        // a fresh lock after pruning is a different mutex
        let fresh = locks.get(5);
        assert!(!Arc::ptr_eq(&fresh, &lock));
    }

    #[test]
    fn slots_are_independent_per_kind() {
        let supervisor = TaskSupervisor::default();
        supervisor
            .start(3, TaskKind::Pattern, spin_until_cancelled)
            .unwrap();
        supervisor
            .start(3, TaskKind::Interrupt, spin_until_cancelled)
            .unwrap();

        supervisor.stop(3, TaskKind::Interrupt);
        assert!(supervisor.is_running(3, TaskKind::Pattern));
        assert!(!supervisor.contains(3, TaskKind::Interrupt));
        supervisor.stop_all();
    }
}
