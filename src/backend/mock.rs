use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{Edge, EdgeKind, Level, PinMode};
use crate::error::GpioError;
use crate::gpio::{EdgeEvent, LineDriver, LineRequest};

/// Hardware interaction recorded by [`MockDriver`], in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    Request(u32, PinMode),
    Release(u32),
    Set(u32, Level),
    Get(u32),
    EdgeDetection(u32, Option<Edge>),
}

struct MockLineState {
    mode: PinMode,
    value: Level,
    edge: Option<Edge>,
}

#[derive(Default)]
struct MockState {
    lines: Mutex<FxHashMap<u32, MockLineState>>,
    calls: Mutex<Vec<MockCall>>,
    pending: Mutex<FxHashMap<u32, VecDeque<EdgeEvent>>>,
    edge_ready: Condvar,
    failing_requests: Mutex<FxHashSet<u32>>,
    failing_waits: Mutex<FxHashMap<u32, usize>>,
    failing_reads: Mutex<FxHashMap<u32, usize>>,
    failing_edge_detection: Mutex<FxHashSet<u32>>,
    disconnected: Mutex<FxHashSet<u32>>,
    wait_calls: Mutex<FxHashMap<u32, usize>>,
}

impl MockState {
    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }

    fn check_connected(&self, offset: u32) -> Result<(), GpioError> {
        if self.disconnected.lock().contains(&offset) {
            return Err(GpioError::Disconnected(format!(
                "pin {offset}: no such device"
            )));
        }
        Ok(())
    }

    fn take_failure(counter: &Mutex<FxHashMap<u32, usize>>, offset: u32) -> bool {
        let mut counter = counter.lock();
        match counter.get_mut(&offset) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

/// In-memory chip. Clones share state, so a test can keep one while the
/// wrapper owns another.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().clone()
    }

    pub fn sets(&self, offset: u32) -> Vec<Level> {
        self.state
            .calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::Set(pin, level) if *pin == offset => Some(*level),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: MockCall) -> usize {
        self.state.calls.lock().iter().filter(|c| **c == call).count()
    }

    pub fn requested_lines(&self) -> Vec<u32> {
        let mut lines: Vec<u32> = self.state.lines.lock().keys().copied().collect();
        lines.sort_unstable();
        lines
    }

    pub fn edge_detection(&self, offset: u32) -> Option<Edge> {
        self.state
            .lines
            .lock()
            .get(&offset)
            .and_then(|line| line.edge)
    }

    pub fn fail_requests(&self, offset: u32) {
        self.state.failing_requests.lock().insert(offset);
    }

    pub fn fail_edge_detection(&self, offset: u32) {
        self.state.failing_edge_detection.lock().insert(offset);
    }

    /// Makes every later operation on the line report a vanished device.
    pub fn disconnect(&self, offset: u32) {
        self.state.disconnected.lock().insert(offset);
        self.state.edge_ready.notify_all();
    }

    pub fn wait_calls(&self, offset: u32) -> usize {
        self.state
            .wait_calls
            .lock()
            .get(&offset)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_next_waits(&self, offset: u32, times: usize) {
        self.state.failing_waits.lock().insert(offset, times);
    }

    pub fn fail_next_reads(&self, offset: u32, times: usize) {
        self.state.failing_reads.lock().insert(offset, times);
    }

    /// Simulates a level change on an input line. The edge is queued only
    /// when edge detection is enabled on the line; the mock does not filter
    /// by direction. Returns whether the edge was queued.
    pub fn inject_edge(&self, offset: u32, edge: EdgeKind) -> bool {
        {
            let mut lines = self.state.lines.lock();
            let Some(line) = lines.get_mut(&offset) else {
                return false;
            };
            line.value = match edge {
                EdgeKind::Rising => Level::High,
                EdgeKind::Falling => Level::Low,
            };
            if line.edge.is_none() {
                return false;
            }
        }

        self.state
            .pending
            .lock()
            .entry(offset)
            .or_default()
            .push_back(EdgeEvent {
                pin: offset,
                edge,
                timestamp_ns: epoch_nanos(),
            });
        self.state.edge_ready.notify_all();
        true
    }
}

impl LineDriver for MockDriver {
    type Line = MockLine;

    fn request_line(&self, offset: u32, mode: PinMode) -> Result<MockLine, GpioError> {
        if self.state.failing_requests.lock().contains(&offset) {
            return Err(GpioError::Config(format!(
                "pin {offset} could not be requested"
            )));
        }

        let mut lines = self.state.lines.lock();
        if lines.contains_key(&offset) {
            return Err(GpioError::Config(format!("pin {offset} is busy")));
        }
        lines.insert(
            offset,
            MockLineState {
                mode,
                value: Level::Low,
                edge: None,
            },
        );
        self.state.record(MockCall::Request(offset, mode));

        Ok(MockLine {
            offset,
            state: self.state.clone(),
        })
    }
}

pub struct MockLine {
    offset: u32,
    state: Arc<MockState>,
}

impl MockLine {
    fn check_offset(&self, offset: u32) -> Result<(), GpioError> {
        if offset != self.offset {
            return Err(GpioError::Gpio(format!(
                "offset {offset} is not part of this request"
            )));
        }
        Ok(())
    }
}

impl LineRequest for MockLine {
    fn set_value(&self, offset: u32, level: Level) -> Result<(), GpioError> {
        self.check_offset(offset)?;
        self.state.check_connected(offset)?;
        let mut lines = self.state.lines.lock();
        let line = lines
            .get_mut(&offset)
            .ok_or_else(|| GpioError::Gpio(format!("pin {offset} not requested")))?;
        if !line.mode.is_output() {
            return Err(GpioError::Gpio(format!(
                "set value: pin {offset} is not an output"
            )));
        }
        line.value = level;
        self.state.record(MockCall::Set(offset, level));
        Ok(())
    }

    fn value(&self, offset: u32) -> Result<Level, GpioError> {
        self.check_offset(offset)?;
        self.state.check_connected(offset)?;
        let value = self
            .state
            .lines
            .lock()
            .get(&offset)
            .map(|line| line.value)
            .ok_or_else(|| GpioError::Gpio(format!("pin {offset} not requested")))?;
        self.state.record(MockCall::Get(offset));
        Ok(value)
    }

    fn set_edge_detection(&self, offset: u32, edge: Option<Edge>) -> Result<(), GpioError> {
        self.check_offset(offset)?;
        self.state.check_connected(offset)?;
        if self.state.failing_edge_detection.lock().contains(&offset) {
            return Err(GpioError::Gpio("reconfigure lines: injected failure".into()));
        }
        if let Some(line) = self.state.lines.lock().get_mut(&offset) {
            line.edge = edge;
        }
        if edge.is_none() {
            self.state.pending.lock().remove(&offset);
        }
        self.state.record(MockCall::EdgeDetection(offset, edge));
        Ok(())
    }

    fn wait_edge_events(&self, timeout: Duration) -> Result<bool, GpioError> {
        *self
            .state
            .wait_calls
            .lock()
            .entry(self.offset)
            .or_default() += 1;
        self.state.check_connected(self.offset)?;
        if MockState::take_failure(&self.state.failing_waits, self.offset) {
            return Err(GpioError::Gpio("wait edge events: injected failure".into()));
        }

        let deadline = Instant::now() + timeout;
        let mut pending = self.state.pending.lock();
        loop {
            if pending.get(&self.offset).is_some_and(|q| !q.is_empty()) {
                return Ok(true);
            }
            if self
                .state
                .edge_ready
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return Ok(pending.get(&self.offset).is_some_and(|q| !q.is_empty()));
            }
        }
    }

    fn read_edge_events(&self) -> Result<Vec<EdgeEvent>, GpioError> {
        self.state.check_connected(self.offset)?;
        if MockState::take_failure(&self.state.failing_reads, self.offset) {
            return Err(GpioError::Gpio("read edge events: injected failure".into()));
        }
        Ok(self
            .state
            .pending
            .lock()
            .get_mut(&self.offset)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default())
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        self.state.lines.lock().remove(&self.offset);
        self.state.pending.lock().remove(&self.offset);
        self.state.record(MockCall::Release(self.offset));
    }
}

fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
