use std::path::PathBuf;
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use log::{debug, warn};
use parking_lot::{FairMutex, Mutex};

use crate::config::{Edge, EdgeKind, Level, PinMode, WrapperConfig, chip_path};
use crate::error::GpioError;
use crate::gpio::{EdgeEvent, GpioWrapper, LineDriver, LineRequest};

/// A `/dev/gpiochip<N>` character device, opened once and closed on drop.
pub struct LibgpiodDriver {
    chip: Mutex<Chip>,
    path: String,
    consumer: String,
    event_buffer_capacity: usize,
}

impl LibgpiodDriver {
    pub fn open(config: &WrapperConfig) -> Result<Self, GpioError> {
        let path = chip_path(config.chip);
        let chip = Chip::open(&PathBuf::from(&path))
            .map_err(|e| GpioError::Config(format!("could not open {path}: {e}")))?;
        debug!("opened {path}");

        Ok(Self {
            chip: Mutex::new(chip),
            path,
            consumer: config.consumer.clone(),
            event_buffer_capacity: config.event_buffer_capacity,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn request_lines(&self, line_cfg: &line::Config) -> Result<request::Request, GpioError> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| GpioError::Config(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(&self.consumer)
            .map_err(|e| GpioError::Config(format!("request consumer: {e}")))?;
        self.chip
            .lock()
            .request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| GpioError::Config(format!("request lines: {e}")))
    }
}

impl Drop for LibgpiodDriver {
    fn drop(&mut self) {
        debug!("closing {}", self.path);
    }
}

impl LineDriver for LibgpiodDriver {
    type Line = LibgpiodLine;

    fn request_line(&self, offset: u32, mode: PinMode) -> Result<LibgpiodLine, GpioError> {
        let line_cfg = make_line_config(offset, make_line_settings(mode, None)?)?;
        let request = self.request_lines(&line_cfg).map_err(|e| {
            GpioError::Config(format!("pin {offset} could not be requested: {e}"))
        })?;
        let buffer = request::Buffer::new(self.event_buffer_capacity)
            .map_err(|e| GpioError::Config(format!("event buffer: {e}")))?;

        Ok(LibgpiodLine {
            offset,
            mode,
            handle: FairMutex::new(GpiodHandle { request, buffer }),
        })
    }
}

struct GpiodHandle {
    request: request::Request,
    buffer: request::Buffer,
}

/// A single requested line. The request is released when this is dropped.
pub struct LibgpiodLine {
    offset: u32,
    mode: PinMode,
    handle: FairMutex<GpiodHandle>,
}

impl LineRequest for LibgpiodLine {
    fn set_value(&self, offset: u32, level: Level) -> Result<(), GpioError> {
        let value = match level {
            Level::Low => line::Value::InActive,
            Level::High => line::Value::Active,
        };
        self.handle
            .lock()
            .request
            .set_value(offset, value)
            .map_err(|e| GpioError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn value(&self, offset: u32) -> Result<Level, GpioError> {
        let value = self
            .handle
            .lock()
            .request
            .value(offset)
            .map_err(|e| GpioError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }

    fn set_edge_detection(&self, offset: u32, edge: Option<Edge>) -> Result<(), GpioError> {
        let line_cfg = make_line_config(offset, make_line_settings(self.mode, edge)?)?;
        self.handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| GpioError::Gpio(format!("reconfigure lines: {e}")))?;
        Ok(())
    }

    fn wait_edge_events(&self, timeout: Duration) -> Result<bool, GpioError> {
        self.handle
            .lock()
            .request
            .wait_edge_events(Some(timeout))
            .map_err(|e| GpioError::Gpio(format!("wait edge events: {e}")))
    }

    fn read_edge_events(&self) -> Result<Vec<EdgeEvent>, GpioError> {
        let mut hdl = self.handle.lock();
        let GpiodHandle { request, buffer } = &mut *hdl;

        let events = request
            .read_edge_events(buffer)
            .map_err(|e| GpioError::Gpio(format!("read edge events: {e}")))?;

        let mut out = Vec::new();
        for evt in events {
            let evt = match evt {
                Ok(e) => e,
                Err(e) => {
                    warn!("malformed edge event on pin {}: {e}", self.offset);
                    continue;
                }
            };
            let edge = match evt.event_type() {
                Ok(line::EdgeKind::Rising) => EdgeKind::Rising,
                Ok(line::EdgeKind::Falling) => EdgeKind::Falling,
                Err(_) => continue,
            };
            out.push(EdgeEvent {
                pin: self.offset,
                edge,
                timestamp_ns: evt.timestamp().as_nanos() as u64,
            });
        }
        Ok(out)
    }
}

fn make_line_settings(mode: PinMode, edge: Option<Edge>) -> Result<line::Settings, GpioError> {
    let mut ls =
        line::Settings::new().map_err(|e| GpioError::Config(format!("libgpiod settings: {e}")))?;

    let (direction, bias) = match mode {
        PinMode::Output => (line::Direction::Output, None),
        PinMode::Input => (line::Direction::Input, Some(line::Bias::Disabled)),
        PinMode::PullUp => (line::Direction::Input, Some(line::Bias::PullUp)),
        PinMode::PullDown => (line::Direction::Input, Some(line::Bias::PullDown)),
    };
    ls.set_direction(direction)
        .map_err(|e| GpioError::Config(format!("set direction: {e}")))?;
    if bias.is_some() {
        ls.set_bias(bias)
            .map_err(|e| GpioError::Config(format!("set bias: {e}")))?;
    }

    if let Some(edge) = edge
        && mode.is_input()
    {
        let edge = match edge {
            Edge::Rising => line::Edge::Rising,
            Edge::Falling => line::Edge::Falling,
            Edge::Both => line::Edge::Both,
        };
        ls.set_edge_detection(Some(edge))
            .map_err(|e| GpioError::Config(format!("set edge detection: {e}")))?;
        ls.set_event_clock(EventClock::Monotonic)
            .map_err(|e| GpioError::Config(format!("set event clock: {e}")))?;
    }

    Ok(ls)
}

fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, GpioError> {
    let mut cfg =
        line::Config::new().map_err(|e| GpioError::Config(format!("line config: {e}")))?;
    cfg.add_line_settings(&[offset], settings)
        .map_err(|e| GpioError::Config(format!("line config add settings: {e}")))?;
    Ok(cfg)
}

impl GpioWrapper<LibgpiodDriver> {
    /// Opens `/dev/gpiochip<chip>` with default settings.
    pub fn open(chip: u32) -> Result<Self, GpioError> {
        Self::from_config(WrapperConfig {
            chip,
            ..WrapperConfig::default()
        })
    }

    /// Opens the configured chip and requests every pin listed in `config.pins`.
    pub fn from_config(config: WrapperConfig) -> Result<Self, GpioError> {
        config.validate()?;
        let driver = LibgpiodDriver::open(&config)?;
        Self::with_driver(driver, config)
    }
}
