//! Pin configuration, level access, pattern generation and edge interrupts
//! over the Linux GPIO character device.

pub mod backend;
pub mod config;
pub mod error;
pub mod gpio;
mod interrupt;
mod pattern;
mod registry;
mod supervisor;

pub use config::{Edge, EdgeKind, Level, PinMode, WrapperConfig, chip_path};
pub use error::GpioError;
pub use gpio::{
    EdgeEvent, EventCallbackHandler, EventHandler, GpioWrapper, LineDriver, LineRequest,
};
pub use interrupt::{InterruptHandler, IntoInterruptHandler};
pub use pattern::{PatternSpec, Repeat, Step};
pub use supervisor::{TaskExit, TaskKind};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodDriver;
pub use backend::MockDriver;
