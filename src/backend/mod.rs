#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::{LibgpiodDriver, LibgpiodLine};
pub use mock::{MockCall, MockDriver, MockLine};
