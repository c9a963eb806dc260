// SD-card bootstrap flasher for ESP32 boards
//
// On every boot the flasher installs its partition layout, moves itself
// into the alternate app slot, then writes `sdflash/app.bin` from the SD
// card into the primary slot and boots it.

pub mod boot;
pub mod config;
pub mod error;
pub mod logging;
pub mod ota;
pub mod partition;
pub mod platform;
pub mod sim;
pub mod version;

#[cfg(target_os = "espidf")]
pub mod esp;

#[cfg(not(target_os = "espidf"))]
pub mod media;

#[cfg(test)]
mod tests;

pub use boot::{BootOrchestrator, RestartReason};
pub use config::FlasherConfig;
pub use error::BootError;
