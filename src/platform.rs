// Platform seam: flash/OTA primitives and removable media
//
// The ESP-IDF implementation lives in `esp`, the simulated device in `sim`.

use std::io::{self, Read};

use crate::error::FlashError;
use crate::partition::{Partition, PartitionKind, PartitionSubtype};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Unknown,
    PowerOn,
    External,
    Software,
    Panic,
    InterruptWatchdog,
    TaskWatchdog,
    OtherWatchdog,
    DeepSleep,
    Brownout,
    Sdio,
}

impl ResetReason {
    pub fn description(&self) -> &'static str {
        match self {
            ResetReason::Unknown => "Unknown",
            ResetReason::PowerOn => "Power-on",
            ResetReason::External => "External pin",
            ResetReason::Software => "Software reset",
            ResetReason::Panic => "Panic",
            ResetReason::InterruptWatchdog => "Interrupt watchdog",
            ResetReason::TaskWatchdog => "Task watchdog",
            ResetReason::OtherWatchdog => "Other watchdog",
            ResetReason::DeepSleep => "Deep sleep",
            ResetReason::Brownout => "Brownout",
            ResetReason::Sdio => "SDIO",
        }
    }

    /// Restarts the flasher itself requests, as opposed to crashes
    pub fn is_expected(&self) -> bool {
        matches!(self, ResetReason::PowerOn | ResetReason::Software | ResetReason::External)
    }
}

/// Flash, partition and OTA primitives of the device
///
/// Partition-relative operations take offsets from the partition start.
/// Region operations take absolute flash addresses and are only used for
/// the partition table.
pub trait FlashPlatform {
    fn running_partition(&mut self) -> Result<Partition, FlashError>;

    fn find_partition(
        &mut self,
        kind: PartitionKind,
        subtype: PartitionSubtype,
        label: Option<&str>,
    ) -> Option<Partition>;

    fn erase_range(&mut self, partition: &Partition, offset: u32, len: u32) -> Result<(), FlashError>;
    fn read(&mut self, partition: &Partition, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    fn write(&mut self, partition: &Partition, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    fn erase_region(&mut self, address: u32, len: u32) -> Result<(), FlashError>;
    fn read_region(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    fn write_region(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Durably select the app partition started on the next boot
    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), FlashError>;

    /// Start a staged image write; erases the target as needed
    fn begin_image_write(&mut self, partition: &Partition, image_len: u64) -> Result<(), FlashError>;
    fn write_image_chunk(&mut self, data: &[u8]) -> Result<(), FlashError>;
    /// Finish the staged write and validate the written image
    fn end_image_write(&mut self) -> Result<(), FlashError>;
    fn abort_image_write(&mut self);

    /// Confirm the running app so the bootloader does not roll it back
    fn mark_running_valid(&mut self) -> Result<(), FlashError>;

    fn reset_reason(&self) -> ResetReason;
}

/// Removable storage holding the update image
pub trait RemovableMedia {
    type File: Read;

    fn mount(&mut self) -> io::Result<()>;

    /// Open `path` relative to the mount point; `None` if it does not exist
    fn open(&mut self, path: &str) -> io::Result<Option<(Self::File, u64)>>;

    fn unmount(&mut self) -> io::Result<()>;
}
