// Partition descriptors and the flash layout this flasher manages

pub mod app_desc;
pub mod manager;
pub mod table;

pub use app_desc::{read_app_descriptor, AppDescriptor};
pub use manager::{ensure_partition_table, TableStatus};
pub use table::PartitionTable;

use std::fmt;

/// Offset of the partition table in flash
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
/// The table occupies a single flash sector
pub const PARTITION_TABLE_REGION_LEN: u32 = 0x1000;
/// Flash erase granularity
pub const SECTOR_SIZE: u32 = 0x1000;

/// First application slot, where the updated firmware is flashed
pub const PRIMARY_SLOT_ADDRESS: u32 = 0x10000;
pub const PRIMARY_SLOT_LABEL: &str = "app";
pub const PRIMARY_SLOT_SIZE: u32 = 0x380000;

/// Alternate slot the flasher runs from while it rewrites the primary slot
pub const ALTERNATE_SLOT_ADDRESS: u32 = 0x390000;
pub const ALTERNATE_SLOT_LABEL: &str = "sdflash";
pub const ALTERNATE_SLOT_SIZE: u32 = 0x40000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    App,
    Data,
    Other(u8),
}

impl PartitionKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => PartitionKind::App,
            0x01 => PartitionKind::Data,
            other => PartitionKind::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            PartitionKind::App => 0x00,
            PartitionKind::Data => 0x01,
            PartitionKind::Other(raw) => raw,
        }
    }
}

/// Role of a partition; the numbering depends on the partition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionSubtype {
    // app
    Factory,
    Ota(u8),
    Test,
    // data
    OtaData,
    Phy,
    Nvs,
    CoreDump,
    NvsKeys,
    EFuse,
    Undefined,
    EspHttpd,
    Fat,
    Spiffs,
    LittleFs,
    Other(u8),
}

impl PartitionSubtype {
    pub fn from_raw(kind: PartitionKind, raw: u8) -> Self {
        match (kind, raw) {
            (PartitionKind::App, 0x00) => PartitionSubtype::Factory,
            (PartitionKind::App, 0x10..=0x1f) => PartitionSubtype::Ota(raw - 0x10),
            (PartitionKind::App, 0x20) => PartitionSubtype::Test,
            (PartitionKind::Data, 0x00) => PartitionSubtype::OtaData,
            (PartitionKind::Data, 0x01) => PartitionSubtype::Phy,
            (PartitionKind::Data, 0x02) => PartitionSubtype::Nvs,
            (PartitionKind::Data, 0x03) => PartitionSubtype::CoreDump,
            (PartitionKind::Data, 0x04) => PartitionSubtype::NvsKeys,
            (PartitionKind::Data, 0x05) => PartitionSubtype::EFuse,
            (PartitionKind::Data, 0x06) => PartitionSubtype::Undefined,
            (PartitionKind::Data, 0x80) => PartitionSubtype::EspHttpd,
            (PartitionKind::Data, 0x81) => PartitionSubtype::Fat,
            (PartitionKind::Data, 0x82) => PartitionSubtype::Spiffs,
            (PartitionKind::Data, 0x83) => PartitionSubtype::LittleFs,
            _ => PartitionSubtype::Other(raw),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            PartitionSubtype::Factory => 0x00,
            PartitionSubtype::Ota(n) => 0x10 + (n & 0x0f),
            PartitionSubtype::Test => 0x20,
            PartitionSubtype::OtaData => 0x00,
            PartitionSubtype::Phy => 0x01,
            PartitionSubtype::Nvs => 0x02,
            PartitionSubtype::CoreDump => 0x03,
            PartitionSubtype::NvsKeys => 0x04,
            PartitionSubtype::EFuse => 0x05,
            PartitionSubtype::Undefined => 0x06,
            PartitionSubtype::EspHttpd => 0x80,
            PartitionSubtype::Fat => 0x81,
            PartitionSubtype::Spiffs => 0x82,
            PartitionSubtype::LittleFs => 0x83,
            PartitionSubtype::Other(raw) => raw,
        }
    }
}

/// A partition as found in the live table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub label: String,
    pub kind: PartitionKind,
    pub subtype: PartitionSubtype,
    pub address: u32,
    pub size: u32,
    pub flags: u32,
}

impl Partition {
    pub fn end(&self) -> u32 {
        self.address.saturating_add(self.size)
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && address < self.end()
    }

    /// Whether `[offset, offset + len)` lies inside the partition
    pub fn covers(&self, offset: u32, len: u32) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.size)
    }

    /// Describe the OTA slot number for log lines
    pub fn ota_index(&self) -> Option<u8> {
        match (self.kind, self.subtype) {
            (PartitionKind::App, PartitionSubtype::Ota(n)) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' @ {:#08x} ({:#x} bytes)", self.label, self.address, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtype_raw_values() {
        assert_eq!(PartitionSubtype::from_raw(PartitionKind::App, 0x11), PartitionSubtype::Ota(1));
        assert_eq!(PartitionSubtype::Ota(1).raw(), 0x11);
        assert_eq!(PartitionSubtype::from_raw(PartitionKind::Data, 0x82), PartitionSubtype::Spiffs);
        assert_eq!(PartitionSubtype::from_raw(PartitionKind::Data, 0x00), PartitionSubtype::OtaData);
        assert_eq!(PartitionSubtype::from_raw(PartitionKind::App, 0x00), PartitionSubtype::Factory);
        assert_eq!(PartitionSubtype::from_raw(PartitionKind::Data, 0x40), PartitionSubtype::Other(0x40));
    }

    #[test]
    fn test_partition_bounds() {
        let p = Partition {
            label: "sdflash".to_string(),
            kind: PartitionKind::App,
            subtype: PartitionSubtype::Ota(1),
            address: ALTERNATE_SLOT_ADDRESS,
            size: ALTERNATE_SLOT_SIZE,
            flags: 0,
        };
        assert!(p.contains(ALTERNATE_SLOT_ADDRESS));
        assert!(!p.contains(ALTERNATE_SLOT_ADDRESS + ALTERNATE_SLOT_SIZE));
        assert!(p.covers(0, ALTERNATE_SLOT_SIZE));
        assert!(!p.covers(1, ALTERNATE_SLOT_SIZE));
        assert!(!p.covers(u32::MAX, 2));
        assert_eq!(p.ota_index(), Some(1));
    }
}
