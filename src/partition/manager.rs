// Partition table manager: makes sure the flasher's layout is installed

use log::{debug, info, warn};

use super::{
    Partition, PartitionKind, PartitionSubtype, PartitionTable, PARTITION_TABLE_OFFSET,
    PARTITION_TABLE_REGION_LEN, PRIMARY_SLOT_LABEL,
};
use crate::error::{BootError, TableError};
use crate::platform::FlashPlatform;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStatus {
    /// Layout already in place; the primary app slot
    Present(Partition),
    /// Replacement table written; the device must restart before the new
    /// layout is visible
    Installed,
}

/// Check for the primary app slot and install `table` if it is missing.
///
/// Presence is decided from the live table, so calling this again with a
/// correct table performs no flash writes.
pub fn ensure_partition_table<P: FlashPlatform + ?Sized>(
    platform: &mut P,
    table: &PartitionTable,
) -> Result<TableStatus, BootError> {
    let app = platform.find_partition(
        PartitionKind::App,
        PartitionSubtype::Ota(0),
        Some(PRIMARY_SLOT_LABEL),
    );
    if let Some(app) = app {
        info!("Partition already there, size is {:#x} bytes.", app.size);
        return Ok(TableStatus::Present(app));
    }

    install_partition_table(platform, table)?;
    Ok(TableStatus::Installed)
}

fn install_partition_table<P: FlashPlatform + ?Sized>(
    platform: &mut P,
    table: &PartitionTable,
) -> Result<(), BootError> {
    info!("Will replace partition table.");
    log_current_table(platform);

    let bytes = table.to_bytes();

    debug!("Will erase partition table.");
    platform.erase_region(PARTITION_TABLE_OFFSET, PARTITION_TABLE_REGION_LEN)?;
    debug!("Will write new partition table.");
    platform.write_region(PARTITION_TABLE_OFFSET, &bytes)?;

    // Read back through the decoder before asking for a restart
    let mut readback = vec![0u8; bytes.len()];
    platform.read_region(PARTITION_TABLE_OFFSET, &mut readback)?;
    let written = PartitionTable::parse(&readback)?;
    if &written != table {
        return Err(TableError::ChecksumMismatch.into());
    }

    info!("New partition table created, will reboot.");
    Ok(())
}

fn log_current_table<P: FlashPlatform + ?Sized>(platform: &mut P) {
    let mut current = vec![0u8; PARTITION_TABLE_REGION_LEN as usize];
    if let Err(e) = platform.read_region(PARTITION_TABLE_OFFSET, &mut current) {
        warn!("Could not read current partition table: {}", e);
        return;
    }
    match PartitionTable::parse(&current) {
        Ok(table) => {
            info!("Current partition table:");
            table.log_entries();
        }
        Err(e) => warn!("Current partition table is not valid: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FlashOp, SimDevice};

    fn legacy_table() -> PartitionTable {
        let slot = |label: &str, subtype, address| Partition {
            label: label.to_string(),
            kind: PartitionKind::App,
            subtype,
            address,
            size: 0x100000,
            flags: 0,
        };
        PartitionTable::new(vec![
            slot("ota_0", PartitionSubtype::Ota(0), 0x10000),
            slot("ota_1", PartitionSubtype::Ota(1), 0x110000),
        ])
        .unwrap()
    }

    #[test]
    fn test_installs_missing_table() {
        let mut device = SimDevice::new(0x400000, &legacy_table(), 0x10000);
        let target = PartitionTable::sd_flasher_layout();

        let status = ensure_partition_table(&mut device, &target).unwrap();
        assert_eq!(status, TableStatus::Installed);
        assert_eq!(device.on_flash_table().unwrap(), target);

        // The live table only changes after a restart
        assert!(device
            .find_partition(PartitionKind::App, PartitionSubtype::Ota(0), Some("app"))
            .is_none());
        device.power_cycle();
        let status = ensure_partition_table(&mut device, &target).unwrap();
        assert!(matches!(status, TableStatus::Present(ref p) if p.address == 0x10000));
    }

    #[test]
    fn test_second_call_performs_no_writes() {
        let target = PartitionTable::sd_flasher_layout();
        let mut device = SimDevice::new(0x400000, &target, 0x390000);

        ensure_partition_table(&mut device, &target).unwrap();
        let after_first = device.journal().len();
        ensure_partition_table(&mut device, &target).unwrap();

        assert_eq!(after_first, 0);
        assert_eq!(device.journal().len(), after_first);
        assert!(!device
            .journal()
            .iter()
            .any(|op| matches!(op, FlashOp::EraseRegion { .. } | FlashOp::WriteRegion { .. })));
    }

    #[test]
    fn test_erase_failure_is_fatal() {
        let mut device = SimDevice::new(0x400000, &legacy_table(), 0x10000);
        device.cut_power_after(0);
        let err = ensure_partition_table(&mut device, &PartitionTable::sd_flasher_layout()).unwrap_err();
        assert!(matches!(err, BootError::Flash(_)));
    }
}
