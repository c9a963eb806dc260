// Multi-boot scenarios against the simulated device



use crate::boot::{BootOrchestrator, RestartReason};
use crate::config::FlasherConfig;
use crate::error::BootError;
use crate::partition::{Partition, PartitionKind, PartitionSubtype, PartitionTable};
use crate::sim::{fake_app_image, with_trailing_digest, MemoryMedia, SimDevice};

pub const FLASH_SIZE: usize = 0x400000;
pub const IMAGE_PATH: &str = "sdflash/app.bin";
pub const FLASHER_LEN: usize = 0x6000;
pub const FIRMWARE_LEN: usize = 20_000;

pub fn flasher_image() -> Vec<u8> {
    fake_app_image("sd-flasher", "v0.1", FLASHER_LEN, 0x11)
}

/// Update file as found on the card: firmware followed by its digest
pub fn update_file() -> Vec<u8> {
    with_trailing_digest(&fake_app_image("firmware", "v2.0", FIRMWARE_LEN, 0x42))
}

/// Device whose flasher image sits at `running` under `table`
pub fn device_with_flasher(table: &PartitionTable, running: u32) -> SimDevice {
    let mut device = SimDevice::new(FLASH_SIZE, table, running);
    device.load(running, &flasher_image());
    device
}

pub fn card(file: Vec<u8>) -> MemoryMedia {
    MemoryMedia::new().with_file(IMAGE_PATH, file)
}

pub fn boot_once(device: &mut SimDevice, media: &mut MemoryMedia) -> Result<RestartReason, BootError> {
    BootOrchestrator::new(device, media, FlasherConfig::default()).run()
}

/// Boot until the update is flashed, restarting after every `Ok`
pub fn boot_until_flashed(
    device: &mut SimDevice,
    media: &mut MemoryMedia,
    max_boots: usize,
) -> Result<Vec<RestartReason>, BootError> {
    let mut reasons = Vec::new();
    for _ in 0..max_boots {
        let reason = boot_once(device, media)?;
        reasons.push(reason);
        device.restart();
        if reason == RestartReason::ImageFlashed {
            break;
        }
    }
    Ok(reasons)
}

/// Two 1 MiB OTA slots, as shipped before the flasher existed
pub fn legacy_table() -> PartitionTable {
    let slot = |label: &str, n, address| Partition {
        label: label.to_string(),
        kind: PartitionKind::App,
        subtype: PartitionSubtype::Ota(n),
        address,
        size: 0x100000,
        flags: 0,
    };
    PartitionTable::new(vec![
        Partition {
            label: "nvs".to_string(),
            kind: PartitionKind::Data,
            subtype: PartitionSubtype::Nvs,
            address: 0x9000,
            size: 0x6000,
            flags: 0,
        },
        slot("ota_0", 0, 0x10000),
        slot("ota_1", 1, 0x110000),
    ])
    .unwrap()
}
