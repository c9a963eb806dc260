// Simulated device used by the tests and the host dry-run binary
//
// Flash is a flat byte array. The live partition table is parsed from flash
// at power-on only, the boot pointer survives restarts, and power can be cut
// after a given number of flash mutations.

use std::collections::HashMap;
use std::io::{self, Cursor};

use sha2::{Digest, Sha256};

use crate::error::FlashError;
use crate::ota::DIGEST_LEN;
use crate::partition::app_desc::{AppDescriptor, APP_DESC_OFFSET, IMAGE_HEADER_MAGIC};
use crate::partition::{
    Partition, PartitionKind, PartitionSubtype, PartitionTable, PARTITION_TABLE_OFFSET,
    PARTITION_TABLE_REGION_LEN, SECTOR_SIZE,
};
use crate::platform::{FlashPlatform, RemovableMedia, ResetReason};

const ESP_ERR_OTA_PARTITION_CONFLICT: i32 = 0x1501;
const ESP_ERR_INVALID_ARG: i32 = 0x102;

/// Every flash mutation the device performed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    EraseRange { partition: String, offset: u32, len: u32 },
    Write { partition: String, offset: u32, len: u32 },
    EraseRegion { address: u32, len: u32 },
    WriteRegion { address: u32, len: u32 },
    SetBoot { partition: String },
    BeginImage { partition: String },
    ImageChunk { partition: String, len: u32 },
    EndImage { partition: String },
    AbortImage { partition: String },
}

impl FlashOp {
    /// Label of the partition the op touched, if any
    pub fn partition(&self) -> Option<&str> {
        match self {
            FlashOp::EraseRange { partition, .. }
            | FlashOp::Write { partition, .. }
            | FlashOp::SetBoot { partition }
            | FlashOp::BeginImage { partition }
            | FlashOp::ImageChunk { partition, .. }
            | FlashOp::EndImage { partition }
            | FlashOp::AbortImage { partition } => Some(partition),
            FlashOp::EraseRegion { .. } | FlashOp::WriteRegion { .. } => None,
        }
    }
}

struct StagedWrite {
    partition: Partition,
    written: u32,
}

pub struct SimDevice {
    flash: Vec<u8>,
    live_table: Option<PartitionTable>,
    running_address: u32,
    boot_address: Option<u32>,
    staged: Option<StagedWrite>,
    journal: Vec<FlashOp>,
    power_budget: Option<usize>,
    powered: bool,
    reset_reason: ResetReason,
    valid_marks: usize,
}

impl SimDevice {
    /// Erased flash of `flash_size` bytes holding `table`, executing the app
    /// at `running_address`
    pub fn new(flash_size: usize, table: &PartitionTable, running_address: u32) -> Self {
        let mut device = Self {
            flash: vec![0xFF; flash_size],
            live_table: None,
            running_address,
            boot_address: None,
            staged: None,
            journal: Vec::new(),
            power_budget: None,
            powered: true,
            reset_reason: ResetReason::PowerOn,
            valid_marks: 0,
        };
        device.load(PARTITION_TABLE_OFFSET, &table.to_bytes());
        device.live_table = device.on_flash_table();
        device
    }

    /// Place bytes in flash without going through the journal
    pub fn load(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.flash[start..start + data.len()].copy_from_slice(data);
    }

    /// Bytes of the partition labelled `label` in the live table
    pub fn partition_bytes(&self, label: &str) -> Option<&[u8]> {
        let table = self.live_table.as_ref()?;
        let p = table.entries().iter().find(|p| p.label == label)?;
        Some(&self.flash[p.address as usize..p.end() as usize])
    }

    /// Table currently stored in flash, if it decodes
    pub fn on_flash_table(&self) -> Option<PartitionTable> {
        let start = PARTITION_TABLE_OFFSET as usize;
        PartitionTable::parse(&self.flash[start..start + PARTITION_TABLE_REGION_LEN as usize]).ok()
    }

    pub fn journal(&self) -> &[FlashOp] {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    pub fn boot_address(&self) -> Option<u32> {
        self.boot_address
    }

    pub fn running_address(&self) -> u32 {
        self.running_address
    }

    pub fn valid_marks(&self) -> usize {
        self.valid_marks
    }

    /// Let `mutations` more flash mutations succeed, then lose power
    pub fn cut_power_after(&mut self, mutations: usize) {
        self.power_budget = Some(mutations);
    }

    /// Software restart: reload the table and start the selected app
    pub fn restart(&mut self) {
        self.reboot(ResetReason::Software);
    }

    /// Power returns after a cut (or a cold start)
    pub fn power_cycle(&mut self) {
        self.reboot(ResetReason::PowerOn);
    }

    fn reboot(&mut self, reason: ResetReason) {
        self.powered = true;
        self.power_budget = None;
        self.staged = None;
        self.reset_reason = reason;
        self.live_table = self.on_flash_table();
        if let Some(address) = self.boot_address {
            self.running_address = address;
        }
    }

    fn check_power(&self) -> Result<(), FlashError> {
        if self.powered {
            Ok(())
        } else {
            Err(FlashError::PowerLoss)
        }
    }

    fn mutate(&mut self) -> Result<(), FlashError> {
        self.check_power()?;
        if let Some(budget) = self.power_budget.as_mut() {
            if *budget == 0 {
                self.powered = false;
                return Err(FlashError::PowerLoss);
            }
            *budget -= 1;
        }
        Ok(())
    }

    fn region(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = address as usize;
        let end = start.checked_add(len).filter(|&end| end <= self.flash.len());
        match end {
            Some(end) => Ok(start..end),
            None => Err(FlashError::RegionOutOfBounds {
                offset: address,
                len: len as u32,
                capacity: self.flash.len() as u32,
            }),
        }
    }

    fn partition_region(
        &self,
        partition: &Partition,
        offset: u32,
        len: usize,
    ) -> Result<std::ops::Range<usize>, FlashError> {
        if !partition.covers(offset, len as u32) {
            return Err(FlashError::OutOfBounds {
                label: partition.label.clone(),
                offset,
                len: len as u32,
                size: partition.size,
            });
        }
        self.region(partition.address + offset, len)
    }

    fn check_aligned(offset: u32, len: u32) -> Result<(), FlashError> {
        if offset % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
            return Err(FlashError::Unaligned { offset, len });
        }
        Ok(())
    }

    fn live(&self, partition: &Partition) -> Result<(), FlashError> {
        let known = self
            .live_table
            .as_ref()
            .map_or(false, |t| t.entries().contains(partition));
        if known {
            Ok(())
        } else {
            Err(FlashError::UnknownPartition(partition.label.clone()))
        }
    }
}

impl FlashPlatform for SimDevice {
    fn running_partition(&mut self) -> Result<Partition, FlashError> {
        self.check_power()?;
        self.live_table
            .as_ref()
            .and_then(|t| t.containing(self.running_address))
            .cloned()
            .ok_or_else(|| FlashError::UnknownPartition(format!("{:#x}", self.running_address)))
    }

    fn find_partition(
        &mut self,
        kind: PartitionKind,
        subtype: PartitionSubtype,
        label: Option<&str>,
    ) -> Option<Partition> {
        self.live_table.as_ref()?.find(kind, subtype, label).cloned()
    }

    fn erase_range(&mut self, partition: &Partition, offset: u32, len: u32) -> Result<(), FlashError> {
        self.live(partition)?;
        Self::check_aligned(offset, len)?;
        let range = self.partition_region(partition, offset, len as usize)?;
        self.mutate()?;
        self.flash[range].fill(0xFF);
        self.journal.push(FlashOp::EraseRange {
            partition: partition.label.clone(),
            offset,
            len,
        });
        Ok(())
    }

    fn read(&mut self, partition: &Partition, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_power()?;
        self.live(partition)?;
        let range = self.partition_region(partition, offset, buf.len())?;
        buf.copy_from_slice(&self.flash[range]);
        Ok(())
    }

    fn write(&mut self, partition: &Partition, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.live(partition)?;
        let range = self.partition_region(partition, offset, data.len())?;
        self.mutate()?;
        // NOR flash can only clear bits
        for (cell, byte) in self.flash[range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.journal.push(FlashOp::Write {
            partition: partition.label.clone(),
            offset,
            len: data.len() as u32,
        });
        Ok(())
    }

    fn erase_region(&mut self, address: u32, len: u32) -> Result<(), FlashError> {
        Self::check_aligned(address, len)?;
        let range = self.region(address, len as usize)?;
        self.mutate()?;
        self.flash[range].fill(0xFF);
        self.journal.push(FlashOp::EraseRegion { address, len });
        Ok(())
    }

    fn read_region(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_power()?;
        let range = self.region(address, buf.len())?;
        buf.copy_from_slice(&self.flash[range]);
        Ok(())
    }

    fn write_region(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.region(address, data.len())?;
        self.mutate()?;
        for (cell, byte) in self.flash[range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.journal.push(FlashOp::WriteRegion {
            address,
            len: data.len() as u32,
        });
        Ok(())
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), FlashError> {
        self.live(partition)?;
        if partition.kind != PartitionKind::App {
            return Err(FlashError::Platform {
                op: "esp_ota_set_boot_partition",
                code: ESP_ERR_INVALID_ARG,
            });
        }
        self.mutate()?;
        self.boot_address = Some(partition.address);
        self.journal.push(FlashOp::SetBoot {
            partition: partition.label.clone(),
        });
        Ok(())
    }

    fn begin_image_write(&mut self, partition: &Partition, image_len: u64) -> Result<(), FlashError> {
        self.live(partition)?;
        if partition.contains(self.running_address) {
            return Err(FlashError::Platform {
                op: "esp_ota_begin",
                code: ESP_ERR_OTA_PARTITION_CONFLICT,
            });
        }
        let len = u32::try_from(image_len).unwrap_or(u32::MAX);
        if len > partition.size {
            return Err(FlashError::OutOfBounds {
                label: partition.label.clone(),
                offset: 0,
                len,
                size: partition.size,
            });
        }
        let erase_len = len.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        let range = self.partition_region(partition, 0, erase_len as usize)?;
        self.mutate()?;
        self.flash[range].fill(0xFF);
        self.staged = Some(StagedWrite {
            partition: partition.clone(),
            written: 0,
        });
        self.journal.push(FlashOp::BeginImage {
            partition: partition.label.clone(),
        });
        Ok(())
    }

    fn write_image_chunk(&mut self, data: &[u8]) -> Result<(), FlashError> {
        self.check_power()?;
        let (partition, offset) = match self.staged.as_ref() {
            Some(staged) => (staged.partition.clone(), staged.written),
            None => return Err(FlashError::NoImageWrite),
        };
        let range = self.partition_region(&partition, offset, data.len())?;
        self.mutate()?;
        for (cell, byte) in self.flash[range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        if let Some(staged) = self.staged.as_mut() {
            staged.written += data.len() as u32;
        }
        self.journal.push(FlashOp::ImageChunk {
            partition: partition.label,
            len: data.len() as u32,
        });
        Ok(())
    }

    fn end_image_write(&mut self) -> Result<(), FlashError> {
        self.check_power()?;
        let staged = self.staged.take().ok_or(FlashError::NoImageWrite)?;
        let start = staged.partition.address as usize;
        if staged.written == 0 || self.flash[start] != IMAGE_HEADER_MAGIC {
            return Err(FlashError::InvalidImage(staged.partition.label));
        }
        self.journal.push(FlashOp::EndImage {
            partition: staged.partition.label,
        });
        Ok(())
    }

    fn abort_image_write(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.journal.push(FlashOp::AbortImage {
                partition: staged.partition.label,
            });
        }
    }

    fn mark_running_valid(&mut self) -> Result<(), FlashError> {
        self.check_power()?;
        self.valid_marks += 1;
        Ok(())
    }

    fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }
}

/// In-memory removable media keyed by path
#[derive(Default)]
pub struct MemoryMedia {
    files: HashMap<String, Vec<u8>>,
    mounted: bool,
    mount_count: usize,
}

impl MemoryMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: Vec<u8>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: &str, contents: Vec<u8>) {
        self.files.insert(path.to_string(), contents);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn mount_count(&self) -> usize {
        self.mount_count
    }
}

impl RemovableMedia for MemoryMedia {
    type File = Cursor<Vec<u8>>;

    fn mount(&mut self) -> io::Result<()> {
        self.mounted = true;
        self.mount_count += 1;
        Ok(())
    }

    fn open(&mut self, path: &str) -> io::Result<Option<(Self::File, u64)>> {
        if !self.mounted {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "media not mounted"));
        }
        Ok(self
            .files
            .get(path)
            .map(|data| (Cursor::new(data.clone()), data.len() as u64)))
    }

    fn unmount(&mut self) -> io::Result<()> {
        self.mounted = false;
        Ok(())
    }
}

/// An app image with a valid header and descriptor, padded to `len` bytes
/// with a deterministic pattern derived from `seed`
pub fn fake_app_image(project: &str, version: &str, len: usize, seed: u8) -> Vec<u8> {
    let desc = AppDescriptor {
        project_name: project.to_string(),
        version: version.to_string(),
        idf_version: "v5.3".to_string(),
        elf_sha256: [seed; 32],
        date: "Oct 19 2026".to_string(),
        time: "12:00:00".to_string(),
    };
    let desc_bytes = desc.to_bytes();
    let desc_start = APP_DESC_OFFSET as usize;
    let len = len.max(desc_start + desc_bytes.len());

    let mut image: Vec<u8> = (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    image[0] = IMAGE_HEADER_MAGIC;
    image[desc_start..desc_start + desc_bytes.len()].copy_from_slice(&desc_bytes);
    image
}

/// `payload` followed by its SHA-256, the layout of an update file
pub fn with_trailing_digest(payload: &[u8]) -> Vec<u8> {
    let mut file = Vec::with_capacity(payload.len() + DIGEST_LEN);
    file.extend_from_slice(payload);
    file.extend_from_slice(&Sha256::digest(payload));
    file
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> SimDevice {
        SimDevice::new(0x400000, &PartitionTable::sd_flasher_layout(), 0x390000)
    }

    fn app(device: &mut SimDevice) -> Partition {
        device
            .find_partition(PartitionKind::App, PartitionSubtype::Ota(0), Some("app"))
            .unwrap()
    }

    #[test]
    fn test_running_partition_resolves_by_address() {
        let mut device = device();
        assert_eq!(device.running_partition().unwrap().label, "sdflash");
    }

    #[test]
    fn test_write_only_clears_bits() {
        let mut device = device();
        let app = app(&mut device);
        device.write(&app, 0, &[0x0F]).unwrap();
        device.write(&app, 0, &[0xF0]).unwrap();
        assert_eq!(device.partition_bytes("app").unwrap()[0], 0x00);
        device.erase_range(&app, 0, SECTOR_SIZE).unwrap();
        assert_eq!(device.partition_bytes("app").unwrap()[0], 0xFF);
    }

    #[test]
    fn test_unaligned_erase_rejected() {
        let mut device = device();
        let app = app(&mut device);
        assert!(matches!(
            device.erase_range(&app, 0, 100),
            Err(FlashError::Unaligned { .. })
        ));
    }

    #[test]
    fn test_power_cut_blocks_everything_until_power_cycle() {
        let mut device = device();
        let app = app(&mut device);
        device.cut_power_after(1);
        device.write(&app, 0, &[0x00]).unwrap();
        assert!(matches!(device.write(&app, 1, &[0x00]), Err(FlashError::PowerLoss)));
        let mut buf = [0u8; 1];
        assert!(matches!(device.read(&app, 0, &mut buf), Err(FlashError::PowerLoss)));

        device.power_cycle();
        device.read(&app, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x00);
        assert_eq!(device.reset_reason(), ResetReason::PowerOn);
    }

    #[test]
    fn test_image_write_into_running_partition_conflicts() {
        let mut device = device();
        let running = device.running_partition().unwrap();
        assert!(matches!(
            device.begin_image_write(&running, 1024),
            Err(FlashError::Platform { code: ESP_ERR_OTA_PARTITION_CONFLICT, .. })
        ));
    }

    #[test]
    fn test_end_image_write_rejects_bad_header() {
        let mut device = device();
        let app = app(&mut device);
        device.begin_image_write(&app, 4).unwrap();
        device.write_image_chunk(&[0x00, 0x01, 0x02, 0x03]).unwrap();
        assert!(matches!(device.end_image_write(), Err(FlashError::InvalidImage(_))));
    }

    #[test]
    fn test_boot_pointer_survives_restart() {
        let mut device = device();
        let app = app(&mut device);
        device.set_boot_partition(&app).unwrap();
        device.restart();
        assert_eq!(device.running_partition().unwrap().label, "app");
        assert_eq!(device.reset_reason(), ResetReason::Software);
    }

    #[test]
    fn test_fake_image_has_descriptor() {
        let image = fake_app_image("flasher", "v0.1", 4096, 7);
        assert_eq!(image.len(), 4096);
        assert_eq!(image[0], IMAGE_HEADER_MAGIC);
        let desc = AppDescriptor::parse(&image[APP_DESC_OFFSET as usize..]).unwrap();
        assert_eq!(desc.project_name, "flasher");
    }
}
