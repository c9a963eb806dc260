// Boot-state orchestrator
//
// Every boot starts from scratch: observe the durable flash state, decide
// what to do, perform at most one logical mutation and ask for a restart.

use log::{error, info, warn};

use crate::config::{load_or_default, FlasherConfig};
use crate::error::{BootError, IntegrityError};
use crate::ota::{copy_partition, partition_matches, verify_image_file, write_image, DIGEST_LEN};
use crate::partition::app_desc::log_app_version;
use crate::partition::{
    ensure_partition_table, Partition, PartitionKind, PartitionSubtype,
    PartitionTable, TableStatus, ALTERNATE_SLOT_ADDRESS, ALTERNATE_SLOT_LABEL, PRIMARY_SLOT_ADDRESS,
};
use crate::platform::{FlashPlatform, RemovableMedia};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootStage {
    Startup,
    TableCheck,
    Relocate,
    Mount,
    Verify,
    Flash,
    Complete,
}

impl BootStage {
    pub fn progress(&self) -> u8 {
        match self {
            BootStage::Startup => 5,
            BootStage::TableCheck => 15,
            BootStage::Relocate => 30,
            BootStage::Mount => 40,
            BootStage::Verify => 55,
            BootStage::Flash => 80,
            BootStage::Complete => 100,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BootStage::Startup => "Inspecting flash",
            BootStage::TableCheck => "Checking partition table",
            BootStage::Relocate => "Relocating flasher",
            BootStage::Mount => "Mounting SD card",
            BootStage::Verify => "Verifying image",
            BootStage::Flash => "Writing image",
            BootStage::Complete => "Done",
        }
    }
}

/// Durable state read at the start of a boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub running: Partition,
    /// First `App/Ota(0)` partition of the live table
    pub primary: Option<Partition>,
    /// Primary slot already holds a copy of the running flasher
    pub primary_has_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootState {
    /// Flasher was just flashed into the primary slot
    PrimaryRunning,
    /// Flasher runs from a slot of an older layout
    LegacySlotRunning,
    UnexpectedLayout(String),
    /// Running from the alternate slot but the primary slot is empty, torn
    /// or holds something other than the flasher
    FallbackMissing,
    /// Running from the alternate slot with a fallback in place
    Steady,
}

/// Why `run` wants the device restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    TableInstalled,
    FlasherRelocated,
    LegacySlotMigrated,
    FallbackRestored,
    ImageFlashed,
}

impl RestartReason {
    pub fn description(&self) -> &'static str {
        match self {
            RestartReason::TableInstalled => "new partition table installed",
            RestartReason::FlasherRelocated => "flasher copied to alternate slot",
            RestartReason::LegacySlotMigrated => "flasher moved to primary slot",
            RestartReason::FallbackRestored => "fallback image restored to primary slot",
            RestartReason::ImageFlashed => "update image flashed",
        }
    }
}

/// Map the observed flash state to the action of this boot
pub fn decide(observation: &Observation) -> BootState {
    let running = &observation.running;
    if running.address == PRIMARY_SLOT_ADDRESS {
        return BootState::PrimaryRunning;
    }

    match &observation.primary {
        None => {
            return BootState::UnexpectedLayout("no first app partition".to_string());
        }
        Some(p) if p.address != PRIMARY_SLOT_ADDRESS => {
            return BootState::UnexpectedLayout(format!(
                "first app partition {} is not at {:#x}",
                p, PRIMARY_SLOT_ADDRESS
            ));
        }
        Some(_) => {}
    }

    if running.address != ALTERNATE_SLOT_ADDRESS {
        BootState::LegacySlotRunning
    } else if observation.primary_has_fallback {
        BootState::Steady
    } else {
        BootState::FallbackMissing
    }
}

pub struct BootOrchestrator<'a, P: FlashPlatform + ?Sized, M: RemovableMedia + ?Sized> {
    platform: &'a mut P,
    media: &'a mut M,
    config: FlasherConfig,
    table: PartitionTable,
}

impl<'a, P: FlashPlatform + ?Sized, M: RemovableMedia + ?Sized> BootOrchestrator<'a, P, M> {
    pub fn new(platform: &'a mut P, media: &'a mut M, config: FlasherConfig) -> Self {
        Self {
            platform,
            media,
            config,
            table: PartitionTable::sd_flasher_layout(),
        }
    }

    fn stage(&self, stage: BootStage) {
        info!("[{:>3}%] {}", stage.progress(), stage.description());
    }

    /// One boot cycle. `Ok` means the caller must restart the device.
    pub fn run(&mut self) -> Result<RestartReason, BootError> {
        self.stage(BootStage::Startup);
        self.config.validate()?;
        let reason = self.platform.reset_reason();
        if reason.is_expected() {
            info!("Boot reason: {}", reason.description());
        } else {
            warn!("Boot reason: {}", reason.description());
        }

        if let Err(e) = self.platform.mark_running_valid() {
            warn!("Could not mark running app valid: {}", e);
        }

        let observation = self.observe()?;
        log_app_version(&mut *self.platform, &observation.running);
        info!("Running partition: {}", observation.running);

        let state = decide(&observation);
        info!("Boot state: {:?}", state);

        match state {
            BootState::PrimaryRunning => self.relocate_to_alternate(&observation.running),
            BootState::LegacySlotRunning => {
                let primary = self.require_primary(&observation)?;
                self.stage(BootStage::Relocate);
                copy_partition(&mut *self.platform, &observation.running, &primary, self.config.chunk_size)?;
                self.platform.set_boot_partition(&primary)?;
                Ok(RestartReason::LegacySlotMigrated)
            }
            BootState::UnexpectedLayout(msg) => {
                error!("Unexpected partition layout: {}", msg);
                Err(BootError::Layout(msg))
            }
            BootState::FallbackMissing => {
                let primary = self.require_primary(&observation)?;
                self.stage(BootStage::Relocate);
                info!("No fallback firmware in {}, restoring flasher there", primary);
                copy_partition(&mut *self.platform, &observation.running, &primary, self.config.chunk_size)?;
                Ok(RestartReason::FallbackRestored)
            }
            BootState::Steady => self.flash_from_media(&observation),
        }
    }

    fn observe(&mut self) -> Result<Observation, BootError> {
        let running = self.platform.running_partition()?;
        let primary = self
            .platform
            .find_partition(PartitionKind::App, PartitionSubtype::Ota(0), None);
        let primary_has_fallback = match &primary {
            Some(p) if p.address != running.address => {
                partition_matches(&mut *self.platform, &running, p, self.config.chunk_size)?
            }
            _ => false,
        };
        Ok(Observation {
            running,
            primary,
            primary_has_fallback,
        })
    }

    fn require_primary(&self, observation: &Observation) -> Result<Partition, BootError> {
        observation
            .primary
            .clone()
            .ok_or_else(|| BootError::Layout("no first app partition".to_string()))
    }

    fn relocate_to_alternate(&mut self, running: &Partition) -> Result<RestartReason, BootError> {
        self.stage(BootStage::TableCheck);
        if let TableStatus::Installed = ensure_partition_table(&mut *self.platform, &self.table)? {
            return Ok(RestartReason::TableInstalled);
        }

        let alternate = self
            .platform
            .find_partition(
                PartitionKind::App,
                PartitionSubtype::Ota(1),
                Some(ALTERNATE_SLOT_LABEL),
            )
            .ok_or_else(|| {
                BootError::Layout(format!("partition '{}' not found", ALTERNATE_SLOT_LABEL))
            })?;

        self.stage(BootStage::Relocate);
        copy_partition(&mut *self.platform, running, &alternate, self.config.chunk_size)?;
        self.platform.set_boot_partition(&alternate)?;
        info!("Boot partition set to {}", alternate);
        Ok(RestartReason::FlasherRelocated)
    }

    fn flash_from_media(&mut self, observation: &Observation) -> Result<RestartReason, BootError> {
        self.stage(BootStage::TableCheck);
        let target = match ensure_partition_table(&mut *self.platform, &self.table)? {
            TableStatus::Present(p) => p,
            TableStatus::Installed => return Ok(RestartReason::TableInstalled),
        };
        if target.contains(observation.running.address) {
            return Err(BootError::Layout(format!(
                "update target {} overlaps running partition {}",
                target, observation.running
            )));
        }

        self.stage(BootStage::Mount);
        self.media.mount()?;
        self.config = load_or_default(&mut *self.media, &self.config);

        let result = self.flash_image(&target);

        if let Err(e) = self.media.unmount() {
            warn!("Failed to unmount SD card: {}", e);
        }
        result?;

        self.stage(BootStage::Complete);
        Ok(RestartReason::ImageFlashed)
    }

    fn flash_image(&mut self, target: &Partition) -> Result<(), BootError> {
        let path = self.config.image_path.clone();
        let chunk_size = self.config.chunk_size;

        let (file, len) = self.open_image(&path)?;
        info!("Found '{}' ({} bytes)", path, len);
        if len < DIGEST_LEN as u64 {
            return Err(IntegrityError::Truncated {
                expected: DIGEST_LEN as u64,
                available: len,
            }
            .into());
        }
        if len > target.size as u64 {
            return Err(BootError::ImageTooLarge {
                label: target.label.clone(),
                len,
                capacity: target.size,
            });
        }

        self.stage(BootStage::Verify);
        let digest = verify_image_file(file, len, chunk_size)?;

        // The verified stream is consumed; read the file again for flashing.
        // write_image re-hashes what it writes against `digest`.
        self.stage(BootStage::Flash);
        let (file, reopened_len) = self.open_image(&path)?;
        if reopened_len != len {
            return Err(BootError::Media(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("'{}' changed size after verification", path),
            )));
        }
        write_image(&mut *self.platform, target, file, len, chunk_size, &digest)?;

        log_app_version(&mut *self.platform, target);
        self.platform.set_boot_partition(target)?;
        info!("Boot partition set to {}", target);
        Ok(())
    }

    fn open_image(&mut self, path: &str) -> Result<(M::File, u64), BootError> {
        self.media
            .open(path)?
            .ok_or_else(|| BootError::MissingImage(path.to_string()))
    }
}
