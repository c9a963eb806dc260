use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ota::DEFAULT_CHUNK_SIZE;
use crate::platform::RemovableMedia;

/// Optional override file, relative to the SD card mount point
pub const CONFIG_PATH: &str = "sdflash/flasher.json";

const MAX_CHUNK_SIZE: usize = 64 * 1024;
const MAX_CONFIG_SIZE: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    /// Update image, relative to the mount point
    pub image_path: String,
    /// Stride for partition copies, hashing and image writes
    pub chunk_size: usize,
    pub log_level: String,

    // Needed before the card is mounted, so the override file cannot change it
    #[serde(skip)]
    pub sd: SdCardConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdCardConfig {
    pub mount_point: String,
    pub pins: SdPins,
    pub max_files: u32,
    pub max_transfer_size: usize,
}

/// SPI wiring of the SD card slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdPins {
    pub miso: i32,
    pub mosi: i32,
    pub clk: i32,
    pub cs: i32,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            image_path: "sdflash/app.bin".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_level: "info".to_string(),
            sd: SdCardConfig::default(),
        }
    }
}

impl Default for SdCardConfig {
    fn default() -> Self {
        Self {
            mount_point: "/sd".to_string(),
            pins: SdPins {
                miso: 19,
                mosi: 23,
                clk: 18,
                cs: 5,
            },
            max_files: 1,
            max_transfer_size: 4000,
        }
    }
}

impl FlasherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.image_path.is_empty() || self.image_path.starts_with('/') {
            return Err(ConfigError::ImagePath(self.image_path.clone()));
        }
        Ok(())
    }

    fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let config: FlasherConfig = serde_json::from_slice(data)?;
        config.validate()?;
        Ok(config)
    }
}

/// Read the override file from mounted media, falling back to `current`
pub fn load_or_default<M: RemovableMedia + ?Sized>(
    media: &mut M,
    current: &FlasherConfig,
) -> FlasherConfig {
    match load_from_media(media) {
        Ok(Some(mut config)) => {
            log::info!("Loaded configuration from {}", CONFIG_PATH);
            config.sd = current.sd.clone();
            if !crate::logging::set_max_level_from_str(&config.log_level) {
                log::warn!("Unknown log level '{}', keeping current", config.log_level);
            }
            config
        }
        Ok(None) => current.clone(),
        Err(e) => {
            log::warn!("Failed to load {}: {:?}, using defaults", CONFIG_PATH, e);
            current.clone()
        }
    }
}

fn load_from_media<M: RemovableMedia + ?Sized>(media: &mut M) -> anyhow::Result<Option<FlasherConfig>> {
    let (file, len) = match media.open(CONFIG_PATH)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if len > MAX_CONFIG_SIZE {
        anyhow::bail!("config file is {} bytes, limit is {}", len, MAX_CONFIG_SIZE);
    }

    let mut data = Vec::with_capacity(len as usize);
    file.take(MAX_CONFIG_SIZE).read_to_end(&mut data)?;
    FlasherConfig::parse(&data).map(Some)
}
