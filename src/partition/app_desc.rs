// Application descriptor embedded in every ESP-IDF app image
//
// Image layout: 24-byte image header (magic 0xE9), 8-byte first segment
// header, then esp_app_desc_t starting with magic 0xABCD5432.

use super::Partition;
use crate::error::{hex, FlashError};
use crate::platform::FlashPlatform;

pub const IMAGE_HEADER_MAGIC: u8 = 0xE9;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;
pub const APP_DESC_OFFSET: u32 = 0x20;
pub const APP_DESC_LEN: usize = 256;

const VERSION: (usize, usize) = (16, 32);
const PROJECT_NAME: (usize, usize) = (48, 32);
const TIME: (usize, usize) = (80, 16);
const DATE: (usize, usize) = (96, 16);
const IDF_VER: (usize, usize) = (112, 32);
const ELF_SHA256: usize = 144;
/// Bytes of the descriptor the flasher actually looks at
const USED_LEN: usize = ELF_SHA256 + 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub project_name: String,
    pub version: String,
    pub idf_version: String,
    pub elf_sha256: [u8; 32],
    pub date: String,
    pub time: String,
}

impl AppDescriptor {
    /// Parse an `esp_app_desc_t`; `None` if the magic word is wrong
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < USED_LEN {
            return None;
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != APP_DESC_MAGIC {
            return None;
        }
        let mut elf_sha256 = [0u8; 32];
        elf_sha256.copy_from_slice(&bytes[ELF_SHA256..ELF_SHA256 + 32]);
        Some(Self {
            project_name: c_str(bytes, PROJECT_NAME),
            version: c_str(bytes, VERSION),
            idf_version: c_str(bytes, IDF_VER),
            elf_sha256,
            date: c_str(bytes, DATE),
            time: c_str(bytes, TIME),
        })
    }

    pub fn to_bytes(&self) -> [u8; APP_DESC_LEN] {
        let mut out = [0u8; APP_DESC_LEN];
        out[0..4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        put_c_str(&mut out, VERSION, &self.version);
        put_c_str(&mut out, PROJECT_NAME, &self.project_name);
        put_c_str(&mut out, TIME, &self.time);
        put_c_str(&mut out, DATE, &self.date);
        put_c_str(&mut out, IDF_VER, &self.idf_version);
        out[ELF_SHA256..ELF_SHA256 + 32].copy_from_slice(&self.elf_sha256);
        out
    }

    pub fn log(&self) {
        log::info!(
            "App '{}', Version: '{}', IDF-Version: '{}', sha-256: {}..., date: '{}', time: '{}'",
            self.project_name,
            self.version,
            self.idf_version,
            hex(&self.elf_sha256[..8]),
            self.date,
            self.time
        );
    }
}

fn c_str(bytes: &[u8], (start, len): (usize, usize)) -> String {
    let field = &bytes[start..start + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn put_c_str(out: &mut [u8], (start, len): (usize, usize), value: &str) {
    // always leave room for the terminating NUL
    let n = value.len().min(len - 1);
    out[start..start + n].copy_from_slice(&value.as_bytes()[..n]);
}

/// Descriptor of the app stored in `partition`, or `None` if the slot does
/// not hold a recognizable image
pub fn read_app_descriptor<P: FlashPlatform + ?Sized>(
    platform: &mut P,
    partition: &Partition,
) -> Result<Option<AppDescriptor>, FlashError> {
    let mut header = [0u8; 1];
    platform.read(partition, 0, &mut header)?;
    if header[0] != IMAGE_HEADER_MAGIC {
        return Ok(None);
    }
    let mut desc = [0u8; USED_LEN];
    platform.read(partition, APP_DESC_OFFSET, &mut desc)?;
    Ok(AppDescriptor::parse(&desc))
}

/// Log the descriptor of `partition`, or a warning if there is none
pub fn log_app_version<P: FlashPlatform + ?Sized>(platform: &mut P, partition: &Partition) {
    match read_app_descriptor(platform, partition) {
        Ok(Some(desc)) => desc.log(),
        Ok(None) => log::warn!("No app descriptor in partition {}", partition),
        Err(e) => log::warn!("Failed to read app descriptor of {}: {}", partition, e),
    }
}
