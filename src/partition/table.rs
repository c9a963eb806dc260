// Binary partition table codec
//
// Records are 32 bytes: magic AA 50, type, subtype, offset (LE32), size (LE32),
// label (16 bytes, NUL padded), flags (LE32). The entry list is closed by an
// MD5 record: EB EB, 14 x FF, then the MD5 of every preceding byte.

use md5::{Digest, Md5};

use super::{
    Partition, PartitionKind, PartitionSubtype, ALTERNATE_SLOT_ADDRESS, ALTERNATE_SLOT_LABEL,
    ALTERNATE_SLOT_SIZE, PARTITION_TABLE_REGION_LEN, PRIMARY_SLOT_ADDRESS, PRIMARY_SLOT_LABEL,
    PRIMARY_SLOT_SIZE,
};
use crate::error::TableError;

pub const ENTRY_LEN: usize = 32;
const ENTRY_MAGIC: [u8; 2] = [0xAA, 0x50];
const MD5_MAGIC: [u8; 2] = [0xEB, 0xEB];
const ERASED: [u8; 2] = [0xFF, 0xFF];
const LABEL_LEN: usize = 16;

/// Bootloader reads at most 0xC00 bytes of table
pub const MAX_TABLE_LEN: usize = 0xC00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    entries: Vec<Partition>,
}

impl PartitionTable {
    pub fn new(entries: Vec<Partition>) -> Result<Self, TableError> {
        if (entries.len() + 1) * ENTRY_LEN > MAX_TABLE_LEN {
            return Err(TableError::TooLarge(MAX_TABLE_LEN));
        }
        for entry in &entries {
            if entry.label.len() > LABEL_LEN {
                return Err(TableError::LabelTooLong(entry.label.clone()));
            }
        }
        check_unique_roles(&entries)?;
        Ok(Self { entries })
    }

    /// The layout installed by the flasher: a large `app` slot for the
    /// firmware and a small `sdflash` slot for the flasher itself
    pub fn sd_flasher_layout() -> Self {
        let entry = |label: &str, kind, subtype, address, size| Partition {
            label: label.to_string(),
            kind,
            subtype,
            address,
            size,
            flags: 0,
        };
        Self {
            entries: vec![
                entry("nvs", PartitionKind::Data, PartitionSubtype::Nvs, 0x9000, 0x5000),
                entry("otadata", PartitionKind::Data, PartitionSubtype::OtaData, 0xE000, 0x2000),
                entry(
                    PRIMARY_SLOT_LABEL,
                    PartitionKind::App,
                    PartitionSubtype::Ota(0),
                    PRIMARY_SLOT_ADDRESS,
                    PRIMARY_SLOT_SIZE,
                ),
                entry(
                    ALTERNATE_SLOT_LABEL,
                    PartitionKind::App,
                    PartitionSubtype::Ota(1),
                    ALTERNATE_SLOT_ADDRESS,
                    ALTERNATE_SLOT_SIZE,
                ),
                entry("spiffs", PartitionKind::Data, PartitionSubtype::Spiffs, 0x3D0000, 0x30000),
            ],
        }
    }

    pub fn entries(&self) -> &[Partition] {
        &self.entries
    }

    /// First partition matching kind, subtype and (optionally) label
    pub fn find(
        &self,
        kind: PartitionKind,
        subtype: PartitionSubtype,
        label: Option<&str>,
    ) -> Option<&Partition> {
        self.entries.iter().find(|p| {
            p.kind == kind && p.subtype == subtype && label.map_or(true, |l| p.label == l)
        })
    }

    /// Partition whose range contains `address`
    pub fn containing(&self, address: u32) -> Option<&Partition> {
        self.entries.iter().find(|p| p.contains(address))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.entries.len() + 1) * ENTRY_LEN);
        for entry in &self.entries {
            out.extend_from_slice(&encode_entry(entry));
        }
        let digest = Md5::digest(&out);
        out.extend_from_slice(&MD5_MAGIC);
        out.extend_from_slice(&[0xFF; 14]);
        out.extend_from_slice(&digest);
        out
    }

    /// Decode and validate a table read from flash
    pub fn parse(bytes: &[u8]) -> Result<Self, TableError> {
        let limit = bytes.len().min(MAX_TABLE_LEN);
        let mut entries = Vec::new();

        for (index, record) in bytes[..limit].chunks_exact(ENTRY_LEN).enumerate() {
            match [record[0], record[1]] {
                ENTRY_MAGIC => entries.push(decode_entry(record)),
                MD5_MAGIC => {
                    let digest = Md5::digest(&bytes[..index * ENTRY_LEN]);
                    if record[16..] != digest[..] {
                        return Err(TableError::ChecksumMismatch);
                    }
                    check_unique_roles(&entries)?;
                    return Ok(Self { entries });
                }
                ERASED => return Err(TableError::MissingEndMarker),
                magic => return Err(TableError::BadMagic { index, magic }),
            }
        }
        Err(TableError::MissingEndMarker)
    }

    pub fn log_entries(&self) {
        for p in &self.entries {
            log::info!(
                "  {:<8} type {:#04x} subtype {:#04x} offset {:#08x} size {:#08x}",
                p.label,
                p.kind.raw(),
                p.subtype.raw(),
                p.address,
                p.size
            );
        }
    }
}

fn encode_entry(p: &Partition) -> [u8; ENTRY_LEN] {
    let mut record = [0u8; ENTRY_LEN];
    record[0..2].copy_from_slice(&ENTRY_MAGIC);
    record[2] = p.kind.raw();
    record[3] = p.subtype.raw();
    record[4..8].copy_from_slice(&p.address.to_le_bytes());
    record[8..12].copy_from_slice(&p.size.to_le_bytes());
    let label = p.label.as_bytes();
    let n = label.len().min(LABEL_LEN);
    record[12..12 + n].copy_from_slice(&label[..n]);
    record[28..32].copy_from_slice(&p.flags.to_le_bytes());
    record
}

fn decode_entry(record: &[u8]) -> Partition {
    let le32 = |at: usize| u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]]);
    let kind = PartitionKind::from_raw(record[2]);
    let label_bytes = &record[12..12 + LABEL_LEN];
    let label_end = label_bytes.iter().position(|&b| b == 0).unwrap_or(LABEL_LEN);
    Partition {
        label: String::from_utf8_lossy(&label_bytes[..label_end]).into_owned(),
        kind,
        subtype: PartitionSubtype::from_raw(kind, record[3]),
        address: le32(4),
        size: le32(8),
        flags: le32(28),
    }
}

fn check_unique_roles(entries: &[Partition]) -> Result<(), TableError> {
    for (i, a) in entries.iter().enumerate() {
        if entries[..i]
            .iter()
            .any(|b| b.kind == a.kind && b.subtype == a.subtype)
        {
            return Err(TableError::DuplicateRole {
                kind: a.kind.raw(),
                subtype: a.subtype.raw(),
            });
        }
    }
    Ok(())
}

const _: () = assert!(MAX_TABLE_LEN <= PARTITION_TABLE_REGION_LEN as usize);

#[cfg(test)]
mod tests {
    use super::*;

    // Table shipped with the production flasher
    const PRODUCTION_TABLE: [u8; 192] = [
        0xAA, 0x50, 0x01, 0x02, 0x00, 0x90, 0x00, 0x00, 0x00, 0x50, 0x00, 0x00, 0x6E, 0x76, 0x73, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xAA, 0x50, 0x01, 0x00, 0x00, 0xE0, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x6F, 0x74, 0x61, 0x64,
        0x61, 0x74, 0x61, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xAA, 0x50, 0x00, 0x10, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x38, 0x00, 0x61, 0x70, 0x70, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xAA, 0x50, 0x00, 0x11, 0x00, 0x00, 0x39, 0x00, 0x00, 0x00, 0x04, 0x00, 0x73, 0x64, 0x66, 0x6C,
        0x61, 0x73, 0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xAA, 0x50, 0x01, 0x82, 0x00, 0x00, 0x3D, 0x00, 0x00, 0x00, 0x03, 0x00, 0x73, 0x70, 0x69, 0x66,
        0x66, 0x73, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xEB, 0xEB, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
        0xFE, 0xCD, 0xE8, 0x51, 0x9F, 0xAE, 0x28, 0xAB, 0xE8, 0x12, 0x4E, 0x8C, 0xCC, 0xDE, 0x1B, 0x82,
    ];

    #[test]
    fn test_layout_encodes_to_production_bytes() {
        let bytes = PartitionTable::sd_flasher_layout().to_bytes();
        assert_eq!(&bytes[..160], &PRODUCTION_TABLE[..160]);
        assert_eq!(bytes, PRODUCTION_TABLE.to_vec());
    }

    #[test]
    fn test_parse_production_table() {
        let mut flash = PRODUCTION_TABLE.to_vec();
        flash.resize(0xC00, 0xFF);
        let table = PartitionTable::parse(&flash).unwrap();
        assert_eq!(table, PartitionTable::sd_flasher_layout());

        let app = table
            .find(PartitionKind::App, PartitionSubtype::Ota(0), Some("app"))
            .unwrap();
        assert_eq!(app.address, 0x10000);
        assert_eq!(app.size, 0x380000);
        assert_eq!(table.containing(0x3A0000).unwrap().label, "sdflash");
    }

    #[test]
    fn test_parse_rejects_corrupted_checksum() {
        let mut flash = PRODUCTION_TABLE.to_vec();
        flash[0x4C] ^= 0x01; // flip a bit in the "app" label
        assert_eq!(PartitionTable::parse(&flash), Err(TableError::ChecksumMismatch));
    }

    #[test]
    fn test_parse_rejects_erased_flash() {
        let flash = vec![0xFF; 0x1000];
        assert_eq!(PartitionTable::parse(&flash), Err(TableError::MissingEndMarker));
    }

    #[test]
    fn test_parse_rejects_garbage_magic() {
        let mut flash = PRODUCTION_TABLE.to_vec();
        flash[32] = 0x12;
        assert_eq!(
            PartitionTable::parse(&flash),
            Err(TableError::BadMagic { index: 1, magic: [0x12, 0x50] })
        );
    }

    #[test]
    fn test_parse_stops_at_short_buffer() {
        assert_eq!(
            PartitionTable::parse(&PRODUCTION_TABLE[..100]),
            Err(TableError::MissingEndMarker)
        );
    }

    #[test]
    fn test_duplicate_roles_rejected() {
        let mut entries = PartitionTable::sd_flasher_layout().entries().to_vec();
        let mut dup = entries[2].clone();
        dup.label = "app2".to_string();
        entries.push(dup);
        assert_eq!(
            PartitionTable::new(entries),
            Err(TableError::DuplicateRole { kind: 0x00, subtype: 0x10 })
        );
    }

    #[test]
    fn test_long_label_rejected() {
        let mut entries = PartitionTable::sd_flasher_layout().entries().to_vec();
        entries[0].label = "a-label-that-is-far-too-long".to_string();
        assert!(matches!(PartitionTable::new(entries), Err(TableError::LabelTooLong(_))));
    }
}
