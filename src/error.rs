// Error types shared by the flasher core
//
// Everything below the orchestrator reports typed errors; the binary turns a
// `BootError` into a diagnostic and a halt.

use std::io;

use thiserror::Error;

/// Failure of a flash, partition or OTA primitive
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("{op} failed with esp_err_t {code:#x}")]
    Platform { op: &'static str, code: i32 },

    #[error("range {offset:#x}+{len:#x} exceeds partition '{label}' ({size:#x} bytes)")]
    OutOfBounds {
        label: String,
        offset: u32,
        len: u32,
        size: u32,
    },

    #[error("flash region {offset:#x}+{len:#x} is outside the chip ({capacity:#x} bytes)")]
    RegionOutOfBounds { offset: u32, len: u32, capacity: u32 },

    #[error("erase of {offset:#x}+{len:#x} is not sector aligned")]
    Unaligned { offset: u32, len: u32 },

    #[error("partition '{0}' is not present in the live partition table")]
    UnknownPartition(String),

    #[error("no image write is in progress")]
    NoImageWrite,

    #[error("image written to '{0}' failed validation")]
    InvalidImage(String),

    #[error("power lost during flash operation")]
    PowerLoss,
}

/// Integrity check failure of an update image
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error(
        "digest mismatch at byte {first_difference}: expected {}, computed {}",
        hex(.expected),
        hex(.actual)
    )]
    Mismatch {
        expected: [u8; 32],
        actual: [u8; 32],
        first_difference: usize,
    },

    #[error("image truncated: needed {expected} bytes, stream ended after {available}")]
    Truncated { expected: u64, available: u64 },

    #[error("failed to read image: {0}")]
    Io(#[from] io::Error),
}

/// Decoding failure of an on-flash partition table
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("entry {index} has bad magic {magic:02x?}")]
    BadMagic { index: usize, magic: [u8; 2] },

    #[error("table has no end marker")]
    MissingEndMarker,

    #[error("table checksum mismatch")]
    ChecksumMismatch,

    #[error("duplicate partition for type {kind:#04x} subtype {subtype:#04x}")]
    DuplicateRole { kind: u8, subtype: u8 },

    #[error("table does not fit in {0} bytes")]
    TooLarge(usize),

    #[error("label '{0}' is longer than 16 bytes")]
    LabelTooLong(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk size {0} must be between 1 and 65536 bytes")]
    ChunkSize(usize),

    #[error("image path must be a non-empty path relative to the mount point, got '{0}'")]
    ImagePath(String),
}

/// How a fatal error should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Flash geography is not what the flasher was built for
    Configuration,
    /// The update image cannot be trusted
    Integrity,
    /// A flash or media operation failed
    Io,
}

/// Fatal outcome of a boot cycle
#[derive(Debug, Error)]
pub enum BootError {
    #[error("unexpected partition layout: {0}")]
    Layout(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("partition table rejected: {0}")]
    Table(#[from] TableError),

    #[error("image '{0}' not found on removable media")]
    MissingImage(String),

    #[error("image is {len} bytes but partition '{label}' holds only {capacity}")]
    ImageTooLarge { label: String, len: u64, capacity: u32 },

    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("flash operation failed: {0}")]
    Flash(#[from] FlashError),

    #[error("removable media failed: {0}")]
    Media(#[from] io::Error),
}

impl BootError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BootError::Layout(_) | BootError::Config(_) | BootError::Table(_) => {
                ErrorClass::Configuration
            }
            BootError::MissingImage(_)
            | BootError::ImageTooLarge { .. }
            | BootError::Integrity(IntegrityError::Mismatch { .. })
            | BootError::Integrity(IntegrityError::Truncated { .. }) => ErrorClass::Integrity,
            BootError::Integrity(IntegrityError::Io(_))
            | BootError::Flash(_)
            | BootError::Media(_) => ErrorClass::Io,
        }
    }
}

/// Lowercase hex rendering used in diagnostics
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(BootError::Layout("x".into()).class(), ErrorClass::Configuration);
        assert_eq!(BootError::MissingImage("app.bin".into()).class(), ErrorClass::Integrity);
        assert_eq!(
            BootError::Integrity(IntegrityError::Truncated { expected: 64, available: 10 }).class(),
            ErrorClass::Integrity
        );
        assert_eq!(BootError::Flash(FlashError::PowerLoss).class(), ErrorClass::Io);
    }

    #[test]
    fn test_mismatch_message_shows_both_digests() {
        let err = IntegrityError::Mismatch {
            expected: [0xaa; 32],
            actual: [0xbb; 32],
            first_difference: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains(&"aa".repeat(32)));
        assert!(msg.contains(&"bb".repeat(32)));
    }
}
