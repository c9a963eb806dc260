// OTA pipeline: verify the image, move partitions around, write the image

pub mod copier;
pub mod verifier;
pub mod writer;

pub use copier::{copy_partition, partition_matches};
pub use verifier::{verify_image, verify_image_file};
pub use writer::{write_image, ImageWriter, WriteStatus};

/// Length of the SHA-256 digest appended to every update image
pub const DIGEST_LEN: usize = 32;

/// Stride used for partition copies and image writes
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

// Update flow per boot:
// 1. Verify the image on the SD card
// 2. Stream it into the update partition
// 3. Set boot partition
// 4. Restart
