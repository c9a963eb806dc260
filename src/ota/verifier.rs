// Streaming integrity check of an update image
//
// File layout: [payload][SHA-256 of payload, 32 bytes]

use std::io::{ErrorKind, Read};

use log::{debug, info};
use sha2::{Digest, Sha256};

use super::DIGEST_LEN;
use crate::error::IntegrityError;

/// Verify a whole update file of `file_len` bytes; returns the payload digest
pub fn verify_image_file<R: Read>(
    reader: R,
    file_len: u64,
    chunk_size: usize,
) -> Result<[u8; DIGEST_LEN], IntegrityError> {
    let payload_len = file_len
        .checked_sub(DIGEST_LEN as u64)
        .ok_or(IntegrityError::Truncated {
            expected: DIGEST_LEN as u64,
            available: file_len,
        })?;
    verify_image(reader, payload_len, chunk_size)
}

/// Hash exactly `payload_len` bytes of `reader`, then compare against the
/// next 32 bytes
pub fn verify_image<R: Read>(
    mut reader: R,
    payload_len: u64,
    chunk_size: usize,
) -> Result<[u8; DIGEST_LEN], IntegrityError> {
    let chunk_size = chunk_size.max(1);
    let expected_total = payload_len + DIGEST_LEN as u64;
    let mut buffer = vec![0u8; chunk_size];
    let mut hasher = Sha256::new();
    let mut remaining = payload_len;

    while remaining > 0 {
        // last chunk may straddle the payload/digest boundary
        let want = remaining.min(chunk_size as u64) as usize;
        let read = read_some(&mut reader, &mut buffer[..want])?;
        if read == 0 {
            return Err(IntegrityError::Truncated {
                expected: expected_total,
                available: payload_len - remaining,
            });
        }
        hasher.update(&buffer[..read]);
        remaining -= read as u64;
    }
    debug!("Hashed {} payload bytes", payload_len);

    let mut claimed = [0u8; DIGEST_LEN];
    let mut filled = 0;
    while filled < DIGEST_LEN {
        let read = read_some(&mut reader, &mut claimed[filled..])?;
        if read == 0 {
            return Err(IntegrityError::Truncated {
                expected: expected_total,
                available: payload_len + filled as u64,
            });
        }
        filled += read;
    }

    let actual: [u8; DIGEST_LEN] = hasher.finalize().into();
    match claimed.iter().zip(actual.iter()).position(|(a, b)| a != b) {
        None => {
            info!("Image digest verified ({} bytes)", payload_len);
            Ok(actual)
        }
        Some(first_difference) => Err(IntegrityError::Mismatch {
            expected: claimed,
            actual,
            first_difference,
        }),
    }
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, IntegrityError> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
