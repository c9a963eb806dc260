// Image writer - streams a verified image through the platform's staged OTA API

use std::io::{ErrorKind, Read};

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use super::DIGEST_LEN;
use crate::error::{BootError, FlashError, IntegrityError};
use crate::partition::Partition;
use crate::platform::FlashPlatform;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteStatus {
    Writing { progress: u8 },
    Finishing,
    Ready,
    Failed,
}

/// One staged write into an app partition. Dropping an unfinished writer
/// aborts the write so the half-written slot is never validated.
pub struct ImageWriter<'p, P: FlashPlatform + ?Sized> {
    platform: &'p mut P,
    partition: Partition,
    expected_size: u64,
    bytes_written: u64,
    status: WriteStatus,
    active: bool,
}

impl<'p, P: FlashPlatform + ?Sized> ImageWriter<'p, P> {
    pub fn begin(platform: &'p mut P, partition: &Partition, size: u64) -> Result<Self, FlashError> {
        if size == 0 || size > partition.size as u64 {
            return Err(FlashError::OutOfBounds {
                label: partition.label.clone(),
                offset: 0,
                len: u32::try_from(size).unwrap_or(u32::MAX),
                size: partition.size,
            });
        }

        platform.begin_image_write(partition, size)?;

        Ok(Self {
            platform,
            partition: partition.clone(),
            expected_size: size,
            bytes_written: 0,
            status: WriteStatus::Writing { progress: 0 },
            active: true,
        })
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), FlashError> {
        if !self.active {
            return Err(FlashError::NoImageWrite);
        }

        if let Err(e) = self.platform.write_image_chunk(data) {
            self.status = WriteStatus::Failed;
            return Err(e);
        }

        self.bytes_written += data.len() as u64;
        let progress = ((self.bytes_written * 100) / self.expected_size).min(100) as u8;
        if let WriteStatus::Writing { progress: last } = self.status {
            if progress / 10 != last / 10 {
                debug!("Flash progress: {}% ({}/{})", progress, self.bytes_written, self.expected_size);
            }
        }
        self.status = WriteStatus::Writing { progress };

        Ok(())
    }

    /// Close the staged write; the platform validates the image here
    pub fn finish(mut self) -> Result<u64, FlashError> {
        self.status = WriteStatus::Finishing;
        // Either way the platform handle is consumed
        self.active = false;

        if let Err(e) = self.platform.end_image_write() {
            self.status = WriteStatus::Failed;
            return Err(e);
        }

        self.status = WriteStatus::Ready;
        Ok(self.bytes_written)
    }

    pub fn status(&self) -> WriteStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        match self.status {
            WriteStatus::Writing { progress } => progress,
            WriteStatus::Ready => 100,
            _ => 0,
        }
    }
}

impl<P: FlashPlatform + ?Sized> Drop for ImageWriter<'_, P> {
    fn drop(&mut self) {
        if self.active {
            warn!("Aborting unfinished image write to {}", self.partition);
            self.platform.abort_image_write();
        }
    }
}

/// Stream an update file of `len` bytes from `reader` into `partition`.
///
/// The payload is hashed again on the way to flash and the trailing digest
/// is kept as streamed. Both must equal `digest`, the value the file was
/// verified against, before the write is closed; otherwise the writer is
/// dropped and the staged write aborted.
pub fn write_image<P: FlashPlatform + ?Sized, R: Read>(
    platform: &mut P,
    partition: &Partition,
    mut reader: R,
    len: u64,
    chunk_size: usize,
    digest: &[u8; DIGEST_LEN],
) -> Result<u64, BootError> {
    let payload_len = len.checked_sub(DIGEST_LEN as u64).ok_or(IntegrityError::Truncated {
        expected: DIGEST_LEN as u64,
        available: len,
    })?;

    info!("Will flash {} bytes into {}", len, partition);
    let mut writer = ImageWriter::begin(platform, partition, len)?;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut hasher = Sha256::new();
    let mut trailer = [0u8; DIGEST_LEN];
    let mut position = 0u64;

    while position < len {
        let want = (len - position).min(buffer.len() as u64) as usize;
        let read = match reader.read(&mut buffer[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(BootError::Media(e)),
        };
        if read == 0 {
            // The file shrank after verification
            return Err(IntegrityError::Truncated {
                expected: len,
                available: position,
            }
            .into());
        }
        let chunk = &buffer[..read];
        let in_payload = payload_len.saturating_sub(position).min(read as u64) as usize;
        let (payload, tail) = chunk.split_at(in_payload);
        hasher.update(payload);
        if !tail.is_empty() {
            let at = (position + in_payload as u64 - payload_len) as usize;
            trailer[at..at + tail.len()].copy_from_slice(tail);
        }

        writer.write_chunk(chunk)?;
        position += read as u64;
    }

    let payload_digest: [u8; DIGEST_LEN] = hasher.finalize().into();
    for actual in [payload_digest, trailer] {
        if let Some(first_difference) = digest.iter().zip(actual.iter()).position(|(a, b)| a != b) {
            warn!("Flashed bytes differ from the verified image");
            return Err(IntegrityError::Mismatch {
                expected: *digest,
                actual,
                first_difference,
            }
            .into());
        }
    }

    let written = writer.finish()?;
    info!("Flash from SD card done.");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionKind, PartitionSubtype, PartitionTable};
    use crate::sim::{fake_app_image, with_trailing_digest, FlashOp, SimDevice};
    use std::io::Cursor;

    fn setup() -> (SimDevice, Partition) {
        let mut device = SimDevice::new(0x400000, &PartitionTable::sd_flasher_layout(), 0x390000);
        let app = device
            .find_partition(PartitionKind::App, PartitionSubtype::Ota(0), Some("app"))
            .unwrap();
        (device, app)
    }

    /// Update file of `len` bytes and the digest it carries
    fn update_file(len: usize) -> (Vec<u8>, [u8; DIGEST_LEN]) {
        let file = with_trailing_digest(&fake_app_image("firmware", "v1", len - DIGEST_LEN, 3));
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&file[len - DIGEST_LEN..]);
        (file, digest)
    }

    #[test]
    fn test_write_image_streams_all_bytes() {
        let (mut device, app) = setup();
        let (file, digest) = update_file(20_000);
        let written =
            write_image(&mut device, &app, Cursor::new(&file), file.len() as u64, 8192, &digest).unwrap();
        assert_eq!(written, file.len() as u64);
        assert_eq!(&device.partition_bytes("app").unwrap()[..file.len()], &file[..]);

        let chunks: Vec<u32> = device
            .journal()
            .iter()
            .filter_map(|op| match op {
                FlashOp::ImageChunk { len, .. } => Some(*len),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![8192, 8192, 3616]);
        assert!(matches!(device.journal().last(), Some(FlashOp::EndImage { .. })));
    }

    #[test]
    fn test_digest_split_across_chunks() {
        let (mut device, app) = setup();
        // the trailing digest straddles the second and third chunk
        let (file, digest) = update_file(4096 + 16);
        write_image(&mut device, &app, Cursor::new(&file), file.len() as u64, 2048, &digest).unwrap();
        assert!(matches!(device.journal().last(), Some(FlashOp::EndImage { .. })));
    }

    #[test]
    fn test_changed_payload_aborts_before_close() {
        let (mut device, app) = setup();
        let (mut file, digest) = update_file(10_000);
        file[5000] ^= 0x01;
        let err = write_image(&mut device, &app, Cursor::new(&file), file.len() as u64, 4096, &digest)
            .unwrap_err();
        assert!(matches!(
            err,
            BootError::Integrity(IntegrityError::Mismatch { expected, .. }) if expected == digest
        ));
        assert!(matches!(device.journal().last(), Some(FlashOp::AbortImage { .. })));
        assert!(!device.journal().iter().any(|op| matches!(op, FlashOp::EndImage { .. })));
    }

    #[test]
    fn test_changed_trailer_aborts_before_close() {
        let (mut device, app) = setup();
        let (mut file, digest) = update_file(10_000);
        let last = file.len() - 1;
        file[last] ^= 0x80;
        let err = write_image(&mut device, &app, Cursor::new(&file), file.len() as u64, 4096, &digest)
            .unwrap_err();
        assert!(matches!(
            err,
            BootError::Integrity(IntegrityError::Mismatch { first_difference: 31, .. })
        ));
        assert!(matches!(device.journal().last(), Some(FlashOp::AbortImage { .. })));
    }

    #[test]
    fn test_short_file_aborts_write() {
        let (mut device, app) = setup();
        let (file, digest) = update_file(10_000);
        let err = write_image(&mut device, &app, Cursor::new(&file[..5000]), file.len() as u64, 4096, &digest)
            .unwrap_err();
        assert!(matches!(err, BootError::Integrity(IntegrityError::Truncated { .. })));
        assert!(matches!(device.journal().last(), Some(FlashOp::AbortImage { .. })));
    }

    #[test]
    fn test_writer_progress_and_status() {
        let (mut device, app) = setup();
        let image = fake_app_image("firmware", "v1", 4000, 1);
        let mut writer = ImageWriter::begin(&mut device, &app, 4000).unwrap();
        writer.write_chunk(&image[..1000]).unwrap();
        assert_eq!(writer.progress(), 25);
        writer.write_chunk(&image[1000..]).unwrap();
        assert_eq!(writer.status(), WriteStatus::Writing { progress: 100 });
        assert_eq!(writer.finish().unwrap(), 4000);
    }

    #[test]
    fn test_oversized_image_rejected_before_any_erase() {
        let (mut device, app) = setup();
        let rejected = matches!(
            ImageWriter::begin(&mut device, &app, app.size as u64 + 1),
            Err(FlashError::OutOfBounds { .. })
        );
        assert!(rejected);
        assert!(device.journal().is_empty());
    }

    #[test]
    fn test_invalid_image_fails_on_finish() {
        let (mut device, app) = setup();
        let mut writer = ImageWriter::begin(&mut device, &app, 16).unwrap();
        writer.write_chunk(&[0u8; 16]).unwrap();
        assert!(matches!(writer.finish(), Err(FlashError::InvalidImage(_))));
        assert!(!device.journal().iter().any(|op| matches!(op, FlashOp::AbortImage { .. })));
    }
}
