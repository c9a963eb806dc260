// Partition-to-partition copy in bounded strides

use log::{debug, info};

use crate::error::FlashError;
use crate::partition::{Partition, SECTOR_SIZE};
use crate::platform::FlashPlatform;

/// Erase `dest` and copy `source` into it, `chunk_size` bytes at a time.
///
/// Copies `min(source.size, dest.size)` bytes and returns that length. Any
/// failing stride aborts the copy; the boot pointer is left to the caller.
pub fn copy_partition<P: FlashPlatform + ?Sized>(
    platform: &mut P,
    source: &Partition,
    dest: &Partition,
    chunk_size: usize,
) -> Result<u32, FlashError> {
    let len = source.size.min(dest.size);
    let stride = chunk_size.max(1) as u32;

    info!(
        "Copying ota{} ({}) -> ota{} ({})",
        slot_name(source),
        source.label,
        slot_name(dest),
        dest.label
    );
    info!("Target partition: size {:#x}, copying {:#x} bytes", dest.size, len);

    // Writes can only clear bits, so the destination must be erased first
    let erase_len = (len.div_ceil(SECTOR_SIZE) * SECTOR_SIZE).min(dest.size);
    platform.erase_range(dest, 0, erase_len)?;

    let mut buffer = vec![0u8; stride as usize];
    let mut offset = 0u32;
    while offset < len {
        let n = stride.min(len - offset);
        let chunk = &mut buffer[..n as usize];
        platform.read(source, offset, chunk)?;
        platform.write(dest, offset, chunk)?;
        offset += n;

        if offset % 0x40000 == 0 || offset == len {
            debug!("Copy progress: {:#x}/{:#x}", offset, len);
        }
    }

    Ok(len)
}

/// Whether `dest` already holds what `copy_partition` would put there.
///
/// Compares the same `min(source.size, dest.size)` bytes, stopping at the
/// first differing stride. Reads only.
pub fn partition_matches<P: FlashPlatform + ?Sized>(
    platform: &mut P,
    source: &Partition,
    dest: &Partition,
    chunk_size: usize,
) -> Result<bool, FlashError> {
    let len = source.size.min(dest.size);
    let stride = chunk_size.max(1) as u32;
    let mut ours = vec![0u8; stride as usize];
    let mut theirs = vec![0u8; stride as usize];

    let mut offset = 0u32;
    while offset < len {
        let n = stride.min(len - offset) as usize;
        platform.read(source, offset, &mut ours[..n])?;
        platform.read(dest, offset, &mut theirs[..n])?;
        if ours[..n] != theirs[..n] {
            debug!("{} differs from {} near {:#x}", dest.label, source.label, offset);
            return Ok(false);
        }
        offset += n as u32;
    }
    Ok(true)
}

fn slot_name(p: &Partition) -> String {
    p.ota_index()
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionKind, PartitionSubtype, PartitionTable};
    use crate::sim::{FlashOp, SimDevice};
    use proptest::prelude::*;

    const SRC_SIZE: u32 = 0x6000;
    const DST_SIZE: u32 = 0x4000;

    fn small_layout() -> PartitionTable {
        let slot = |label: &str, n, address, size| Partition {
            label: label.to_string(),
            kind: PartitionKind::App,
            subtype: PartitionSubtype::Ota(n),
            address,
            size,
            flags: 0,
        };
        PartitionTable::new(vec![
            slot("a", 0, 0x10000, SRC_SIZE),
            slot("b", 1, 0x20000, DST_SIZE),
            slot("c", 2, 0x30000, SRC_SIZE),
        ])
        .unwrap()
    }

    fn setup(contents: &[u8]) -> (SimDevice, Partition, Partition) {
        let mut device = SimDevice::new(0x40000, &small_layout(), 0x10000);
        device.load(0x10000, contents);
        let a = device.find_partition(PartitionKind::App, PartitionSubtype::Ota(0), None).unwrap();
        let c = device.find_partition(PartitionKind::App, PartitionSubtype::Ota(2), None).unwrap();
        (device, a, c)
    }

    #[test]
    fn test_copy_unaligned_tail() {
        let contents: Vec<u8> = (0..SRC_SIZE).map(|i| (i % 251) as u8).collect();
        let (mut device, a, c) = setup(&contents);

        // 0x6000 is not a multiple of 0x1400, so the last stride is short
        let copied = copy_partition(&mut device, &a, &c, 0x1400).unwrap();
        assert_eq!(copied, SRC_SIZE);
        assert_eq!(device.partition_bytes("c").unwrap(), &contents[..]);

        let writes: Vec<u32> = device
            .journal()
            .iter()
            .filter_map(|op| match op {
                FlashOp::Write { len, .. } => Some(*len),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![0x1400, 0x1400, 0x1400, 0x1400, 0x1000]);
    }

    #[test]
    fn test_copy_is_bounded_by_smaller_partition() {
        let contents: Vec<u8> = (0..SRC_SIZE).map(|i| (i % 13) as u8).collect();
        let (mut device, a, _) = setup(&contents);
        let b = device.find_partition(PartitionKind::App, PartitionSubtype::Ota(1), None).unwrap();

        let copied = copy_partition(&mut device, &a, &b, 0x1000).unwrap();
        assert_eq!(copied, DST_SIZE);
        assert_eq!(device.partition_bytes("b").unwrap(), &contents[..DST_SIZE as usize]);
    }

    #[test]
    fn test_erase_happens_before_first_write() {
        let (mut device, a, c) = setup(&[0x00; 16]);
        copy_partition(&mut device, &a, &c, 0x2000).unwrap();
        assert!(matches!(device.journal()[0], FlashOp::EraseRange { offset: 0, len: SRC_SIZE, .. }));
    }

    #[test]
    fn test_failed_stride_aborts_copy() {
        let (mut device, a, c) = setup(&[0x00; 16]);
        // erase + two strides, then power is gone
        device.cut_power_after(3);
        let err = copy_partition(&mut device, &a, &c, 0x1000).unwrap_err();
        assert!(matches!(err, FlashError::PowerLoss));
        let writes = device
            .journal()
            .iter()
            .filter(|op| matches!(op, FlashOp::Write { .. }))
            .count();
        assert_eq!(writes, 2);
    }

    #[test]
    fn test_matches_after_copy() {
        let contents: Vec<u8> = (0..SRC_SIZE).map(|i| (i % 97) as u8).collect();
        let (mut device, a, c) = setup(&contents);
        assert!(!partition_matches(&mut device, &a, &c, 0x1000).unwrap());

        copy_partition(&mut device, &a, &c, 0x1000).unwrap();
        device.clear_journal();
        assert!(partition_matches(&mut device, &a, &c, 0x1000).unwrap());
        assert!(device.journal().is_empty());
    }

    #[test]
    fn test_torn_copy_does_not_match() {
        let contents: Vec<u8> = (0..SRC_SIZE).map(|i| (i % 97) as u8).collect();
        let (mut device, a, c) = setup(&contents);
        // erase + one stride lands, the rest of the copy is lost
        device.cut_power_after(2);
        copy_partition(&mut device, &a, &c, 0x1000).unwrap_err();
        device.power_cycle();

        assert_eq!(&device.partition_bytes("c").unwrap()[..0x1000], &contents[..0x1000]);
        assert!(!partition_matches(&mut device, &a, &c, 0x1000).unwrap());
    }

    #[test]
    fn test_match_is_bounded_by_smaller_partition() {
        let contents: Vec<u8> = (0..SRC_SIZE).map(|i| (i % 13) as u8).collect();
        let (mut device, a, _) = setup(&contents);
        let b = device.find_partition(PartitionKind::App, PartitionSubtype::Ota(1), None).unwrap();
        copy_partition(&mut device, &a, &b, 0x1000).unwrap();
        assert!(partition_matches(&mut device, &a, &b, 0x1000).unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_destination_matches_source(
            contents in proptest::collection::vec(any::<u8>(), SRC_SIZE as usize),
            chunk in 1usize..0x3000,
        ) {
            let (mut device, a, c) = setup(&contents);
            // leave stale data in the destination to prove the erase
            device.load(0x30000, &[0x00; 64]);
            copy_partition(&mut device, &a, &c, chunk).unwrap();
            prop_assert_eq!(device.partition_bytes("c").unwrap(), &contents[..]);
        }
    }
}
