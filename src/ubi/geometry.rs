//! PEB-size detection by magic-number frequency analysis.
//!
//! The PEB size is not recorded anywhere in a raw dump; it is recovered by
//! scanning for erase-counter magic occurrences and taking the most frequent
//! distance between consecutive hits. The scan streams fixed-size windows so
//! arbitrarily large dumps never need to fit in memory.

use std::collections::HashMap;
use std::io::{self, Read};

use income::UBI_EC_HDR_MAGIC;

use super::UbiError;
use crate::util::ReadExt;

const SCAN_WINDOW_SIZE: usize = 1024 * 1024;

/// The per-source block geometry, computed once per scan and read-only for
/// every later stage.
#[derive(Debug, Copy, Clone)]
pub struct Geometry {
    /// Physical erase block size, in bytes.
    pub peb_size: u32,

    /// Logical erase block size: `peb_size` minus the data offset.
    pub leb_size: u32,

    /// Minimum I/O unit, as implied by the VID header offset.
    pub min_io_size: u32,

    /// Index of the first PEB carrying UBI data, counted in `peb_size` units
    /// from the start of the file.
    pub first_peb: u32,

    /// Byte offset of the first UBI PEB. The UBI area need not start at the
    /// beginning of the dump.
    pub start_offset: u64,

    /// Number of whole PEBs between `start_offset` and the end of the file.
    pub peb_count: u32,
}

/// Stream the source and record the absolute offset of every erase-counter
/// magic occurrence, including ones straddling window boundaries.
pub(crate) fn scan_magic_offsets<R: Read>(source: &mut R) -> io::Result<Vec<u64>> {
    let magic_len = UBI_EC_HDR_MAGIC.len();
    let mut offsets = Vec::new();

    let mut window: Vec<u8> = Vec::with_capacity(SCAN_WINDOW_SIZE + magic_len);
    let mut base: u64 = 0; // file offset of window[0]

    loop {
        let carry = window.len();
        source.read_to_vec(&mut window, SCAN_WINDOW_SIZE)?;
        if window.len() == carry {
            break; // EOF
        }

        // Start just far enough back to catch a magic split across the
        // previous window boundary without double-counting.
        let search_from = carry.saturating_sub(magic_len - 1);
        for (i, probe) in window[search_from..].windows(magic_len).enumerate() {
            if probe == UBI_EC_HDR_MAGIC {
                offsets.push(base + (search_from + i) as u64);
            }
        }

        let keep_from = window.len().saturating_sub(magic_len - 1);
        window.drain(..keep_from);
        base += keep_from as u64;
    }

    Ok(offsets)
}

/// Histogram the deltas between consecutive magic offsets; the most frequent
/// delta is the PEB size, with ties broken toward the smallest (the smallest
/// plausible block size).
pub(crate) fn peb_size_from_offsets(offsets: &[u64]) -> Result<u32, UbiError> {
    if offsets.len() < 2 {
        return Err(UbiError::GeometryUnresolved);
    }

    let mut occurrences: HashMap<u64, u32> = HashMap::new();
    for pair in offsets.windows(2) {
        *occurrences.entry(pair[1] - pair[0]).or_insert(0) += 1;
    }

    occurrences
        .into_iter()
        .max_by_key(|&(delta, count)| (count, std::cmp::Reverse(delta)))
        .and_then(|(delta, _)| u32::try_from(delta).ok())
        .ok_or(UbiError::GeometryUnresolved)
}

/// Return the most probable PEB size of the source.
pub fn guess_peb_size<R: Read>(source: &mut R) -> Result<u32, UbiError> {
    let offsets = scan_magic_offsets(source)?;
    peb_size_from_offsets(&offsets)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn source_with_magic_at(len: usize, offsets: &[usize]) -> Cursor<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        for &at in offsets {
            bytes[at..at + UBI_EC_HDR_MAGIC.len()].copy_from_slice(UBI_EC_HDR_MAGIC);
        }
        Cursor::new(bytes)
    }

    #[test]
    fn test_recovers_block_size() -> anyhow::Result<()> {
        for peb_size in [2048usize, 4096, 131072] {
            let offsets: Vec<usize> = (0..6).map(|i| i * peb_size).collect();
            let mut source = source_with_magic_at(peb_size * 6, &offsets);
            assert_eq!(guess_peb_size(&mut source)?, peb_size as u32);
        }
        Ok(())
    }

    #[test]
    fn test_tie_breaks_to_smallest_delta() -> anyhow::Result<()> {
        // Deltas: 1024, 1024, 2048, 2048 -- a tie, so 1024 must win.
        let mut source = source_with_magic_at(8192, &[0, 1024, 2048, 4096, 6144]);
        assert_eq!(guess_peb_size(&mut source)?, 1024);
        Ok(())
    }

    #[test]
    fn test_magic_straddling_window_boundary() -> anyhow::Result<()> {
        let step = SCAN_WINDOW_SIZE - 2;
        let mut source = source_with_magic_at(step * 3, &[0, step, step * 2]);
        assert_eq!(guess_peb_size(&mut source)?, step as u32);
        Ok(())
    }

    #[test]
    fn test_unresolved_geometry() {
        for magic_offsets in [&[][..], &[512][..]] {
            let mut source = source_with_magic_at(4096, magic_offsets);
            assert!(matches!(
                guess_peb_size(&mut source),
                Err(UbiError::GeometryUnresolved)
            ));
        }
    }
}
