//! Layout-volume resolution: pairing the redundant layout blocks, electing
//! the authoritative copy, and decoding the volume table from it.
//!
//! Layout copies are associated by shared image sequence number rather than
//! by index adjacency. On a well-formed dump the two copies are consecutive
//! anyway; grouping by sequence number additionally survives copies that got
//! scattered by wear-leveling.

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use super::geometry::Geometry;
use super::headers::{VolTableRecord, UBI_MAX_VOLUMES, UBI_VTBL_RECORD_SIZE};
use super::scan::{BlockKind, Pebt};
use super::UbiError;
use crate::util::ReadAt;

/// The layout blocks believed to hold redundant copies of one image's volume
/// table. Usually two copies; degenerate dumps may leave only one.
#[derive(Debug, Clone)]
pub struct LayoutPair {
    pub image_seq: u32,

    /// PEB indices of the copies, in ascending order.
    pub copies: Vec<u32>,
}

/// One declared volume within an image. The volume ID is the record's slot
/// position in the table.
#[derive(Debug, Clone)]
pub struct VolTableEntry {
    pub vol_id: u32,
    pub record: VolTableRecord,
}

/// Group all `Layout`-classified blocks into pairs.
pub fn group_pairs(pebs: &Pebt) -> Vec<LayoutPair> {
    let mut by_seq: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

    for peb in pebs.iter() {
        if peb.kind() != BlockKind::Layout {
            continue;
        }
        if let Some(ec) = peb.ec {
            by_seq.entry(ec.image_seq).or_default().push(peb.index);
        }
    }

    by_seq
        .into_iter()
        .map(|(image_seq, copies)| LayoutPair { image_seq, copies })
        .collect()
}

impl LayoutPair {
    /// Elect the copy to trust: the one with the highest VID sequence number.
    /// On a tie, the copy at the lower PEB index wins (earliest-is-canonical).
    pub fn authoritative(&self, pebs: &Pebt) -> Option<u32> {
        let mut best: Option<(u64, u32)> = None;

        for &index in &self.copies {
            let Some(vid) = pebs[index as usize].vid else {
                continue;
            };
            match best {
                // `copies` ascends, so strict comparison keeps the earlier
                // copy on equal sequence numbers.
                Some((sqnum, _)) if vid.sqnum <= sqnum => {}
                _ => best = Some((vid.sqnum, index)),
            }
        }

        best.map(|(_, index)| index)
    }
}

/// Decode the volume table from a pair's authoritative copy.
///
/// The winning copy is taken wholesale; entries of the losing copy are never
/// merged in, even when both copies validate. Slots that fail their record
/// CRC are skipped; a table with nothing but failing slots is corrupt.
pub fn decode_volume_table<F: Read + Seek>(
    source: &mut F,
    pebs: &Pebt,
    pair: &LayoutPair,
    geometry: &Geometry,
) -> Result<Vec<VolTableEntry>, UbiError> {
    let corrupt = |reason: &str| UbiError::LayoutCorrupt {
        image_seq: pair.image_seq,
        reason: reason.to_string(),
    };

    let auth = pair
        .authoritative(pebs)
        .ok_or_else(|| corrupt("no readable layout copy"))?;
    let peb = &pebs[auth as usize];
    let Some(ec) = peb.ec.filter(|ec| ec.hdr_valid && ec.data_offset < geometry.peb_size) else {
        return Err(corrupt("layout copy has no usable erase-counter header"));
    };

    // Clamp to the block in case this copy's data offset disagrees with the
    // probe block that defined the geometry.
    let span = (geometry.peb_size - ec.data_offset).min(geometry.leb_size) as usize;
    let table = source.read_vec_at(peb.offset + u64::from(ec.data_offset), span)?;

    let slots = (table.len() / UBI_VTBL_RECORD_SIZE).min(UBI_MAX_VOLUMES);
    let mut entries = Vec::new();
    let mut invalid = 0usize;

    for slot in 0..slots {
        let bytes = &table[slot * UBI_VTBL_RECORD_SIZE..][..UBI_VTBL_RECORD_SIZE];
        match VolTableRecord::decode(bytes) {
            Some(record) if record.is_empty() => {}
            Some(record) => entries.push(VolTableEntry {
                vol_id: slot as u32,
                record,
            }),
            None => invalid += 1,
        }
    }

    if entries.is_empty() && invalid > 0 {
        return Err(corrupt("every volume table record failed validation"));
    }

    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::super::headers::{VolTableRecord, VolType};
    use super::super::scan::scan_pebs;
    use super::super::testimage::{SourceBuilder, TEST_PEB_SIZE};
    use super::*;

    fn named_entry(name: &str) -> (u32, VolTableRecord) {
        (
            0,
            VolTableRecord {
                reserved_pebs: 4,
                alignment: 1,
                vol_type: VolType::Dynamic,
                name: name.to_string(),
                ..Default::default()
            },
        )
    }

    fn resolve(builder: SourceBuilder, peb_count: u32) -> anyhow::Result<Vec<VolTableEntry>> {
        let geometry = builder.geometry(peb_count);
        let mut source = builder.build();
        let pebs = scan_pebs(&mut source, TEST_PEB_SIZE, 0, peb_count)?;

        let pairs = group_pairs(&pebs);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].copies.len(), 2);

        Ok(decode_volume_table(&mut source, &pebs, &pairs[0], &geometry)?)
    }

    #[test]
    fn test_higher_sequence_copy_wins() -> anyhow::Result<()> {
        let mut builder = SourceBuilder::new(TEST_PEB_SIZE);
        builder.push_layout(5, &[named_entry("stale")], 0);
        builder.push_layout(7, &[named_entry("fresh")], 1);

        let entries = resolve(builder, 2)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].vol_id, 0);
        assert_eq!(entries[0].record.name, "fresh");
        Ok(())
    }

    #[test]
    fn test_sequence_tie_takes_lower_peb_index() -> anyhow::Result<()> {
        let mut builder = SourceBuilder::new(TEST_PEB_SIZE);
        builder.push_layout(9, &[named_entry("first")], 0);
        builder.push_layout(9, &[named_entry("second")], 1);

        let entries = resolve(builder, 2)?;
        assert_eq!(entries[0].record.name, "first");
        Ok(())
    }

    #[test]
    fn test_all_records_invalid_is_corrupt() -> anyhow::Result<()> {
        let mut builder = SourceBuilder::new(TEST_PEB_SIZE);
        builder.push_layout(1, &[named_entry("doomed")], 0);
        builder.push_layout(2, &[named_entry("doomed")], 1);

        // Trash every record of both copies (without touching the headers).
        let leb = builder.leb_size() as usize;
        for copy in 0..2usize {
            let data = copy * TEST_PEB_SIZE as usize + builder.data_offset() as usize;
            for at in data..data + leb {
                builder.corrupt_byte(at);
            }
        }

        let geometry = builder.geometry(2);
        let mut source = builder.build();
        let pebs = scan_pebs(&mut source, TEST_PEB_SIZE, 0, 2)?;
        let pairs = group_pairs(&pebs);

        let result = decode_volume_table(&mut source, &pebs, &pairs[0], &geometry);
        assert!(matches!(result, Err(UbiError::LayoutCorrupt { .. })));
        Ok(())
    }
}
