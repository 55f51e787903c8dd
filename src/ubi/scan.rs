//! Per-PEB header harvest and block classification.

use std::io::{Read, Seek};

use super::headers::*;
use super::UbiError;
use crate::util::ReadAt;

/// One physical erase block, as seen by the scan pass. Created once per scan
/// and immutable thereafter; the payload itself is never held here, only the
/// two headers.
#[derive(Debug, Copy, Clone)]
pub struct Peb {
    /// 0-based position within the UBI area of the source.
    pub index: u32,

    /// Absolute byte offset of the block in the source.
    pub offset: u64,

    /// The erase-counter header, or `None` if the first bytes of the block do
    /// not even frame as one.
    pub ec: Option<Ec>,

    /// The volume-id header, read only when the EC header is valid and its
    /// declared VID offset is in bounds.
    pub vid: Option<Vid>,
}

/// The four classification buckets. Exactly one per PEB.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockKind {
    /// A copy of the layout volume (the volume table).
    Layout,

    /// A reserved internal volume other than the layout volume.
    InternalVolume,

    /// An ordinary volume's data block.
    Data,

    /// Failed header validation; excluded from all further reconstruction.
    Unknown,
}

impl Peb {
    /// Classify this block. Pure function of the parsed headers.
    pub fn kind(&self) -> BlockKind {
        let ec_ok = self.ec.map_or(false, |ec| ec.hdr_valid);
        match self.vid {
            Some(vid) if ec_ok && vid.hdr_valid => match vid.vol_id {
                UBI_LAYOUT_VOL_ID => BlockKind::Layout,
                id if id >= UBI_INTERNAL_VOL_START => BlockKind::InternalVolume,
                _ => BlockKind::Data,
            },
            _ => BlockKind::Unknown,
        }
    }
}

/// The (P)hysical (e)rase (b)lock (t)able: every block of the UBI area,
/// densely indexed by PEB number.
pub type Pebt = Box<[Peb]>;

/// Read the headers of every PEB in the source (and nothing else) and return
/// the [Pebt]. I/O errors here halt the run; corrupt headers do not.
pub fn scan_pebs<F: Read + Seek>(
    source: &mut F,
    peb_size: u32,
    start_offset: u64,
    peb_count: u32,
) -> Result<Pebt, UbiError> {
    let rpt = howudoin::new()
        .label("Scanning PEBs")
        .set_len(u64::from(peb_count));

    let mut pebs = Vec::with_capacity(peb_count as usize);
    let mut ec_buf = [0u8; UBI_EC_HDR_SIZE];
    let mut vid_buf = [0u8; UBI_VID_HDR_SIZE];

    for index in 0..peb_count {
        let offset = start_offset + u64::from(index) * u64::from(peb_size);

        source.read_exact_at(offset, &mut ec_buf)?;
        let ec = Ec::decode(&ec_buf);

        let vid = match ec {
            Some(ec)
                if ec.hdr_valid
                    && ec.vid_hdr_offset as usize + UBI_VID_HDR_SIZE <= peb_size as usize =>
            {
                source.read_exact_at(offset + u64::from(ec.vid_hdr_offset), &mut vid_buf)?;
                Vid::decode(&vid_buf)
            }
            _ => None,
        };

        pebs.push(Peb {
            index,
            offset,
            ec,
            vid,
        });
        rpt.inc();
    }

    rpt.close();

    Ok(pebs.into())
}

#[cfg(test)]
mod test {
    use super::super::testimage::{SourceBuilder, TEST_PEB_SIZE};
    use super::*;

    #[test]
    fn test_scan_and_classify() -> anyhow::Result<()> {
        let mut builder = SourceBuilder::new(TEST_PEB_SIZE);
        builder.push_layout(1, &[], 0);
        builder.push_data(0, 0, 2, &[0xAB; 100]);
        builder.push_internal(UBI_INTERNAL_VOL_START + 1, 0, 3);
        builder.push_data(1, 0, 4, &[0xCD; 100]);

        let mut source = builder.build();
        let pebs = scan_pebs(&mut source, TEST_PEB_SIZE, 0, 4)?;

        let kinds: Vec<BlockKind> = pebs.iter().map(Peb::kind).collect();
        assert_eq!(
            kinds,
            [
                BlockKind::Layout,
                BlockKind::Data,
                BlockKind::InternalVolume,
                BlockKind::Data,
            ]
        );
        assert_eq!(pebs[1].offset, u64::from(TEST_PEB_SIZE));
        Ok(())
    }

    #[test]
    fn test_flipped_ec_bit_downgrades_to_unknown() -> anyhow::Result<()> {
        let mut builder = SourceBuilder::new(TEST_PEB_SIZE);
        builder.push_data(0, 0, 1, &[0x11; 64]);
        builder.push_data(0, 1, 2, &[0x22; 64]);
        builder.corrupt_byte(TEST_PEB_SIZE as usize + 8); // inside PEB 1's EC header

        let mut source = builder.build();
        let pebs = scan_pebs(&mut source, TEST_PEB_SIZE, 0, 2)?;

        assert_eq!(pebs[0].kind(), BlockKind::Data);
        assert_eq!(pebs[1].kind(), BlockKind::Unknown);
        assert!(matches!(pebs[1].ec, Some(ec) if !ec.hdr_valid));
        Ok(())
    }

    #[test]
    fn test_bad_vid_downgrades_to_unknown() -> anyhow::Result<()> {
        let mut builder = SourceBuilder::new(TEST_PEB_SIZE);
        builder.push_data(3, 0, 1, &[0x33; 64]);
        // Flip a bit inside the VID header (it sits at the EC-declared offset)
        builder.corrupt_byte(builder.vid_hdr_offset() as usize + 20);

        let mut source = builder.build();
        let pebs = scan_pebs(&mut source, TEST_PEB_SIZE, 0, 1)?;

        assert_eq!(pebs[0].kind(), BlockKind::Unknown);
        assert!(matches!(pebs[0].ec, Some(ec) if ec.hdr_valid));
        Ok(())
    }
}
