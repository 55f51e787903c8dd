//! Image assembly: grouping classified PEBs into images and building each
//! image's volume shells with their LEB-to-PEB mappings.

use std::collections::BTreeMap;

use super::headers::VolType;
use super::layout::{LayoutPair, VolTableEntry};
use super::scan::{BlockKind, Pebt};
use super::{ScanOptions, UbiError};

/// One self-consistent set of PEBs sharing an image sequence number: the unit
/// of reconstruction.
#[derive(Debug)]
pub struct Image {
    pub image_seq: u32,
    pub vid_hdr_offset: u32,
    pub version: u8,

    /// `[start, end]` PEB indices, inclusive. Whether the layout pair counts
    /// into the range follows [`ScanOptions::range_includes_layout`].
    pub peb_range: [u32; 2],

    pub content: ImageContent,
}

/// Either the image's reconstructed volumes, or the reason there are none.
#[derive(Debug)]
pub enum ImageContent {
    Volumes(Vec<Volume>),
    Unreconstructible(UbiError),
}

impl Image {
    /// The image's volumes, if it could be reconstructed.
    pub fn volumes(&self) -> Option<&[Volume]> {
        match &self.content {
            ImageContent::Volumes(volumes) => Some(volumes),
            ImageContent::Unreconstructible(_) => None,
        }
    }
}

/// A logical volume within one image: its table entry's metadata plus the
/// ordered mapping from LEB number to the winning PEB.
#[derive(Debug)]
pub struct Volume {
    pub vol_id: u32,
    pub name: String,
    pub vol_type: VolType,
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub flags: u8,

    /// For static volumes, the LEB count declared by the member VID headers;
    /// 0 for dynamic volumes.
    pub used_ebs: u32,

    /// LEB number to PEB index. At most one PEB per LEB; collisions were
    /// settled by sequence number during assembly.
    pub leb_map: BTreeMap<u32, u32>,
}

impl Volume {
    /// Number of logical blocks a sequential read of this volume yields.
    pub fn leb_count(&self) -> u32 {
        match self.vol_type {
            VolType::Static => self.used_ebs,
            VolType::Dynamic => self
                .leb_map
                .last_key_value()
                .map_or(0, |(&lnum, _)| lnum + 1),
        }
    }
}

/// Group classified PEBs into [Image]s, attach each resolved layout pair, and
/// populate the volume shells.
pub(crate) fn assemble(
    pebs: &Pebt,
    resolved: Vec<(LayoutPair, Result<Vec<VolTableEntry>, UbiError>)>,
    options: &ScanOptions,
) -> Vec<Image> {
    // Bucket every data-bearing block by (image_seq, vid_hdr_offset).
    let mut members: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();
    for peb in pebs.iter() {
        if !matches!(peb.kind(), BlockKind::Data | BlockKind::InternalVolume) {
            continue;
        }
        if let Some(ec) = peb.ec {
            members
                .entry((ec.image_seq, ec.vid_hdr_offset))
                .or_default()
                .push(peb.index);
        }
    }

    let mut images = Vec::new();

    for (pair, table) in resolved {
        let Some(auth) = pair.authoritative(pebs) else {
            continue;
        };
        let Some(ec) = pebs[auth as usize].ec else {
            continue;
        };

        let group = members
            .remove(&(pair.image_seq, ec.vid_hdr_offset))
            .unwrap_or_default();

        let mut range_members = group.clone();
        if options.range_includes_layout {
            range_members.extend_from_slice(&pair.copies);
        }
        // Fall back to the pair itself for an image with no data blocks yet.
        let peb_range = range_of(range_members.iter().copied())
            .or_else(|| range_of(pair.copies.iter().copied()))
            .unwrap_or([auth, auth]);

        let content = match table {
            Ok(entries) => ImageContent::Volumes(build_volumes(pebs, &group, &entries)),
            Err(reason) => ImageContent::Unreconstructible(reason),
        };

        images.push(Image {
            image_seq: pair.image_seq,
            vid_hdr_offset: ec.vid_hdr_offset,
            version: ec.version,
            peb_range,
            content,
        });
    }

    // Whatever data groups remain have no layout volume describing them.
    for ((image_seq, vid_hdr_offset), group) in members {
        let Some(peb_range) = range_of(group.iter().copied()) else {
            continue;
        };
        let version = group
            .first()
            .and_then(|&index| pebs[index as usize].ec)
            .map_or(0, |ec| ec.version);

        images.push(Image {
            image_seq,
            vid_hdr_offset,
            version,
            peb_range,
            content: ImageContent::Unreconstructible(UbiError::LayoutCorrupt {
                image_seq,
                reason: "no layout volume found".to_string(),
            }),
        });
    }

    images.sort_by_key(|image| image.image_seq);
    images
}

fn range_of(indices: impl Iterator<Item = u32>) -> Option<[u32; 2]> {
    indices.fold(None, |acc, index| {
        Some(match acc {
            None => [index, index],
            Some([lo, hi]) => [lo.min(index), hi.max(index)],
        })
    })
}

fn build_volumes(pebs: &Pebt, group: &[u32], entries: &[VolTableEntry]) -> Vec<Volume> {
    entries
        .iter()
        .map(|entry| {
            let mut volume = Volume {
                vol_id: entry.vol_id,
                name: entry.record.name.clone(),
                vol_type: entry.record.vol_type,
                reserved_pebs: entry.record.reserved_pebs,
                alignment: entry.record.alignment,
                flags: entry.record.flags,
                used_ebs: 0,
                leb_map: BTreeMap::new(),
            };

            for &index in group {
                let Some(vid) = pebs[index as usize].vid else {
                    continue;
                };
                if vid.vol_id != entry.vol_id {
                    continue;
                }

                volume.used_ebs = volume.used_ebs.max(vid.used_ebs);

                // At most one winner per LEB: higher sequence number takes
                // the slot, ties keep the earlier block.
                match volume.leb_map.get(&vid.lnum) {
                    Some(&winner) if sqnum_of(pebs, winner) >= vid.sqnum => {}
                    _ => {
                        volume.leb_map.insert(vid.lnum, index);
                    }
                }
            }

            volume
        })
        .collect()
}

fn sqnum_of(pebs: &Pebt, index: u32) -> u64 {
    pebs[index as usize].vid.map_or(0, |vid| vid.sqnum)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_range_of() {
        assert_eq!(range_of([].into_iter()), None);
        assert_eq!(range_of([7].into_iter()), Some([7, 7]));
        assert_eq!(range_of([4, 19, 2, 11].into_iter()), Some([2, 19]));
    }
}
