//! The UBI reconstruction pipeline.
//!
//! A raw NAND dump goes through six stages, each consuming the immutable
//! output of the previous one:
//!
//! 1. geometry detection (PEB size by magic-frequency analysis),
//! 2. header parsing (EC and VID headers per block, CRC-checked),
//! 3. classification (layout / data / internal / unknown),
//! 4. layout resolution (elect the authoritative volume-table copy),
//! 5. image assembly (group blocks into images, build volume shells),
//! 6. volume reading (map LEBs to PEBs, produce the logical byte stream).
//!
//! [`Ubi::scan`] runs stages 1–5; [`VolumeReader`] is stage 6. Per-block and
//! per-image corruption is absorbed into the results; only an unresolvable
//! geometry or an I/O failure on the source aborts a scan.

mod geometry;
mod headers;
mod image;
mod layout;
mod reader;
mod scan;
#[cfg(test)]
mod testimage;

pub use geometry::{guess_peb_size, Geometry};
pub use headers::{
    Ec, Vid, VolTableRecord, VolType, UBI_CRC, UBI_INTERNAL_VOL_START, UBI_LAYOUT_VOL_ID,
};
pub use image::{Image, ImageContent, Volume};
pub use layout::{group_pairs, LayoutPair, VolTableEntry};
pub use reader::VolumeReader;
pub use scan::{scan_pebs, BlockKind, Peb, Pebt};

use std::io::{Read, Seek, SeekFrom};

use thiserror::Error;

/// The error taxonomy of the pipeline.
///
/// Per-header failures never surface here; they downgrade blocks to
/// [`BlockKind::Unknown`] during classification. Per-image failures are
/// carried inside [`ImageContent::Unreconstructible`] so sibling images still
/// extract.
#[derive(Debug, Error)]
pub enum UbiError {
    /// No plausible PEB size; fatal to the whole scan.
    #[error("no plausible PEB size found (fewer than two UBI magic occurrences)")]
    GeometryUnresolved,

    /// A mapped block's header declares something impossible. During the scan
    /// this is absorbed into classification and never raised.
    #[error("PEB {peb} carries an invalid header")]
    HeaderInvalid { peb: u32 },

    /// An image's volume table cannot be recovered; fatal to that image only.
    #[error("layout volume of image {image_seq:#010x} is corrupt: {reason}")]
    LayoutCorrupt { image_seq: u32, reason: String },

    /// A static volume's content does not match its declared CRC. The bytes
    /// already produced remain valid output; the caller decides whether to
    /// trust them.
    #[error(
        "volume {vol_id} LEB {lnum} data CRC mismatch: expected {expected:#010x}, computed {computed:#010x}"
    )]
    VolumeChecksumMismatch {
        vol_id: u32,
        lnum: u32,
        expected: u32,
        computed: u32,
    },

    /// A read past the end of a volume; fatal to that read call only.
    #[error("read past the end of volume {vol_id} (LEB {lnum})")]
    VolumeBoundsExceeded { vol_id: u32, lnum: u32 },

    /// A static volume is missing a block below its declared used size.
    #[error("static volume {vol_id} is missing LEB {lnum}")]
    StaticVolumeGap { vol_id: u32, lnum: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Scan knobs whose correct setting depends on the dump's provenance.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Whether an image's reported PEB range includes its layout pair.
    /// Reference dumps differ on this boundary convention.
    pub range_includes_layout: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            range_includes_layout: true,
        }
    }
}

/// Per-classification block counts over one scanned source.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Census {
    pub layout: usize,
    pub internal: usize,
    pub data: usize,
    pub unknown: usize,
}

/// The fully scanned state of one source: geometry, the block arena, and the
/// assembled images.
#[derive(Debug)]
pub struct Ubi {
    pub geometry: Geometry,
    pub pebs: Pebt,
    pub images: Vec<Image>,
}

impl Ubi {
    /// Run the pipeline over a source with default options.
    pub fn scan<F: Read + Seek>(source: &mut F) -> Result<Self, UbiError> {
        Self::scan_with(source, ScanOptions::default())
    }

    /// Run the pipeline over a source.
    pub fn scan_with<F: Read + Seek>(
        source: &mut F,
        options: ScanOptions,
    ) -> Result<Self, UbiError> {
        let file_size = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;

        let offsets = geometry::scan_magic_offsets(source)?;
        let peb_size = geometry::peb_size_from_offsets(&offsets)?;
        let start_offset = offsets[0];
        let peb_count = u32::try_from((file_size - start_offset) / u64::from(peb_size))
            .map_err(|_| UbiError::GeometryUnresolved)?;

        let pebs = scan::scan_pebs(source, peb_size, start_offset, peb_count)?;

        // Any block with a valid EC header pins down the LEB size and the
        // minimum I/O unit for the whole source.
        let probe = pebs
            .iter()
            .find_map(|peb| peb.ec.filter(|ec| ec.hdr_valid && ec.data_offset < peb_size))
            .ok_or(UbiError::GeometryUnresolved)?;

        let geometry = Geometry {
            peb_size,
            leb_size: peb_size - probe.data_offset,
            min_io_size: probe.vid_hdr_offset,
            first_peb: (start_offset / u64::from(peb_size)) as u32,
            start_offset,
            peb_count,
        };

        let resolved = layout::group_pairs(&pebs)
            .into_iter()
            .map(|pair| {
                let table = layout::decode_volume_table(source, &pebs, &pair, &geometry);
                (pair, table)
            })
            .collect();

        let images = image::assemble(&pebs, resolved, &options);

        Ok(Self {
            geometry,
            pebs,
            images,
        })
    }

    /// Begin reading one volume. The source handle need not be the one used
    /// for scanning, as long as it views the same bytes.
    pub fn reader<'a, F: Read + Seek>(
        &'a self,
        source: &'a mut F,
        volume: &'a Volume,
    ) -> VolumeReader<'a, F> {
        VolumeReader::new(source, &self.pebs, volume, &self.geometry)
    }

    /// Count blocks per classification bucket.
    pub fn census(&self) -> Census {
        self.pebs
            .iter()
            .fold(Census::default(), |mut census, peb| {
                match peb.kind() {
                    BlockKind::Layout => census.layout += 1,
                    BlockKind::InternalVolume => census.internal += 1,
                    BlockKind::Data => census.data += 1,
                    BlockKind::Unknown => census.unknown += 1,
                }
                census
            })
    }
}
