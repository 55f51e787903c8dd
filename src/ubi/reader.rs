//! Random and sequential access to a reconstructed volume's logical blocks.

use std::io::{Read, Seek, Write};

use super::geometry::Geometry;
use super::headers::{VolType, UBI_CRC};
use super::image::Volume;
use super::scan::Pebt;
use super::UbiError;
use crate::util::ReadAt;

/// Reads a volume's logical blocks out of the source, in LEB-number order or
/// by random access.
///
/// The reader owns nothing but its cursor; several readers over the same
/// immutable scan results may run at once, provided each gets its own source
/// handle (the read position is not shared).
pub struct VolumeReader<'a, F> {
    source: &'a mut F,
    pebs: &'a Pebt,
    volume: &'a Volume,
    leb_size: u32,
    next_lnum: u32,
}

impl<'a, F: Read + Seek> VolumeReader<'a, F> {
    pub fn new(source: &'a mut F, pebs: &'a Pebt, volume: &'a Volume, geometry: &Geometry) -> Self {
        Self {
            source,
            pebs,
            volume,
            leb_size: geometry.leb_size,
            next_lnum: 0,
        }
    }

    pub fn volume(&self) -> &Volume {
        self.volume
    }

    /// Number of logical blocks a full sequential read yields.
    pub fn leb_count(&self) -> u32 {
        self.volume.leb_count()
    }

    /// Append the contents of one logical block to `data`.
    ///
    /// An unmapped LEB of a dynamic volume appends a zero-filled block. For
    /// static volumes, the block's declared data CRC is verified; on a
    /// mismatch the bytes are still appended before the error returns, so the
    /// caller keeps them.
    pub fn read_leb(&mut self, lnum: u32, data: &mut Vec<u8>) -> Result<(), UbiError> {
        let vol_id = self.volume.vol_id;

        if lnum >= self.leb_count() {
            return Err(UbiError::VolumeBoundsExceeded { vol_id, lnum });
        }

        let index = match self.volume.leb_map.get(&lnum) {
            Some(&index) => index,
            None => match self.volume.vol_type {
                VolType::Dynamic => {
                    data.resize(data.len() + self.leb_size as usize, 0u8);
                    return Ok(());
                }
                VolType::Static => return Err(UbiError::StaticVolumeGap { vol_id, lnum }),
            },
        };

        let peb = &self.pebs[index as usize];
        let Some((ec, vid)) = peb.ec.zip(peb.vid) else {
            return Err(UbiError::HeaderInvalid { peb: index });
        };

        let len = match vid.vol_type {
            VolType::Static => vid.data_size,
            VolType::Dynamic => self.leb_size,
        };
        if len > self.leb_size {
            // A mapped block whose header declares an impossible payload; the
            // one way a bad header makes it past the classifier.
            return Err(UbiError::HeaderInvalid { peb: index });
        }

        let at = data.len();
        data.resize(at + len as usize, 0u8);
        self.source
            .read_exact_at(peb.offset + u64::from(ec.data_offset), &mut data[at..])?;

        if vid.vol_type == VolType::Static {
            let computed = UBI_CRC.checksum(&data[at..]);
            if computed != vid.data_crc {
                return Err(UbiError::VolumeChecksumMismatch {
                    vol_id,
                    lnum,
                    expected: vid.data_crc,
                    computed,
                });
            }
        }

        Ok(())
    }

    /// Append the next logical block to `data`, returning its LEB number, or
    /// `Ok(None)` at the end of the volume.
    ///
    /// The cursor advances even when the block fails its checksum, so a
    /// caller that tolerates mismatches can simply keep iterating.
    pub fn next_block(&mut self, data: &mut Vec<u8>) -> Result<Option<u32>, UbiError> {
        if self.next_lnum >= self.leb_count() {
            return Ok(None);
        }

        let lnum = self.next_lnum;
        self.next_lnum += 1;
        self.read_leb(lnum, data)?;
        Ok(Some(lnum))
    }

    /// Restart sequential reading from LEB 0.
    pub fn rewind(&mut self) {
        self.next_lnum = 0;
    }

    /// Drain the whole volume into `out`, returning the byte count written.
    ///
    /// Checksum mismatches do not stop extraction; the first one is reported
    /// after every block has been written. Any other error is immediate.
    pub fn extract_to<W: Write>(&mut self, out: &mut W) -> Result<u64, UbiError> {
        self.rewind();

        let mut total = 0u64;
        let mut deferred: Option<UbiError> = None;
        let mut data = Vec::with_capacity(self.leb_size as usize);

        loop {
            data.clear();
            match self.next_block(&mut data) {
                Ok(None) => break,
                Ok(Some(_)) => {}
                Err(mismatch @ UbiError::VolumeChecksumMismatch { .. }) => {
                    deferred.get_or_insert(mismatch);
                }
                Err(fatal) => return Err(fatal),
            }
            out.write_all(&data)?;
            total += data.len() as u64;
        }

        match deferred {
            Some(mismatch) => Err(mismatch),
            None => Ok(total),
        }
    }
}
