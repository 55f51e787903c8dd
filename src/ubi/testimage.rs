//! Fabricates synthetic UBI sources for the test suite, through the same
//! encode path the header module exposes.

use std::io::Cursor;

use super::geometry::Geometry;
use super::headers::*;

pub(crate) const TEST_PEB_SIZE: u32 = 2048;
const TEST_VID_OFFSET: u32 = 64;
const TEST_DATA_OFFSET: u32 = 128;
const TEST_IMAGE_SEQ: u32 = 0x1BADB002;

pub(crate) struct SourceBuilder {
    peb_size: u32,
    image_seq: u32,
    bytes: Vec<u8>,
}

impl SourceBuilder {
    pub fn new(peb_size: u32) -> Self {
        Self {
            peb_size,
            image_seq: TEST_IMAGE_SEQ,
            bytes: Vec::new(),
        }
    }

    pub fn image_seq(&mut self, image_seq: u32) -> &mut Self {
        self.image_seq = image_seq;
        self
    }

    pub fn vid_hdr_offset(&self) -> u32 {
        TEST_VID_OFFSET
    }

    pub fn data_offset(&self) -> u32 {
        TEST_DATA_OFFSET
    }

    pub fn leb_size(&self) -> u32 {
        self.peb_size - TEST_DATA_OFFSET
    }

    pub fn geometry(&self, peb_count: u32) -> Geometry {
        Geometry {
            peb_size: self.peb_size,
            leb_size: self.leb_size(),
            min_io_size: TEST_VID_OFFSET,
            first_peb: 0,
            start_offset: 0,
            peb_count,
        }
    }

    fn ec(&self) -> Ec {
        Ec {
            ec: 1,
            vid_hdr_offset: TEST_VID_OFFSET,
            data_offset: TEST_DATA_OFFSET,
            image_seq: self.image_seq,
            version: 1,
            hdr_valid: true,
        }
    }

    /// Append one PEB with the given VID header and payload.
    pub fn push_peb(&mut self, vid: Vid, payload: &[u8]) {
        assert!(payload.len() <= self.leb_size() as usize);
        let ec = self.ec();

        let base = self.bytes.len();
        self.bytes.resize(base + self.peb_size as usize, 0xFF);
        let block = &mut self.bytes[base..];

        ec.encode(block).unwrap();
        vid.encode(&mut block[TEST_VID_OFFSET as usize..]).unwrap();
        block[TEST_DATA_OFFSET as usize..][..payload.len()].copy_from_slice(payload);
    }

    pub fn push_data(&mut self, vol_id: u32, lnum: u32, sqnum: u64, payload: &[u8]) {
        let vid = Vid {
            vol_type: VolType::Dynamic,
            vol_id,
            lnum,
            sqnum,
            hdr_valid: true,
            ..Default::default()
        };
        self.push_peb(vid, payload);
    }

    pub fn push_static(&mut self, vol_id: u32, lnum: u32, sqnum: u64, used_ebs: u32, payload: &[u8]) {
        let vid = Vid {
            vol_type: VolType::Static,
            vol_id,
            lnum,
            sqnum,
            used_ebs,
            data_size: payload.len() as u32,
            data_crc: UBI_CRC.checksum(payload),
            hdr_valid: true,
            ..Default::default()
        };
        self.push_peb(vid, payload);
    }

    pub fn push_internal(&mut self, vol_id: u32, lnum: u32, sqnum: u64) {
        let vid = Vid {
            vol_type: VolType::Dynamic,
            compat: UBI_LAYOUT_VOL_COMPAT,
            vol_id,
            lnum,
            sqnum,
            hdr_valid: true,
            ..Default::default()
        };
        self.push_peb(vid, &[]);
    }

    /// Append one copy of the layout volume carrying the given table entries,
    /// keyed by volume ID (slot index). Unnamed slots are written empty.
    pub fn push_layout(&mut self, sqnum: u64, entries: &[(u32, VolTableRecord)], lnum: u32) {
        let slots = (self.leb_size() as usize / UBI_VTBL_RECORD_SIZE).min(UBI_MAX_VOLUMES);
        let mut table = Vec::with_capacity(slots * UBI_VTBL_RECORD_SIZE);
        for slot in 0..slots {
            match entries.iter().find(|(vol_id, _)| *vol_id == slot as u32) {
                Some((_, record)) => table.extend(record.clone().into_bytes()),
                None => table.extend(VolTableRecord::none_into_bytes()),
            }
        }

        let vid = Vid {
            vol_type: VolType::Dynamic,
            compat: UBI_LAYOUT_VOL_COMPAT,
            vol_id: UBI_LAYOUT_VOL_ID,
            lnum,
            sqnum,
            hdr_valid: true,
            ..Default::default()
        };
        self.push_peb(vid, &table);
    }

    /// Flip the low bit of one byte of the assembled source.
    pub fn corrupt_byte(&mut self, offset: usize) {
        self.bytes[offset] ^= 0x01;
    }

    pub fn build(self) -> Cursor<Vec<u8>> {
        Cursor::new(self.bytes)
    }
}
