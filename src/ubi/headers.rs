//! EC/VID header and volume-table record codecs, with CRC verification and
//! computation.
//!
//! The raw on-flash layouts come from the `income` crate's deku structs; this
//! module wraps them in plain value types that carry only the fields the
//! reconstruction pipeline cares about. Parsing is deliberately lenient: a
//! header whose CRC does not check out is still decoded, with `hdr_valid`
//! cleared, so that the classifier can downgrade the block instead of the
//! whole scan failing.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// On-flash size of the erase-counter header.
pub const UBI_EC_HDR_SIZE: usize = 64;
/// On-flash size of the volume-id header.
pub const UBI_VID_HDR_SIZE: usize = 64;

/// Volume ID of the layout volume, which doubles as the start of the reserved
/// internal volume ID range.
pub const UBI_LAYOUT_VOL_ID: u32 = 0x7FFF_EFFF;
pub const UBI_INTERNAL_VOL_START: u32 = UBI_LAYOUT_VOL_ID;
/// Compatibility flags carried by layout-volume VID headers.
pub const UBI_LAYOUT_VOL_COMPAT: u8 = 5u8;

/// On-flash size of one volume-table record.
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;
/// The volume table never holds more than this many record slots.
pub const UBI_MAX_VOLUMES: usize = 128;

/// A trait missing from the `income` crate: implements parsing UBI headers
/// from byteslices, with magic and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    /// Parse a header. `None` means the bytes are not this header at all
    /// (wrong magic or version); otherwise the bool reports whether the
    /// header's CRC checked out.
    fn parse(buf: &'a [u8]) -> Option<(Self, bool)> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if (header.get_hdr_magic(), header.get_hdr_version()) != (Self::get_magic(), UBI_VERSION) {
            return None;
        }

        let crc_ok = header.check_crc();
        Some((header, crc_ok))
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// Another trait missing from `income` to compute the correct CRC for some Vid/Ec header
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let header_bytes = self.to_bytes().unwrap();
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// The fields of an erase-counter header that the pipeline cares about.
///
/// This is meant to be more ergonomic to work with than EcHdr, which
/// represents the raw data.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
    pub version: u8,

    /// Whether the header CRC checked out when this was decoded. A block with
    /// `hdr_valid == false` is classified unknown and never read again.
    pub hdr_valid: bool,
}

impl Ec {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (hdr, crc_ok) = EcHdr::parse(bytes)?;
        let mut ec = Self::from(hdr);
        ec.hdr_valid = crc_ok;
        Some(ec)
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = EcHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            version,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            version,
            hdr_valid: true,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            version: _,
            hdr_valid: _,
        } = value;

        let mut target = Self {
            magic: UBI_EC_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// The fields of a volume-id header that the pipeline cares about.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,

    /// Whether the header CRC checked out when this was decoded.
    pub hdr_valid: bool,
}

impl Vid {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (hdr, crc_ok) = VidHdr::parse(bytes)?;
        let mut vid: Self = hdr.try_into().ok()?;
        vid.hdr_valid = crc_ok;
        Some(vid)
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = VidHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            hdr_valid: true,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            hdr_valid: _,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        let mut target = Self {
            magic: UBI_VID_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// One decoded entry of the volume table held by the layout volume.
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible to detect
    /// that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume. Any UTF-8 string decodes, though other UBI
    /// implementors usually assume ASCII.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Convert from a byte slice. `None` means the record's CRC (or encoding)
    /// is invalid; empty-but-valid slots decode to a default record.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, vtblrec) = VtblRecord::from_bytes((bytes, 0)).ok()?;
        if !vtblrec.check_crc() {
            return None;
        }
        vtblrec.try_into().ok()
    }

    /// Whether this is an unused slot of the table.
    pub fn is_empty(&self) -> bool {
        self.reserved_pebs == 0 && self.name.is_empty()
    }

    /// Write into a Vec<u8>
    pub fn into_bytes(self) -> Vec<u8> {
        VtblRecord::from(self).to_bytes().unwrap()
    }

    /// Represent an empty entry in the volume table
    pub fn none_into_bytes() -> Vec<u8> {
        let mut record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        record.fix_crc();
        record.to_bytes().unwrap()
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = ();

    fn try_from(value: VtblRecord) -> Result<Self, Self::Error> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        // Empty slots encode vol_type 0, which is not a valid VolType
        let vol_type = vol_type.try_into().unwrap_or_default();
        let upd_marker = upd_marker != 0;
        let name = std::str::from_utf8(name.get(..name_len as usize).ok_or(())?)
            .map_err(|_| ())?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let upd_marker = upd_marker.into();
        let name_len = name.len() as _;

        let name_bytes = name.as_bytes();
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut target = Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[test]
fn test_roundtrip() -> anyhow::Result<()> {
    let ec = Ec {
        ec: 3,
        vid_hdr_offset: 64,
        data_offset: 128,
        image_seq: 0x1234,
        version: UBI_VERSION,
        hdr_valid: true,
    };
    let vid = Vid {
        vol_id: 2,
        lnum: 9,
        sqnum: 77,
        hdr_valid: true,
        ..Default::default()
    };
    let vtbl = VolTableRecord {
        reserved_pebs: 6,
        alignment: 1024,
        name: "example".to_string(),
        ..Default::default()
    };

    let mut buf = vec![0u8; 1024];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf), Some(ec));

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Some(vid));

    let vec = vtbl.clone().into_bytes();
    assert_eq!(VolTableRecord::decode(&vec), Some(vtbl));

    Ok(())
}

#[test]
fn test_bad_crc_keeps_fields() -> anyhow::Result<()> {
    let ec = Ec {
        ec: 12,
        vid_hdr_offset: 64,
        data_offset: 128,
        image_seq: 5,
        version: UBI_VERSION,
        hdr_valid: true,
    };

    let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
    ec.encode(&mut buf)?;
    buf[8] ^= 0x01; // flip a bit inside the erase counter

    let decoded = Ec::decode(&buf).expect("magic and version still intact");
    assert!(!decoded.hdr_valid);
    assert_eq!(decoded.image_seq, 5);

    // Break the magic instead: the bytes no longer parse as a header at all.
    buf[0] ^= 0xFF;
    assert_eq!(Ec::decode(&buf), None);
    Ok(())
}

#[test]
fn test_empty_vtbl_slot() {
    let bytes = VolTableRecord::none_into_bytes();
    let record = VolTableRecord::decode(&bytes).unwrap();
    assert!(record.is_empty());
}
