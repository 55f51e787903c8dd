//! Read-only reconstruction of UBI (Unsorted Block Image) flash contents.
//!
//! Given a raw NAND dump (or an image file laid out the same way), this crate
//! detects the physical-erase-block size, parses and classifies every block,
//! resolves the redundant layout volume into a volume table, and rebuilds each
//! logical volume's byte stream. See the [`ubi`] module for the pipeline.

pub mod ubi;
pub mod util;
