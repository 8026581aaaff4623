//! Fixed VHD footers and bootable disk image detection.
//!
//! A fixed VHD is a raw disk image followed by a 512-byte footer. [`append_footer`]
//! turns a raw image into one, [`detect`] reads the footer back, and
//! [`classify_image`] combines that with compression and partition table checks.

pub mod classify;
pub mod endian;
pub mod footer;
pub mod geometry;
mod util;

pub use classify::{
    CompressionType, ImageReport, MbrAnalyzer, PartitionTableAnalyzer, classify_image,
    is_compressed_bootable_image, sniff_compression,
};
pub use footer::{
    ChecksumMismatch, Detection, FOOTER_SIZE, FixedVhd, FooterOptions, VhdFooter, append_footer,
    detect, write_footer,
};
pub use geometry::Chs;
