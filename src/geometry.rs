//! CHS geometry reported in the footer of a fixed VHD.
//!
//! The derivation is the one from the appendix of the VHD format specification.
//! Hypervisors recompute it and compare, so it has to be reproduced exactly.

use bytemuck::{Pod, Zeroable};

use crate::endian::BeU16;

pub const SECTOR_SIZE: u64 = 512;

/// Largest addressable disk: 65535 cylinders, 16 heads, 255 sectors per track.
pub const MAX_TOTAL_SECTORS: u64 = 65535 * 16 * 255;

/// At or above this many sectors the 255 sectors per track layout is used.
pub const LARGE_DISK_SECTORS: u64 = 65535 * 16 * 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chs {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

/// A candidate track layout: sectors per track, heads and the resulting cylinders * heads.
#[derive(Debug, Clone, Copy)]
struct TrackLayout {
    sectors_per_track: u32,
    heads: u32,
    cylinder_times_heads: u32,
}

impl TrackLayout {
    fn with_heads(total_sectors: u32, sectors_per_track: u32, heads: u32) -> Self {
        Self {
            sectors_per_track,
            heads,
            cylinder_times_heads: total_sectors / sectors_per_track,
        }
    }

    /// 17 sectors per track, with just enough heads (at least 4) for 1024 cylinders.
    fn compact(total_sectors: u32) -> Self {
        let cylinder_times_heads = total_sectors / 17;
        let heads = cylinder_times_heads.div_ceil(1024).max(4);
        Self {
            sectors_per_track: 17,
            heads,
            cylinder_times_heads,
        }
    }

    fn medium(total_sectors: u32) -> Self {
        Self::with_heads(total_sectors, 31, 16)
    }

    fn large(total_sectors: u32) -> Self {
        Self::with_heads(total_sectors, 63, 16)
    }

    fn max(total_sectors: u32) -> Self {
        Self::with_heads(total_sectors, 255, 16)
    }

    fn fits(&self) -> bool {
        self.heads <= 16 && self.cylinder_times_heads < self.heads * 1024
    }

    fn into_chs(self) -> Chs {
        // Every layout keeps cylinders within 16 bits once the sector count is clamped.
        Chs {
            cylinders: (self.cylinder_times_heads / self.heads) as u16,
            heads: self.heads as u8,
            sectors_per_track: self.sectors_per_track as u8,
        }
    }
}

impl Chs {
    /// Geometry for a disk of `size_bytes` bytes.
    pub fn for_size(size_bytes: u64) -> Self {
        Self::for_sectors(size_bytes / SECTOR_SIZE)
    }

    pub fn for_sectors(total_sectors: u64) -> Self {
        let total_sectors = total_sectors.min(MAX_TOTAL_SECTORS) as u32;

        if total_sectors as u64 >= LARGE_DISK_SECTORS {
            return TrackLayout::max(total_sectors).into_chs();
        }

        let candidates = [TrackLayout::compact, TrackLayout::medium];
        candidates
            .into_iter()
            .map(|layout| layout(total_sectors))
            .find(TrackLayout::fits)
            .unwrap_or_else(|| TrackLayout::large(total_sectors))
            .into_chs()
    }

    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors_per_track as u64
    }
}

/// On-disk packing of [`Chs`]: a big-endian 16-bit cylinder count followed by heads and sectors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DiskGeometry {
    pub cylinders: BeU16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl From<Chs> for DiskGeometry {
    fn from(chs: Chs) -> Self {
        Self {
            cylinders: BeU16::new(chs.cylinders),
            heads: chs.heads,
            sectors_per_track: chs.sectors_per_track,
        }
    }
}

impl From<DiskGeometry> for Chs {
    fn from(geometry: DiskGeometry) -> Self {
        Self {
            cylinders: geometry.cylinders.get(),
            heads: geometry.heads,
            sectors_per_track: geometry.sectors_per_track,
        }
    }
}
