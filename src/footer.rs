//! The 512-byte footer that turns a raw disk image into a fixed VHD.
//!
//! Layout (all integers big-endian):
//!
//! | Offset | Size | Field               |
//! |--------|------|---------------------|
//! | 0      | 8    | Cookie `conectix`   |
//! | 8      | 4    | Features            |
//! | 12     | 4    | File format version |
//! | 16     | 8    | Data offset         |
//! | 24     | 4    | Timestamp           |
//! | 28     | 4    | Creator application |
//! | 32     | 4    | Creator version     |
//! | 36     | 4    | Creator host OS     |
//! | 40     | 8    | Original size       |
//! | 48     | 8    | Current size        |
//! | 56     | 4    | Disk geometry (CHS) |
//! | 60     | 4    | Disk type           |
//! | 64     | 4    | Checksum            |
//! | 68     | 16   | Unique id           |
//! | 84     | 1    | Saved state         |
//! | 85     | 427  | Reserved            |

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytemuck::{Pod, Zeroable};
use positioned_io2::ReadAt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endian::{BeU32, BeU64};
use crate::geometry::{Chs, DiskGeometry};
use crate::util::ReadAtExt;

pub const FOOTER_SIZE: u64 = 512;

const CHECKSUM_RANGE: std::ops::Range<usize> = 64..68;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct VhdFooter {
    pub cookie: [u8; 8],
    pub features: BeU32,
    pub file_format_version: BeU32,
    pub data_offset: BeU64,
    /// Seconds since 2000-01-01 00:00:00 UTC
    pub timestamp: BeU32,
    pub creator_app: [u8; 4],
    pub creator_version: BeU32,
    pub creator_host_os: [u8; 4],
    pub original_size: BeU64,
    pub current_size: BeU64,
    pub disk_geometry: DiskGeometry,
    pub disk_type: BeU32,
    pub checksum: BeU32,
    pub unique_id: Uuid,
    pub saved_state: u8,
    pub reserved: [u8; 427],
}

const _: () = assert!(std::mem::size_of::<VhdFooter>() == FOOTER_SIZE as usize);

impl VhdFooter {
    pub const COOKIE: [u8; 8] = *b"conectix";

    pub const FEATURES_RESERVED: u32 = 0x0000_0002;

    pub const VERSION_1_0: u32 = 0x0001_0000;

    /// Data offset of a fixed disk, which has no dynamic disk header.
    pub const DATA_OFFSET_NONE: u64 = u64::MAX;

    pub const TYPE_FIXED: u32 = 2;
    pub const TYPE_DYNAMIC: u32 = 3;
    pub const TYPE_DIFFERENCING: u32 = 4;

    pub const HOST_OS_WINDOWS: [u8; 4] = *b"Wi2k";

    /// 2000-01-01 00:00:00 UTC as a unix timestamp
    pub const EPOCH_UNIX: u64 = 946_684_800;

    /// Builds the footer of a fixed disk holding `size` bytes of payload.
    ///
    /// A missing `unique_id` is tolerated and leaves the field zeroed.
    pub fn fixed(
        size: u64,
        timestamp: u32,
        unique_id: Option<Uuid>,
        options: &FooterOptions,
    ) -> Self {
        let unique_id = unique_id.unwrap_or_else(|| {
            warn!("Could not set VHD unique id");
            Uuid::nil()
        });

        let mut footer = Self {
            cookie: Self::COOKIE,
            features: BeU32::new(Self::FEATURES_RESERVED),
            file_format_version: BeU32::new(Self::VERSION_1_0),
            data_offset: BeU64::new(Self::DATA_OFFSET_NONE),
            timestamp: BeU32::new(timestamp),
            creator_app: options.creator_app,
            creator_version: BeU32::new(options.creator_version),
            creator_host_os: options.creator_host_os,
            original_size: BeU64::new(size),
            current_size: BeU64::new(size),
            disk_geometry: Chs::for_size(size).into(),
            disk_type: BeU32::new(Self::TYPE_FIXED),
            checksum: BeU32::default(),
            unique_id,
            saved_state: 0,
            reserved: [0; 427],
        };
        footer.checksum = BeU32::new(checksum(footer.as_bytes()));
        footer
    }

    pub fn disk_type_name(disk_type: u32) -> &'static str {
        match disk_type {
            Self::TYPE_FIXED => "fixed",
            Self::TYPE_DYNAMIC => "dynamic",
            Self::TYPE_DIFFERENCING => "differencing",
            _ => "unknown",
        }
    }

    pub fn from_bytes(bytes: &[u8; 512]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 512] {
        bytemuck::cast_ref(self)
    }

    pub fn has_cookie(&self) -> bool {
        self.cookie == Self::COOKIE
    }

    pub fn is_supported(&self) -> bool {
        self.file_format_version.get() == Self::VERSION_1_0 && self.disk_type.get() == Self::TYPE_FIXED
    }

    pub fn geometry(&self) -> Chs {
        self.disk_geometry.into()
    }

    /// Checksum the stored record should carry.
    pub fn expected_checksum(&self) -> u32 {
        checksum(self.as_bytes())
    }

    pub fn verify_checksum(&self) -> Result<(), ChecksumMismatch> {
        let stored = self.checksum.get();
        let computed = self.expected_checksum();
        if stored == computed {
            Ok(())
        } else {
            Err(ChecksumMismatch { stored, computed })
        }
    }
}

/// One's complement of the byte sum of a footer, with the checksum field counted as zero.
pub fn checksum(footer: &[u8; 512]) -> u32 {
    let sum = footer
        .iter()
        .enumerate()
        .filter(|(offset, _)| !CHECKSUM_RANGE.contains(offset))
        .fold(0u32, |sum, (_, &byte)| sum.wrapping_add(byte as u32));
    !sum
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub stored: u32,
    pub computed: u32,
}

impl std::fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checksum: {:08X}, expected: {:08X}",
            self.stored, self.computed
        )
    }
}

/// Creator tags written into new footers. They are informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FooterOptions {
    pub creator_app: [u8; 4],
    /// `(major << 16) | minor` of the creating application
    pub creator_version: u32,
    pub creator_host_os: [u8; 4],
}

impl Default for FooterOptions {
    fn default() -> Self {
        let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
        let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
        Self {
            creator_app: *b"vhdr",
            creator_version: (major << 16) | (minor & 0xFFFF),
            creator_host_os: VhdFooter::HOST_OS_WINDOWS,
        }
    }
}

/// Current time in footer timestamp units, truncated to 32 bits.
pub fn timestamp_now() -> u32 {
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now_unix.wrapping_sub(VhdFooter::EPOCH_UNIX) as u32
}

/// Appends a fixed VHD footer at the end of `writer`, describing everything before it.
pub fn write_footer<W: Write + Seek>(
    writer: &mut W,
    options: &FooterOptions,
) -> anyhow::Result<VhdFooter> {
    let size = writer
        .seek(SeekFrom::End(0))
        .context("Could not seek to the end of the image")?;

    let footer = VhdFooter::fixed(size, timestamp_now(), Some(Uuid::new_v4()), options);
    writer
        .write_all(footer.as_bytes())
        .context("Could not write VHD footer")?;
    writer.flush().context("Could not write VHD footer")?;

    debug!(
        size,
        geometry = ?footer.geometry(),
        checksum = format_args!("{:08X}", footer.checksum.get()),
        "Appended VHD footer"
    );
    Ok(footer)
}

/// Opens an existing image for writing and appends a fixed VHD footer to it.
pub fn append_footer(path: &Path, options: &FooterOptions) -> anyhow::Result<VhdFooter> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Could not open image '{}'", path.display()))?;
    write_footer(&mut file, options)
}

/// What the last 512 bytes of an image say about it.
#[derive(Debug, Clone)]
pub enum Detection {
    /// No footer cookie; the image is raw or some other format.
    NotVhd,
    /// A VHD footer that is not a version 1.0 fixed disk.
    Unsupported {
        file_format_version: u32,
        disk_type: u32,
        /// File size minus the footer
        payload_size: u64,
    },
    Fixed(FixedVhd),
}

#[derive(Debug, Clone)]
pub struct FixedVhd {
    pub footer: VhdFooter,
    /// File size minus the footer
    pub payload_size: u64,
    /// Set when the stored checksum disagrees. The image is still usable.
    pub checksum_mismatch: Option<ChecksumMismatch>,
}

impl Detection {
    pub fn is_vhd(&self) -> bool {
        matches!(self, Detection::Fixed(_))
    }

    pub fn payload_size(&self) -> Option<u64> {
        match self {
            Detection::NotVhd => None,
            Detection::Unsupported { payload_size, .. } => Some(*payload_size),
            Detection::Fixed(vhd) => Some(vhd.payload_size),
        }
    }
}

/// Reads the footer from the tail of a `file_size` byte image and validates it.
pub fn detect<R: ReadAt + ?Sized>(reader: &R, file_size: u64) -> anyhow::Result<Detection> {
    anyhow::ensure!(
        file_size >= FOOTER_SIZE,
        "Image is too small to hold a VHD footer ({file_size} bytes)"
    );

    let footer: VhdFooter = reader
        .read_pod_at(file_size - FOOTER_SIZE)
        .context("Could not read VHD footer")?;

    if !footer.has_cookie() {
        return Ok(Detection::NotVhd);
    }

    let payload_size = file_size - FOOTER_SIZE;
    if !footer.is_supported() {
        return Ok(Detection::Unsupported {
            file_format_version: footer.file_format_version.get(),
            disk_type: footer.disk_type.get(),
            payload_size,
        });
    }

    let checksum_mismatch = footer.verify_checksum().err();
    if let Some(mismatch) = checksum_mismatch {
        warn!("VHD footer seems corrupted ({mismatch})");
    }

    info!("Image is a Fixed Hard Disk VHD file");
    Ok(Detection::Fixed(FixedVhd {
        footer,
        payload_size,
        checksum_mismatch,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// An image of `payload` zero bytes followed by a footer, without allocating the payload.
    struct SparseImage {
        payload: u64,
        footer: [u8; 512],
    }

    impl ReadAt for SparseImage {
        fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            let end = self.payload + FOOTER_SIZE;
            if pos >= end {
                return Ok(0);
            }
            let len = buf.len().min((end - pos) as usize);
            for (i, byte) in buf[..len].iter_mut().enumerate() {
                let at = pos + i as u64;
                *byte = if at < self.payload {
                    0
                } else {
                    self.footer[(at - self.payload) as usize]
                };
            }
            Ok(len)
        }
    }

    fn sample(size: u64) -> VhdFooter {
        VhdFooter::fixed(size, 0x1234_5678, Some(Uuid::from_u128(7)), &FooterOptions::default())
    }

    #[test]
    fn fixed_footer_fields() {
        let footer = sample(1_000_000);
        let bytes = footer.as_bytes();

        assert_eq!(&bytes[0..8], b"conectix");
        assert_eq!(&bytes[8..12], &[0, 0, 0, 2]);
        assert_eq!(&bytes[12..16], &[0, 1, 0, 0]);
        assert_eq!(&bytes[16..24], &[0xFF; 8]);
        assert_eq!(&bytes[24..28], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&bytes[28..32], b"vhdr");
        assert_eq!(&bytes[36..40], b"Wi2k");
        assert_eq!(u64::from_be_bytes(bytes[40..48].try_into().unwrap()), 1_000_000);
        assert_eq!(u64::from_be_bytes(bytes[48..56].try_into().unwrap()), 1_000_000);
        assert_eq!(&bytes[60..64], &[0, 0, 0, 2]);
        assert_eq!(&bytes[68..84], &7u128.to_be_bytes());
        assert!(bytes[84..].iter().all(|&b| b == 0));

        let geometry = footer.geometry();
        assert_eq!(
            u16::from_be_bytes([bytes[56], bytes[57]]),
            geometry.cylinders
        );
        assert_eq!(bytes[58], geometry.heads);
        assert_eq!(bytes[59], geometry.sectors_per_track);
    }

    #[test]
    fn checksum_is_complement_of_byte_sum() {
        let footer = sample(4096);
        let bytes = footer.as_bytes();
        let sum: u32 = bytes
            .iter()
            .enumerate()
            .filter(|(i, _)| !(64..68).contains(i))
            .map(|(_, &b)| b as u32)
            .sum();
        assert_eq!(footer.checksum.get(), !sum);
        assert!(footer.verify_checksum().is_ok());
    }

    #[test]
    fn checksum_is_deterministic() {
        let options = FooterOptions::default();
        let a = VhdFooter::fixed(1 << 30, 42, None, &options);
        let b = VhdFooter::fixed(1 << 30, 42, None, &options);
        assert_eq!(a.checksum, b.checksum);

        // Timestamp and id vary between runs; with them zeroed the sums agree.
        let mut c = VhdFooter::fixed(1 << 30, timestamp_now(), Some(Uuid::new_v4()), &options);
        c.timestamp = BeU32::new(42);
        c.unique_id = Uuid::nil();
        assert_eq!(c.expected_checksum(), a.checksum.get());
    }

    #[test]
    fn missing_unique_id_leaves_field_zeroed() {
        let footer = VhdFooter::fixed(512, 0, None, &FooterOptions::default());
        assert!(footer.unique_id.is_nil());
        assert!(footer.verify_checksum().is_ok());
    }

    #[test]
    fn round_trip_through_detect() {
        for payload in [0u64, 511, 512, 1_000_000, 1 << 40] {
            let image = SparseImage {
                payload,
                footer: *sample(payload).as_bytes(),
            };
            let detection = detect(&image, payload + FOOTER_SIZE).unwrap();
            assert!(detection.is_vhd(), "payload {payload}");
            assert_eq!(detection.payload_size(), Some(payload));
            let Detection::Fixed(vhd) = detection else {
                unreachable!()
            };
            assert!(vhd.checksum_mismatch.is_none());
            assert_eq!(vhd.footer.current_size.get(), payload);
        }
    }

    #[test]
    fn write_footer_appends_to_end() {
        let mut image = Cursor::new(vec![0xABu8; 4096]);
        image.set_position(17);
        let footer = write_footer(&mut image, &FooterOptions::default()).unwrap();

        let data = image.into_inner();
        assert_eq!(data.len(), 4096 + 512);
        assert_eq!(&data[4096..], footer.as_bytes());
        assert_eq!(footer.original_size.get(), 4096);
        assert!(!footer.unique_id.is_nil());
    }

    #[test]
    fn corrupted_byte_is_only_a_warning() {
        for offset in [24usize, 40, 57, 68, 100, 511] {
            let mut bytes = *sample(65536).as_bytes();
            bytes[offset] ^= 0x5A;
            let mut data = vec![0u8; 65536];
            data.extend_from_slice(&bytes);

            let detection = detect(&data, data.len() as u64).unwrap();
            let Detection::Fixed(vhd) = detection else {
                panic!("offset {offset} should still be a fixed VHD");
            };
            assert!(vhd.checksum_mismatch.is_some(), "offset {offset}");
            assert_eq!(vhd.payload_size, 65536);
        }
    }

    #[test]
    fn wrong_cookie_is_not_a_vhd() {
        let mut data = vec![0u8; 2048];
        let mut bytes = *sample(2048).as_bytes();
        bytes[0] = b'C';
        data.extend_from_slice(&bytes);
        assert!(matches!(
            detect(&data, data.len() as u64).unwrap(),
            Detection::NotVhd
        ));
    }

    #[test]
    fn dynamic_disk_is_unsupported() {
        let mut footer = sample(2048);
        footer.disk_type = BeU32::new(VhdFooter::TYPE_DYNAMIC);
        footer.disk_geometry = DiskGeometry::default();
        let mut data = vec![0u8; 2048];
        data.extend_from_slice(footer.as_bytes());

        match detect(&data, data.len() as u64).unwrap() {
            Detection::Unsupported {
                disk_type,
                payload_size,
                ..
            } => {
                assert_eq!(disk_type, VhdFooter::TYPE_DYNAMIC);
                assert_eq!(payload_size, 2048);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disk_type_names() {
        assert_eq!(VhdFooter::disk_type_name(VhdFooter::TYPE_FIXED), "fixed");
        assert_eq!(VhdFooter::disk_type_name(VhdFooter::TYPE_DYNAMIC), "dynamic");
        assert_eq!(VhdFooter::disk_type_name(VhdFooter::TYPE_DIFFERENCING), "differencing");
        assert_eq!(VhdFooter::disk_type_name(7), "unknown");
    }

    #[test]
    fn too_small_is_an_error() {
        let data = vec![0u8; 100];
        assert!(detect(&data, 100).is_err());
    }
}
