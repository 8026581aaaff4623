use std::fs::File;
use std::path::Path;

use tracing::{debug, error, warn};

use crate::footer::{self, Detection, FOOTER_SIZE, VhdFooter};

/// Smallest image worth looking for a footer in: one sector of payload plus the footer.
pub const MIN_VHD_IMAGE_SIZE: u64 = 512 + FOOTER_SIZE;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompressionType {
    #[default]
    None,
    Xz,
    Gzip,
    Lzma,
    Bzip2,
    Lzw,
}

impl CompressionType {
    const EXTENSIONS: [(&'static str, CompressionType); 5] = [
        (".xz", CompressionType::Xz),
        (".gz", CompressionType::Gzip),
        (".lzma", CompressionType::Lzma),
        (".bz2", CompressionType::Bzip2),
        (".Z", CompressionType::Lzw),
    ];

    pub fn extension(self) -> Option<&'static str> {
        Self::EXTENSIONS
            .iter()
            .find(|(_, ty)| *ty == self)
            .map(|(ext, _)| *ext)
    }

    pub fn is_compressed(self) -> bool {
        self.extension().is_some()
    }
}

/// Guesses the compression of an image from the text after the last `.` of its path.
///
/// Matching is exact and case sensitive. A dot in the first position does not count,
/// so `.hidden` has no extension.
pub fn sniff_compression(path: &str) -> CompressionType {
    let Some(dot) = path.rfind('.').filter(|&dot| dot > 0) else {
        return CompressionType::None;
    };
    let suffix = &path[dot..];
    CompressionType::EXTENSIONS
        .iter()
        .find(|(ext, _)| *ext == suffix)
        .map(|(_, ty)| *ty)
        .unwrap_or_default()
}

/// Compressed images are taken to be bootable until they have been decompressed.
pub fn is_compressed_bootable_image(path: &str) -> bool {
    sniff_compression(path).is_compressed()
}

/// Decides whether the boot record of an uncompressed image makes it bootable.
pub trait MbrAnalyzer {
    fn is_bootable(&self, image: &mut File) -> bool;
}

impl<F: Fn(&mut File) -> bool> MbrAnalyzer for F {
    fn is_bootable(&self, image: &mut File) -> bool {
        self(image)
    }
}

/// Treats an image as bootable when its MBR or GPT lists at least one partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionTableAnalyzer;

impl MbrAnalyzer for PartitionTableAnalyzer {
    fn is_bootable(&self, image: &mut File) -> bool {
        match bootsector::list_partitions(&mut *image, &bootsector::Options::default()) {
            Ok(partitions) => {
                debug!("Image has {} partition(s)", partitions.len());
                !partitions.is_empty()
            }
            Err(e) => {
                debug!("Image has no usable partition table: {e:?}");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageReport {
    pub compression_type: CompressionType,
    pub is_bootable_img: bool,
    pub is_vhd: bool,
    /// Bytes of disk data in the image, excluding any VHD footer
    pub projected_size: u64,
}

/// Works out whether `path` is a bootable disk image.
///
/// This never fails. Problems are logged and leave the image marked as not bootable.
pub fn classify_image(path: &Path, analyzer: &dyn MbrAnalyzer) -> ImageReport {
    let mut report = ImageReport::default();

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            error!("Could not open image '{}': {e}", path.display());
            return report;
        }
    };

    report.compression_type = sniff_compression(&path.to_string_lossy());
    report.is_bootable_img = if report.compression_type.is_compressed() {
        true
    } else {
        analyzer.is_bootable(&mut file)
    };

    let size = match file.metadata() {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            error!("Could not get image size: {e}");
            report.is_bootable_img = false;
            return report;
        }
    };
    report.projected_size = size;

    if report.compression_type.is_compressed() || size < MIN_VHD_IMAGE_SIZE {
        return report;
    }

    match footer::detect(&file, size) {
        Ok(Detection::NotVhd) => {}
        Ok(Detection::Unsupported {
            file_format_version,
            disk_type,
            payload_size,
        }) => {
            warn!(
                "Unsupported type of VHD image (version {file_format_version:#010X}, {} disk)",
                VhdFooter::disk_type_name(disk_type)
            );
            report.projected_size = payload_size;
            report.is_bootable_img = false;
        }
        Ok(Detection::Fixed(vhd)) => {
            report.projected_size = vhd.payload_size;
            report.is_vhd = true;
        }
        Err(e) => error!("{e:#}"),
    }

    report
}
