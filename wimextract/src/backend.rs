use std::path::Path;

use crate::{ExtractError, Result};

/// Extract the file `src` of image number `index` in the WIM `image` to `dst`.
#[derive(Debug, Clone, Copy)]
pub struct ExtractRequest<'a> {
    pub image: &'a Path,
    /// 1-based image index inside the WIM
    pub index: u32,
    /// Path of the file inside the image, `\` separated
    pub src: &'a str,
    pub dst: &'a Path,
}

impl<'a> ExtractRequest<'a> {
    pub fn validate(&self) -> Result<()> {
        if self.image.as_os_str().is_empty() {
            return Err(ExtractError::InvalidRequest("no image given"));
        }
        if self.src.is_empty() {
            return Err(ExtractError::InvalidRequest("no source file given"));
        }
        if self.dst.as_os_str().is_empty() {
            return Err(ExtractError::InvalidRequest("no destination given"));
        }
        Ok(())
    }

    /// Directory part of `dst`, or the current directory when it has none.
    pub fn destination_dir(&self) -> &'a Path {
        match self.dst.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    /// Last component of `src`.
    pub fn source_name(&self) -> &'a str {
        self.src.rsplit(['\\', '/']).next().unwrap_or(self.src)
    }
}

/// One way of pulling a file out of a WIM image.
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Whether this backend can run on this host at all.
    fn probe(&self) -> bool;

    fn extract(&self, request: &ExtractRequest<'_>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(image: &'a str, src: &'a str, dst: &'a str) -> ExtractRequest<'a> {
        ExtractRequest {
            image: Path::new(image),
            index: 1,
            src,
            dst: Path::new(dst),
        }
    }

    #[test]
    fn rejects_missing_arguments() {
        assert!(request("boot.wim", "a", "b").validate().is_ok());
        for bad in [request("", "a", "b"), request("w", "", "b"), request("w", "a", "")] {
            assert!(matches!(
                bad.validate(),
                Err(ExtractError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn destination_dir_strips_file_name() {
        assert_eq!(
            request("w", "a", "out/efi/boot/bootx64.efi").destination_dir(),
            Path::new("out/efi/boot")
        );
        assert_eq!(request("w", "a", "bootx64.efi").destination_dir(), Path::new("."));
    }

    #[test]
    fn source_name_is_last_component() {
        let req = request("w", r"Windows\Boot\EFI\bootmgfw.efi", "x");
        assert_eq!(req.source_name(), "bootmgfw.efi");
        assert_eq!(request("w", "plain", "x").source_name(), "plain");
    }
}
