//! # rkimage
//!
//! A Rust implementation of the Rockchip boot image tools (boot_merger,
//! loaderimage, rksd, trust_merger) for packing and unpacking the images
//! the Rockchip boot ROM consumes.
//!
//! Four on-disk formats are supported, each behind its own module:
//! - [`idblock`]: the ID-block container with DDR init and the mini-loader
//! - [`loader`]: the redundant second-stage wrapper for uboot.img/trust.img
//! - [`sdmmc`]: the rksd SD/MMC card boot layout
//! - [`trust`]: the BL31/BL32 trust image
//!
//! ## Example
//!
//! ```no_run
//! use rkimage::loader::{self, PackOptions};
//! use std::path::Path;
//!
//! let opts = PackOptions::uboot().load_addr(0x200000);
//! loader::pack(Path::new("u-boot.bin"), Path::new("uboot.img"), &opts)?;
//! # Ok::<(), rkimage::RkImageError>(())
//! ```

pub mod cli;
pub mod config;
pub mod crc;
pub mod elf;
pub mod error;
pub mod idblock;
pub mod loader;
pub mod rc4;
pub mod sdmmc;
pub mod trust;

// Re-export main types for convenience
pub use config::{BinaryEntry, BootConfig, TrustConfig};
pub use crc::calculate_crc32;
pub use error::{Result, RkImageError};
pub use idblock::IdBlockImage;
pub use sdmmc::SdmmcChip;
pub use trust::TrustImage;

use std::io::Write;
use std::path::Path;

/// Current version of the rkimage implementation
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Round `size` up to the next multiple of `align`.
pub fn align_up(size: u64, align: u64) -> u64 {
    size.div_ceil(align) * align
}

/// Write `data` to `path` through a temporary file in the same directory,
/// renaming on success. A failed pack never leaves a half-written image.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| RkImageError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 2048), 0);
        assert_eq!(align_up(1, 2048), 2048);
        assert_eq!(align_up(2048, 2048), 2048);
        assert_eq!(align_up(2049, 2048), 4096);
        assert_eq!(align_up(1000, 512), 1024);
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        write_atomic(&path, b"image data").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"image data");

        // Overwrites an existing file.
        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }
}
