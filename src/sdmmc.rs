//! SD/MMC boot image codec (rksd layout)
//!
//! The boot ROM reads an RC4-encrypted 512-byte header0 from the start of
//! the card, which tells it where the SPL sits and how many blocks to load:
//!
//! ```text
//! 0x000  header0 (512B, RC4 encrypted)
//! 0x200  padding to 2048
//! 0x800  SPL data (4-byte chip magic carried by the binary itself),
//!        padded to init_size blocks, per-block RC4 on chips that need it
//! ```

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};

use crate::align_up;
use crate::error::{Result, RkImageError, check_inputs_exist};
use crate::rc4::{RC4_BLOCK_SIZE, rc4_crypt, rc4_crypt_blocks};
use crate::write_atomic;

/// header0 signature the boot ROM checks first
pub const SIGNATURE: u32 = 0x0FF0_AA55;

/// Storage block size
pub const BLOCK_SIZE: u64 = 512;

/// SPL offset in blocks (block 4 = 2 KiB)
pub const INIT_OFFSET: u16 = 4;

/// Absolute byte offset of the SPL region
pub const SPL_OFFSET: u64 = INIT_OFFSET as u64 * BLOCK_SIZE;

/// init_size / init_boot_size granularity in blocks
pub const INIT_SIZE_ALIGN: u64 = 4;

/// Default room reserved for the next-stage bootloader
pub const DEFAULT_MAX_BOOT_SIZE: u64 = 512 * 1024;

const HEADER0_SIZE: usize = 512;

/// Chip families with an SD/MMC boot profile. The table is part of the
/// on-disk contract: the magic identifies the family and decides whether
/// the SPL region is RC4-encrypted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdmmcChip {
    Rk3036,
    Rk3066,
    Rk3128,
    Rk3188,
    Rk322x,
    Rk3288,
    Rk3308,
    Rk3328,
    Rk3368,
    Rk3399,
    Px30,
    Rv1108,
}

impl SdmmcChip {
    pub const ALL: [SdmmcChip; 12] = [
        Self::Rk3036,
        Self::Rk3066,
        Self::Rk3128,
        Self::Rk3188,
        Self::Rk322x,
        Self::Rk3288,
        Self::Rk3308,
        Self::Rk3328,
        Self::Rk3368,
        Self::Rk3399,
        Self::Px30,
        Self::Rv1108,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Rk3036 => "rk3036",
            Self::Rk3066 => "rk3066",
            Self::Rk3128 => "rk3128",
            Self::Rk3188 => "rk3188",
            Self::Rk322x => "rk322x",
            Self::Rk3288 => "rk3288",
            Self::Rk3308 => "rk3308",
            Self::Rk3328 => "rk3328",
            Self::Rk3368 => "rk3368",
            Self::Rk3399 => "rk3399",
            Self::Px30 => "px30",
            Self::Rv1108 => "rv1108",
        }
    }

    /// 4-byte SPL magic at the start of the SPL binary
    pub fn spl_magic(self) -> [u8; 4] {
        match self {
            Self::Rk3036 | Self::Rk3066 => *b"RK30",
            Self::Rk3128 | Self::Rk3188 => *b"RK31",
            Self::Rk322x | Self::Rk3288 | Self::Rk3328 => *b"RK32",
            Self::Rk3308 | Self::Rk3368 | Self::Rk3399 | Self::Px30 => *b"RK33",
            Self::Rv1108 => *b"RK11",
        }
    }

    /// Maximum SPL payload the boot ROM of this family will load
    pub fn max_spl_size(self) -> u64 {
        match self {
            Self::Rk3036 => 0x1000,
            Self::Rk3066 => 0x8000,
            Self::Rk3128 => 0x1800,
            Self::Rk3188 => 0x8000 - 0x800,
            Self::Rk322x => 0x8000 - 0x1000,
            Self::Rk3288 => 0x8000,
            Self::Rk3308 => 0x40000 - 0x1000,
            Self::Rk3328 => 0x8000 - 0x1000,
            Self::Rk3368 => 0x8000 - 0x1000,
            Self::Rk3399 => 0x30000 - 0x2000,
            Self::Px30 => 0x2800,
            Self::Rv1108 => 0x1800,
        }
    }

    /// Whether the SPL region must be RC4-encrypted in 512-byte blocks
    pub fn requires_rc4(self) -> bool {
        matches!(self, Self::Rk3066 | Self::Rk3188)
    }

    /// Look up a family owning an SPL magic. Several chips share one magic
    /// (e.g. rk3308/rk3368/rk3399/px30 all use "RK33"), so this returns the
    /// first entry of the table; the magic identifies a family, not a chip.
    pub fn from_spl_magic(magic: &[u8; 4]) -> Option<Self> {
        Self::ALL.into_iter().find(|chip| chip.spl_magic() == *magic)
    }
}

impl FromStr for SdmmcChip {
    type Err = RkImageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|chip| chip.name() == s)
            .ok_or_else(|| {
                let supported: Vec<&str> = Self::ALL.iter().map(|c| c.name()).collect();
                RkImageError::config(format!(
                    "unsupported chip: {s} (supported: {})",
                    supported.join(", ")
                ))
            })
    }
}

impl fmt::Display for SdmmcChip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// SD/MMC boot header (512 bytes on disk, stored RC4-encrypted)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header0 {
    pub signature: u32,
    /// 0 = SPL region is RC4-encrypted, 1 = plain
    pub disable_rc4: u32,
    /// SPL offset in blocks
    pub init_offset: u16,
    /// SPL size in blocks, multiple of 4
    pub init_size: u16,
    /// Total boot size including the next stage, in blocks
    pub init_boot_size: u16,
}

impl Header0 {
    /// Serialize to the 512-byte plaintext layout (encrypt before writing).
    pub fn to_bytes(&self) -> [u8; HEADER0_SIZE] {
        let mut data = [0u8; HEADER0_SIZE];
        LittleEndian::write_u32(&mut data[0x000..], self.signature);
        LittleEndian::write_u32(&mut data[0x008..], self.disable_rc4);
        LittleEndian::write_u16(&mut data[0x00C..], self.init_offset);
        LittleEndian::write_u16(&mut data[0x1FA..], self.init_size);
        LittleEndian::write_u16(&mut data[0x1FC..], self.init_boot_size);
        data
    }

    /// Parse from 512 decrypted bytes. The signature is not validated here;
    /// [`verify`] reports it.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER0_SIZE {
            return Err(RkImageError::truncated("SD/MMC header0", data.len(), HEADER0_SIZE));
        }
        Ok(Self {
            signature: LittleEndian::read_u32(&data[0x000..]),
            disable_rc4: LittleEndian::read_u32(&data[0x008..]),
            init_offset: LittleEndian::read_u16(&data[0x00C..]),
            init_size: LittleEndian::read_u16(&data[0x1FA..]),
            init_boot_size: LittleEndian::read_u16(&data[0x1FC..]),
        })
    }
}

fn blocks(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE)
}

/// Create an SD/MMC boot image from an SPL binary. The binary already
/// carries its 4-byte chip magic, so nothing is prepended.
pub fn create(
    spl_file: &Path,
    output: &Path,
    chip: SdmmcChip,
    max_boot_size: u64,
) -> Result<Header0> {
    check_inputs_exist([spl_file])?;
    let spl = std::fs::read(spl_file)?;
    if spl.len() as u64 > chip.max_spl_size() {
        return Err(RkImageError::too_large(spl.len() as u64, chip.max_spl_size()));
    }

    let init_size = align_up(blocks(spl.len() as u64), INIT_SIZE_ALIGN);
    let init_boot_size = align_up(init_size + blocks(max_boot_size), INIT_SIZE_ALIGN);

    let header = Header0 {
        signature: SIGNATURE,
        disable_rc4: if chip.requires_rc4() { 0 } else { 1 },
        init_offset: INIT_OFFSET,
        init_size: init_size as u16,
        init_boot_size: init_boot_size as u16,
    };

    let mut image = Vec::with_capacity(SPL_OFFSET as usize + (init_size * BLOCK_SIZE) as usize);
    image.write_all(&rc4_crypt(&header.to_bytes()))?;
    image.resize(SPL_OFFSET as usize, 0);

    let mut padded = spl;
    padded.resize((init_size * BLOCK_SIZE) as usize, 0);
    if chip.requires_rc4() {
        padded = rc4_crypt_blocks(&padded, RC4_BLOCK_SIZE);
    }
    image.extend_from_slice(&padded);

    write_atomic(output, &image)?;
    Ok(header)
}

/// Append raw bytes to an existing image (used to attach the mini-loader
/// after the SPL region).
pub fn append(image_path: &Path, extra_file: &Path) -> Result<u64> {
    check_inputs_exist([image_path, extra_file])?;
    let extra = std::fs::read(extra_file)?;
    let mut file = std::fs::OpenOptions::new().append(true).open(image_path)?;
    file.write_all(&extra)?;
    Ok(extra.len() as u64)
}

/// Parsed state of an existing SD/MMC boot image
#[derive(Debug)]
pub struct VerifyReport {
    pub header: Header0,
    /// Raw SPL magic found at the SPL offset
    pub spl_magic: [u8; 4],
    /// Chip family the magic belongs to, if known
    pub chip: Option<SdmmcChip>,
    pub file_size: u64,
}

/// Decrypt and check header0, then identify the chip family from the SPL
/// magic at offset 2048.
pub fn verify(image_path: &Path) -> Result<VerifyReport> {
    check_inputs_exist([image_path])?;
    let data = std::fs::read(image_path)?;
    let need = SPL_OFFSET as usize + 4;
    if data.len() < need {
        return Err(RkImageError::truncated("SD/MMC image", data.len(), need));
    }

    let header = Header0::from_bytes(&rc4_crypt(&data[..HEADER0_SIZE]))?;
    if header.signature != SIGNATURE {
        return Err(RkImageError::invalid_magic(SIGNATURE, header.signature));
    }

    let mut spl_magic = [0u8; 4];
    spl_magic.copy_from_slice(&data[SPL_OFFSET as usize..SPL_OFFSET as usize + 4]);

    Ok(VerifyReport {
        header,
        spl_magic,
        chip: SdmmcChip::from_spl_magic(&spl_magic),
        file_size: data.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header0_roundtrip() {
        let header = Header0 {
            signature: SIGNATURE,
            disable_rc4: 1,
            init_offset: INIT_OFFSET,
            init_size: 16,
            init_boot_size: 1040,
        };
        let bytes = header.to_bytes();
        assert_eq!(Header0::from_bytes(&bytes).unwrap(), header);
        // Field positions are fixed by the boot ROM.
        assert_eq!(LittleEndian::read_u32(&bytes[0..]), SIGNATURE);
        assert_eq!(LittleEndian::read_u16(&bytes[0x1FA..]), 16);
        assert_eq!(LittleEndian::read_u16(&bytes[0x1FC..]), 1040);
    }

    #[test]
    fn test_chip_from_str() {
        assert_eq!("rk3399".parse::<SdmmcChip>().unwrap(), SdmmcChip::Rk3399);
        let err = "rk9999".parse::<SdmmcChip>().unwrap_err();
        assert!(err.to_string().contains("rk3288"));
    }

    #[test]
    fn test_chip_table() {
        assert_eq!(SdmmcChip::Rk3399.spl_magic(), *b"RK33");
        assert_eq!(SdmmcChip::Rk3399.max_spl_size(), 0x30000 - 0x2000);
        assert!(!SdmmcChip::Rk3399.requires_rc4());
        assert!(SdmmcChip::Rk3066.requires_rc4());
        assert!(SdmmcChip::Rk3188.requires_rc4());
        assert_eq!(SdmmcChip::from_spl_magic(b"RK11"), Some(SdmmcChip::Rv1108));
        // Shared magic resolves to the first family in the table.
        assert_eq!(SdmmcChip::from_spl_magic(b"RK33"), Some(SdmmcChip::Rk3308));
        assert_eq!(SdmmcChip::from_spl_magic(b"XXXX"), None);
    }

    #[test]
    fn test_init_size_rounding() {
        // 8192 bytes = 16 blocks, already a multiple of 4.
        assert_eq!(align_up(blocks(8192), INIT_SIZE_ALIGN), 16);
        // 1000 bytes = 2 blocks, rounded up to 4.
        assert_eq!(align_up(blocks(1000), INIT_SIZE_ALIGN), 4);
    }

    #[test]
    fn test_create_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let spl = dir.path().join("spl.bin");
        let out = dir.path().join("boot.img");

        let mut payload = b"RK33".to_vec();
        payload.resize(8192, 0xAB);
        std::fs::write(&spl, &payload).unwrap();

        let header = create(&spl, &out, SdmmcChip::Rk3399, DEFAULT_MAX_BOOT_SIZE).unwrap();
        assert_eq!(header.init_size, 16);
        assert_eq!(header.disable_rc4, 1);

        let image = std::fs::read(&out).unwrap();
        assert_eq!(image.len(), SPL_OFFSET as usize + 8192);
        // SPL is stored plain on rk3399.
        assert_eq!(&image[SPL_OFFSET as usize..SPL_OFFSET as usize + 4], b"RK33");

        let report = verify(&out).unwrap();
        assert_eq!(report.header, header);
        assert_eq!(report.spl_magic, *b"RK33");
        // The RK33 magic cannot distinguish rk3399 from its siblings; the
        // first RK33 family in the table is reported.
        assert_eq!(report.chip, Some(SdmmcChip::Rk3308));
        assert_eq!(report.chip.unwrap().spl_magic(), SdmmcChip::Rk3399.spl_magic());
    }

    #[test]
    fn test_create_encrypts_when_required() {
        let dir = tempfile::tempdir().unwrap();
        let spl = dir.path().join("spl.bin");
        let out = dir.path().join("boot.img");

        let mut payload = b"RK30".to_vec();
        payload.resize(1000, 0x11);
        std::fs::write(&spl, &payload).unwrap();

        let header = create(&spl, &out, SdmmcChip::Rk3066, DEFAULT_MAX_BOOT_SIZE).unwrap();
        assert_eq!(header.disable_rc4, 0);

        let image = std::fs::read(&out).unwrap();
        let spl_region = &image[SPL_OFFSET as usize..];
        assert_ne!(&spl_region[..4], b"RK30");
        let decrypted = crate::rc4::rc4_crypt_blocks(spl_region, RC4_BLOCK_SIZE);
        assert_eq!(&decrypted[..1000], &payload[..]);
    }

    #[test]
    fn test_create_rejects_oversize() {
        let dir = tempfile::tempdir().unwrap();
        let spl = dir.path().join("spl.bin");
        let out = dir.path().join("boot.img");
        std::fs::write(&spl, vec![0u8; 0x1001]).unwrap();

        let err = create(&spl, &out, SdmmcChip::Rk3036, DEFAULT_MAX_BOOT_SIZE).unwrap_err();
        assert!(matches!(err, RkImageError::SizeLimit { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn test_append() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("boot.img");
        let extra = dir.path().join("mini.bin");
        std::fs::write(&img, b"base").unwrap();
        std::fs::write(&extra, b"loader").unwrap();

        assert_eq!(append(&img, &extra).unwrap(), 6);
        assert_eq!(std::fs::read(&img).unwrap(), b"baseloader");
    }
}
