//! Second-stage loader wrapper codec (uboot.img / trust.img)
//!
//! A simple redundant container: a 2048-byte header binding the payload to
//! its load address with CRC-32 and SHA-256, followed by the payload, with
//! the whole block zero-padded to a fixed copy size and repeated several
//! times so the boot ROM can fall back to another copy on corruption.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};

use crate::align_up;
use crate::crc::{calculate_crc32, verify_crc32};
use crate::error::{Result, RkImageError, check_inputs_exist};
use crate::write_atomic;

/// On-disk header size
pub const HEADER_SIZE: usize = 2048;

/// "SIGN" marker at the start of the signature block
pub const SIGN_TAG: u32 = 0x4E47_4953;

/// Signature slot size (RSA-2048, left zero)
pub const SIGN_LEN: u32 = 256;

/// SHA-256 digest length stored in the header
pub const HASH_LEN: u32 = 32;

/// Default size of one redundant copy (1 MiB)
pub const DEFAULT_COPY_SIZE: u64 = 1024 * 1024;

/// Default number of back-to-back copies
pub const DEFAULT_NUM_COPIES: u32 = 4;

/// Default load address for the main bootloader payload
pub const DEFAULT_UBOOT_ADDR: u32 = 0x0020_0000;

/// Default load address for the trusted-OS payload
pub const DEFAULT_TRUST_ADDR: u32 = 0x0840_0000;

const SIGN_BLOCK_OFFSET: usize = 1024;

/// Payload kind, selecting the 8-byte magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderType {
    /// Main bootloader wrapper (`"LOADER  "`)
    Uboot,
    /// Trusted-OS wrapper (`"TOS     "`)
    Tos,
}

impl LoaderType {
    pub fn magic(self) -> [u8; 8] {
        match self {
            Self::Uboot => *b"LOADER  ",
            Self::Tos => *b"TOS     ",
        }
    }

    pub fn from_magic(magic: &[u8; 8]) -> Result<Self> {
        match magic {
            b"LOADER  " => Ok(Self::Uboot),
            b"TOS     " => Ok(Self::Tos),
            other => Err(RkImageError::format(format!(
                "unknown loader magic: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Uboot => "uboot",
            Self::Tos => "trust",
        }
    }
}

/// Loader wrapper header (2048 bytes on disk)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderHeader {
    pub loader_type: LoaderType,
    pub version: u32,
    pub load_addr: u32,
    /// Payload size after 4-byte alignment
    pub size: u32,
    /// CRC-32 of the aligned payload
    pub crc: u32,
    /// SHA-256 over the aligned payload plus the metadata fields above
    pub hash: [u8; 32],
}

impl LoaderHeader {
    /// Serialize the header to exactly 2048 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&self.loader_type.magic());
        buf.write_u32::<LittleEndian>(self.version)?;
        buf.write_u32::<LittleEndian>(0)?; // reserved
        buf.write_u32::<LittleEndian>(self.load_addr)?;
        buf.write_u32::<LittleEndian>(self.size)?;
        buf.write_u32::<LittleEndian>(self.crc)?;
        buf.write_u32::<LittleEndian>(HASH_LEN)?;
        buf.extend_from_slice(&self.hash);
        buf.resize(SIGN_BLOCK_OFFSET, 0);
        buf.write_u32::<LittleEndian>(SIGN_TAG)?;
        buf.write_u32::<LittleEndian>(SIGN_LEN)?;
        // RSA signature slot stays zero, signing is not implemented.
        buf.resize(HEADER_SIZE, 0);
        Ok(buf)
    }

    /// Parse a header from the first 2048 bytes of an image.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(RkImageError::truncated("loader header", data.len(), HEADER_SIZE));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[..8]);
        let loader_type = LoaderType::from_magic(&magic)?;

        let mut cursor = Cursor::new(&data[8..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        let load_addr = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;
        let crc = cursor.read_u32::<LittleEndian>()?;
        let _hash_len = cursor.read_u32::<LittleEndian>()?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&data[32..64]);

        Ok(Self {
            loader_type,
            version,
            load_addr,
            size,
            crc,
            hash,
        })
    }
}

/// Packing parameters with per-type defaults
#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    pub loader_type: LoaderType,
    pub load_addr: u32,
    pub version: u32,
    pub copy_size: u64,
    pub num_copies: u32,
}

impl PackOptions {
    /// Defaults for the main bootloader: `"LOADER  "` at 0x200000
    pub fn uboot() -> Self {
        Self {
            loader_type: LoaderType::Uboot,
            load_addr: DEFAULT_UBOOT_ADDR,
            version: 0,
            copy_size: DEFAULT_COPY_SIZE,
            num_copies: DEFAULT_NUM_COPIES,
        }
    }

    /// Defaults for the trusted OS: `"TOS     "` at 0x8400000
    pub fn trust() -> Self {
        Self {
            loader_type: LoaderType::Tos,
            load_addr: DEFAULT_TRUST_ADDR,
            version: 0,
            copy_size: DEFAULT_COPY_SIZE,
            num_copies: DEFAULT_NUM_COPIES,
        }
    }

    pub fn load_addr(mut self, addr: u32) -> Self {
        self.load_addr = addr;
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Maximum payload size the copy size leaves room for
    pub fn max_payload(&self) -> u64 {
        self.copy_size - HEADER_SIZE as u64
    }
}

/// SHA-256 over the payload and the header metadata that must travel with
/// it: aligned payload bytes, then (only when version > 0) the version as
/// 8 little-endian bytes, then load address, aligned size and hash length.
fn metadata_hash(payload: &[u8], opts: &PackOptions) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    if opts.version > 0 {
        hasher.update((opts.version as u64).to_le_bytes());
    }
    hasher.update(opts.load_addr.to_le_bytes());
    hasher.update((payload.len() as u32).to_le_bytes());
    hasher.update(HASH_LEN.to_le_bytes());
    hasher.finalize().into()
}

/// Assemble the complete multi-copy image in memory.
pub fn assemble(payload: &[u8], opts: &PackOptions) -> Result<Vec<u8>> {
    if payload.len() as u64 > opts.max_payload() {
        return Err(RkImageError::too_large(payload.len() as u64, opts.max_payload()));
    }

    let mut aligned = payload.to_vec();
    aligned.resize(align_up(aligned.len() as u64, 4) as usize, 0);

    let header = LoaderHeader {
        loader_type: opts.loader_type,
        version: opts.version,
        load_addr: opts.load_addr,
        size: aligned.len() as u32,
        crc: calculate_crc32(&aligned),
        hash: metadata_hash(&aligned, opts),
    };

    let mut copy = header.to_bytes()?;
    copy.extend_from_slice(&aligned);
    copy.resize(opts.copy_size as usize, 0);

    let mut image = Vec::with_capacity(copy.len() * opts.num_copies as usize);
    for _ in 0..opts.num_copies {
        image.extend_from_slice(&copy);
    }
    Ok(image)
}

/// Wrap `input` and write the redundant image to `output` (atomically).
pub fn pack(input: &Path, output: &Path, opts: &PackOptions) -> Result<()> {
    check_inputs_exist([input])?;
    let payload = std::fs::read(input)?;
    let image = assemble(&payload, opts)?;
    write_atomic(output, &image)
}

/// Result of unpacking a loader wrapper
#[derive(Debug)]
pub struct LoaderUnpack {
    pub header: LoaderHeader,
    pub output: PathBuf,
    /// Non-fatal integrity findings (extraction still completed)
    pub warnings: Vec<String>,
}

/// Extract the payload of the first copy to `output`.
pub fn unpack(image_path: &Path, output: &Path) -> Result<LoaderUnpack> {
    check_inputs_exist([image_path])?;
    let data = std::fs::read(image_path)?;
    let header = LoaderHeader::from_bytes(&data)?;

    let start = HEADER_SIZE;
    let end = start + header.size as usize;
    if data.len() < end {
        return Err(RkImageError::truncated("loader payload", data.len() - start, header.size as usize));
    }
    let payload = &data[start..end];

    let mut warnings = Vec::new();
    if !verify_crc32(payload, header.crc) {
        warnings.push(format!(
            "payload CRC mismatch: stored 0x{:08x}, calculated 0x{:08x}",
            header.crc,
            calculate_crc32(payload)
        ));
    }

    write_atomic(output, payload)?;
    Ok(LoaderUnpack {
        header,
        output: output.to_path_buf(),
        warnings,
    })
}

/// Parse the header only, for inspection.
pub fn info(image_path: &Path) -> Result<LoaderHeader> {
    check_inputs_exist([image_path])?;
    let data = std::fs::read(image_path)?;
    LoaderHeader::from_bytes(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = LoaderHeader {
            loader_type: LoaderType::Uboot,
            version: 0x0102,
            load_addr: DEFAULT_UBOOT_ADDR,
            size: 1024,
            crc: 0xDEADBEEF,
            hash: [0x5A; 32],
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..8], b"LOADER  ");
        assert_eq!(
            u32::from_le_bytes([bytes[1024], bytes[1025], bytes[1026], bytes[1027]]),
            SIGN_TAG
        );
        assert_eq!(LoaderHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_bad_magic() {
        let data = vec![0u8; HEADER_SIZE];
        assert!(LoaderHeader::from_bytes(&data).is_err());
    }

    #[test]
    fn test_assemble_basic() {
        let payload = vec![0u8; 1024];
        let image = assemble(&payload, &PackOptions::uboot()).unwrap();
        assert_eq!(image.len(), 4 * 1024 * 1024);

        let header = LoaderHeader::from_bytes(&image).unwrap();
        assert_eq!(header.loader_type, LoaderType::Uboot);
        assert_eq!(header.version, 0);
        assert_eq!(header.load_addr, DEFAULT_UBOOT_ADDR);
        assert_eq!(header.size, 1024);
        assert_eq!(header.crc, calculate_crc32(&payload));

        // All four copies are identical.
        let copy = DEFAULT_COPY_SIZE as usize;
        assert_eq!(image[..copy], image[copy..2 * copy]);
        assert_eq!(image[..copy], image[3 * copy..]);
    }

    #[test]
    fn test_assemble_aligns_payload() {
        let image = assemble(&[1, 2, 3], &PackOptions::uboot()).unwrap();
        let header = LoaderHeader::from_bytes(&image).unwrap();
        assert_eq!(header.size, 4);
        assert_eq!(&image[HEADER_SIZE..HEADER_SIZE + 4], &[1, 2, 3, 0]);
    }

    #[test]
    fn test_size_limit_boundary() {
        let opts = PackOptions::uboot();
        let max = opts.max_payload() as usize;
        assert!(assemble(&vec![0u8; max], &opts).is_ok());
        assert!(matches!(
            assemble(&vec![0u8; max + 1], &opts).unwrap_err(),
            RkImageError::SizeLimit { .. }
        ));
    }

    #[test]
    fn test_version_changes_hash() {
        let payload = vec![7u8; 64];
        let a = assemble(&payload, &PackOptions::trust()).unwrap();
        let b = assemble(&payload, &PackOptions::trust().version(0x0100)).unwrap();
        let ha = LoaderHeader::from_bytes(&a).unwrap();
        let hb = LoaderHeader::from_bytes(&b).unwrap();
        assert_ne!(ha.hash, hb.hash);
        assert_eq!(ha.crc, hb.crc);
    }

    #[test]
    fn test_trust_defaults() {
        let image = assemble(b"tos", &PackOptions::trust()).unwrap();
        let header = LoaderHeader::from_bytes(&image).unwrap();
        assert_eq!(header.loader_type, LoaderType::Tos);
        assert_eq!(header.load_addr, DEFAULT_TRUST_ADDR);
        assert_eq!(header.loader_type.name(), "trust");
    }
}
