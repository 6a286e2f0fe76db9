//! Trust image codec (trust.img)
//!
//! Merges ARM Trusted Firmware (BL31) and optionally OP-TEE (BL32) into the
//! container the boot ROM verifies. ELF inputs contribute one component per
//! PT_LOAD segment; raw binaries contribute a single component at their
//! configured load address.
//!
//! ```text
//! 0x000  header struct (800B: tag, version, flags, size, RSA slots)
//! 0x320  hash records, 48B per component (SHA-256 + load address)
//!        signature slot (256B, zero)
//!        storage records, 16B per component
//! 0x800  component payloads, 2048B-aligned
//! ```
//!
//! All metadata must fit in the 2048-byte header region, which caps the
//! component count at 15. The output file holds two identical 2 MiB copies.

use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::align_up;
use crate::config::{BinaryEntry, TrustConfig};
use crate::elf::{is_elf, load_segments};
use crate::error::{Result, RkImageError, check_inputs_exist};
use crate::idblock::bcd;
use crate::write_atomic;

/// "BL3X" tag at the start of the header
pub const TAG_TRUST: [u8; 4] = *b"BL3X";

/// Size of the header region reserved on disk
pub const HEADER_REGION: usize = 2048;

/// Size of the header struct itself (tag through the RSA parameter slots)
pub const HEADER_STRUCT_SIZE: usize = 800;

/// RSA signature slot size (left zero, signing unimplemented)
pub const SIGNATURE_SIZE: usize = 256;

/// Per-component hash record size
pub const HASH_RECORD_SIZE: usize = 48;

/// Per-component storage record size
pub const STORAGE_RECORD_SIZE: usize = 16;

/// Payload alignment
pub const COMPONENT_ALIGN: u64 = 2048;

/// Maximum size of one assembled copy (2 MiB)
pub const MAX_COPY_SIZE: u64 = 2 * 1024 * 1024;

/// Number of back-to-back copies in the output file
pub const NUM_COPIES: usize = 2;

/// Most components whose metadata still fits in the header region
pub const MAX_COMPONENTS: usize =
    (HEADER_REGION - HEADER_STRUCT_SIZE - SIGNATURE_SIZE) / (HASH_RECORD_SIZE + STORAGE_RECORD_SIZE);

/// Hash algorithm selector recorded in the header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaMode {
    None = 0,
    Sha1 = 1,
    /// Big-endian SHA-256 variant used by RK3368
    Sha256Rk = 2,
    Sha256 = 3,
}

impl TryFrom<u8> for ShaMode {
    type Error = RkImageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Sha1),
            2 => Ok(Self::Sha256Rk),
            3 => Ok(Self::Sha256),
            other => Err(RkImageError::config(format!("invalid SHA mode: {other}"))),
        }
    }
}

/// Signature scheme selector recorded in the header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaMode {
    None = 0,
    Pkcs1V15Rsa1024 = 1,
    Pkcs1V15Rsa2048 = 2,
    Pkcs1V21 = 3,
    Pkcs1V21Alt = 4,
}

impl TryFrom<u8> for RsaMode {
    type Error = RkImageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Pkcs1V15Rsa1024),
            2 => Ok(Self::Pkcs1V15Rsa2048),
            3 => Ok(Self::Pkcs1V21),
            4 => Ok(Self::Pkcs1V21Alt),
            other => Err(RkImageError::config(format!("invalid RSA mode: {other}"))),
        }
    }
}

/// One payload destined for the trust image
#[derive(Debug, Clone)]
struct Component {
    id: [u8; 4],
    load_addr: u32,
    data: Vec<u8>,
}

/// Derive components from one firmware entry: every PT_LOAD segment of an
/// ELF, or the whole file as a single raw component. Only a missing ELF
/// magic falls back to raw treatment; a malformed ELF is an error.
fn derive_components(entry: &BinaryEntry, id: [u8; 4]) -> Result<Vec<Component>> {
    let data = std::fs::read(&entry.path)?;
    if !is_elf(&data) {
        return Ok(vec![Component {
            id,
            load_addr: entry.address,
            data,
        }]);
    }

    let mut components = Vec::new();
    for segment in load_segments(&data)? {
        let start = segment.offset as usize;
        let end = start + segment.filesz as usize;
        if data.len() < end {
            return Err(RkImageError::format(format!(
                "ELF segment at 0x{:x} extends past end of {}",
                segment.offset,
                entry.path.display()
            )));
        }
        components.push(Component {
            id,
            load_addr: segment.vaddr as u32,
            data: data[start..end].to_vec(),
        });
    }
    Ok(components)
}

/// Packer for trust images
#[derive(Debug, Clone)]
pub struct TrustImage {
    config: TrustConfig,
    sha_mode: ShaMode,
    rsa_mode: RsaMode,
}

impl TrustImage {
    pub fn new(config: TrustConfig) -> Self {
        Self {
            config,
            sha_mode: ShaMode::Sha256,
            rsa_mode: RsaMode::Pkcs1V15Rsa2048,
        }
    }

    pub fn sha_mode(mut self, mode: ShaMode) -> Self {
        self.sha_mode = mode;
        self
    }

    pub fn rsa_mode(mut self, mode: RsaMode) -> Self {
        self.rsa_mode = mode;
        self
    }

    /// Assemble the complete two-copy image in memory.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        self.config.validate()?;
        check_inputs_exist(self.config.input_paths())?;

        let mut components = Vec::new();
        if let Some(bl31) = &self.config.bl31 {
            components.extend(derive_components(bl31, *b"BL31")?);
        }
        if let Some(bl32) = &self.config.bl32 {
            components.extend(derive_components(bl32, *b"BL32")?);
        }
        if components.is_empty() {
            return Err(RkImageError::config("no components to pack"));
        }
        if components.len() > MAX_COMPONENTS {
            return Err(RkImageError::config(format!(
                "{} components exceed the limit of {MAX_COMPONENTS}",
                components.len()
            )));
        }

        let n = components.len();
        let sign_offset = HEADER_STRUCT_SIZE + n * HASH_RECORD_SIZE;
        let storage_offset = sign_offset + SIGNATURE_SIZE;

        let mut image = vec![0u8; HEADER_REGION];
        image[..4].copy_from_slice(&TAG_TRUST);
        let (major, minor) = self.config.version;
        let version = ((bcd(major) as u32) << 8) | bcd(minor) as u32;
        LittleEndian::write_u32(&mut image[4..], version);
        let flags = (self.sha_mode as u32) | ((self.rsa_mode as u32) << 4);
        LittleEndian::write_u32(&mut image[8..], flags);
        LittleEndian::write_u32(&mut image[12..], ((n as u32) << 16) | (sign_offset as u32 >> 2));
        // Reserved bytes and RSA N/E/C parameter slots stay zero.

        for (i, comp) in components.iter().enumerate() {
            let mut data = comp.data.clone();
            data.resize(align_up(data.len() as u64, COMPONENT_ALIGN) as usize, 0);
            let payload_offset = (image.len() as u64 >> 9) as u32;

            let hash: [u8; 32] = Sha256::digest(&data).into();
            let record = HEADER_STRUCT_SIZE + i * HASH_RECORD_SIZE;
            image[record..record + 32].copy_from_slice(&hash);
            LittleEndian::write_u32(&mut image[record + 32..], comp.load_addr);

            let storage = storage_offset + i * STORAGE_RECORD_SIZE;
            image[storage..storage + 4].copy_from_slice(&comp.id);
            LittleEndian::write_u32(&mut image[storage + 4..], payload_offset);
            LittleEndian::write_u32(&mut image[storage + 8..], (data.len() as u64 >> 9) as u32);

            image.extend_from_slice(&data);
        }

        if image.len() as u64 > MAX_COPY_SIZE {
            return Err(RkImageError::too_large(image.len() as u64, MAX_COPY_SIZE));
        }

        let mut total = vec![0u8; MAX_COPY_SIZE as usize * NUM_COPIES];
        for copy in 0..NUM_COPIES {
            let offset = copy * MAX_COPY_SIZE as usize;
            total[offset..offset + image.len()].copy_from_slice(&image);
        }
        Ok(total)
    }

    /// Assemble and write the image to `output` (atomically).
    pub fn pack(&self, output: &Path) -> Result<()> {
        let image = self.assemble()?;
        write_atomic(output, &image)
    }
}

/// One extracted component and its metadata
#[derive(Debug)]
pub struct TrustComponentInfo {
    pub id: String,
    pub load_addr: u32,
    pub storage_offset: u64,
    pub size: u64,
    pub file: PathBuf,
}

/// Result of unpacking a trust image
#[derive(Debug)]
pub struct TrustUnpack {
    /// Raw BCD-packed version field
    pub version: u32,
    pub sha_mode: u8,
    pub rsa_mode: u8,
    pub components: Vec<TrustComponentInfo>,
}

/// Unpack a trust image, extracting each component to a file named after
/// its 4-byte id under `out_dir`.
pub fn unpack(image_path: &Path, out_dir: &Path) -> Result<TrustUnpack> {
    check_inputs_exist([image_path])?;
    let data = std::fs::read(image_path)?;
    if data.len() < HEADER_REGION {
        return Err(RkImageError::truncated("trust header", data.len(), HEADER_REGION));
    }
    if data[..4] != TAG_TRUST {
        return Err(RkImageError::format(format!(
            "invalid trust image tag: {:?}",
            String::from_utf8_lossy(&data[..4])
        )));
    }

    let version = LittleEndian::read_u32(&data[4..]);
    let flags = LittleEndian::read_u32(&data[8..]);
    let size_field = LittleEndian::read_u32(&data[12..]);
    let n = (size_field >> 16) as usize;
    let sign_offset = ((size_field & 0xFFFF) << 2) as usize;
    let storage_offset = sign_offset + SIGNATURE_SIZE;
    // Both record tables must fit the header region: hash records end at the
    // signature slot, storage records end before the payload area.
    if HEADER_STRUCT_SIZE + n * HASH_RECORD_SIZE > sign_offset
        || storage_offset + n * STORAGE_RECORD_SIZE > HEADER_REGION
    {
        return Err(RkImageError::format(format!(
            "component metadata does not fit the header region ({n} components)"
        )));
    }

    std::fs::create_dir_all(out_dir)?;
    let mut components = Vec::with_capacity(n);
    for i in 0..n {
        let hash_record = HEADER_STRUCT_SIZE + i * HASH_RECORD_SIZE;
        let load_addr = LittleEndian::read_u32(&data[hash_record + 32..]);

        let record = storage_offset + i * STORAGE_RECORD_SIZE;
        let id_bytes = &data[record..record + 4];
        let id = String::from_utf8_lossy(id_bytes)
            .trim_end_matches(['\0', ' '])
            .to_string();
        let offset = (LittleEndian::read_u32(&data[record + 4..]) as u64) << 9;
        let size = (LittleEndian::read_u32(&data[record + 8..]) as u64) << 9;

        let end = offset + size;
        if end > data.len() as u64 {
            return Err(RkImageError::format(format!(
                "component {id} points past end of image (offset 0x{offset:x}, size {size})"
            )));
        }

        let file = out_dir.join(&id);
        std::fs::write(&file, &data[offset as usize..end as usize])?;
        components.push(TrustComponentInfo {
            id,
            load_addr,
            storage_offset: offset,
            size,
            file,
        });
    }

    Ok(TrustUnpack {
        version,
        sha_mode: (flags & 0xF) as u8,
        rsa_mode: ((flags >> 4) & 0xF) as u8,
        components,
    })
}
