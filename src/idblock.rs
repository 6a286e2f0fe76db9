//! ID-block image codec (idbloader.img / loader.bin)
//!
//! The ID block is the first-stage image the boot ROM loads directly: DDR
//! initialization code plus the mini-loader, described by a 102-byte header
//! and one 54-byte entry record per payload, with a trailing CRC-32 over the
//! whole image. The layout follows the vendor's boot_merger format.
//!
//! ```text
//! Header(102B) | Entry[] x 54B | payload data (2048B-aligned) | CRC32(4B)
//! ```

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Datelike, Local, Timelike};

use crate::align_up;
use crate::config::BootConfig;
use crate::crc::{calculate_crc32, verify_crc32};
use crate::error::{Result, RkImageError, check_inputs_exist};
use crate::rc4::{RC4_BLOCK_SIZE, rc4_crypt, rc4_crypt_blocks};
use crate::write_atomic;

/// "BOOT" tag at the start of every ID-block image
pub const TAG_BOOT: u32 = 0x544F_4F42;

/// Version stamp of the merger tool this format tracks
pub const MERGER_VERSION: u32 = 0x0103_0000;

/// Fixed header size
pub const HEADER_SIZE: usize = 102;

/// Fixed entry record size
pub const ENTRY_SIZE: usize = 54;

/// Payload data alignment
pub const ENTRY_ALIGN: u64 = 2048;

/// Extra alignment granularity for loader payloads
pub const SMALL_PACKET: u64 = 512;

/// Maximum entry name length in UTF-16 code units
pub const MAX_NAME_LEN: usize = 20;

const RESERVED_SIZE: usize = 57;

/// Payload kind carried by an entry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// DDR initialization code (CODE471 group)
    DdrInit = 1,
    /// USB plug code (CODE472 group, normally empty)
    Plug = 2,
    /// Mini-loader / flash boot code
    Loader = 4,
}

impl TryFrom<u8> for EntryKind {
    type Error = RkImageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::DdrInit),
            2 => Ok(Self::Plug),
            4 => Ok(Self::Loader),
            other => Err(RkImageError::format(format!(
                "invalid entry type: {other}"
            ))),
        }
    }
}

/// Release timestamp embedded in the header (7 bytes on disk)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl ReleaseTime {
    /// Timestamp for the current local time
    pub fn now() -> Self {
        let t = Local::now();
        Self {
            year: t.year() as u16,
            month: t.month() as u8,
            day: t.day() as u8,
            hour: t.hour() as u8,
            minute: t.minute() as u8,
            second: t.second() as u8,
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.year)?;
        writer.write_u8(self.month)?;
        writer.write_u8(self.day)?;
        writer.write_u8(self.hour)?;
        writer.write_u8(self.minute)?;
        writer.write_u8(self.second)?;
        Ok(())
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            year: cursor.read_u16::<LittleEndian>()?,
            month: cursor.read_u8()?,
            day: cursor.read_u8()?,
            hour: cursor.read_u8()?,
            minute: cursor.read_u8()?,
            second: cursor.read_u8()?,
        })
    }
}

/// ID-block header (102 bytes on disk)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootHeader {
    pub tag: u32,
    pub size: u16,
    /// BCD-packed version: `bcd(major) << 8 | bcd(minor)`
    pub version: u32,
    pub merger_version: u32,
    pub release_time: ReleaseTime,
    pub chip_type: u32,
    pub code471_num: u8,
    pub code471_offset: u32,
    pub code471_size: u8,
    pub code472_num: u8,
    pub code472_offset: u32,
    pub code472_size: u8,
    pub loader_num: u8,
    pub loader_offset: u32,
    pub loader_size: u8,
    pub sign_flag: u8,
    /// 1 = RC4 disabled (default), 0 = the whole image is RC4-encrypted
    pub rc4_flag: u8,
}

impl BootHeader {
    /// Whether the image body is RC4-encrypted
    pub fn rc4_enabled(&self) -> bool {
        self.rc4_flag == 0
    }

    /// Total number of entry records following the header
    pub fn entry_count(&self) -> usize {
        self.code471_num as usize + self.code472_num as usize + self.loader_num as usize
    }

    /// Serialize the header to exactly 102 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u32::<LittleEndian>(self.tag)?;
        buf.write_u16::<LittleEndian>(self.size)?;
        buf.write_u32::<LittleEndian>(self.version)?;
        buf.write_u32::<LittleEndian>(self.merger_version)?;
        self.release_time.write_to(&mut buf)?;
        buf.write_u32::<LittleEndian>(self.chip_type)?;
        buf.write_u8(self.code471_num)?;
        buf.write_u32::<LittleEndian>(self.code471_offset)?;
        buf.write_u8(self.code471_size)?;
        buf.write_u8(self.code472_num)?;
        buf.write_u32::<LittleEndian>(self.code472_offset)?;
        buf.write_u8(self.code472_size)?;
        buf.write_u8(self.loader_num)?;
        buf.write_u32::<LittleEndian>(self.loader_offset)?;
        buf.write_u8(self.loader_size)?;
        buf.write_u8(self.sign_flag)?;
        buf.write_u8(self.rc4_flag)?;
        buf.extend_from_slice(&[0u8; RESERVED_SIZE]);
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        Ok(buf)
    }

    /// Parse a header from the first 102 bytes of an image.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(RkImageError::truncated("ID-block header", data.len(), HEADER_SIZE));
        }
        let mut cursor = Cursor::new(data);
        let tag = cursor.read_u32::<LittleEndian>()?;
        if tag != TAG_BOOT {
            return Err(RkImageError::invalid_magic(TAG_BOOT, tag));
        }
        Ok(Self {
            tag,
            size: cursor.read_u16::<LittleEndian>()?,
            version: cursor.read_u32::<LittleEndian>()?,
            merger_version: cursor.read_u32::<LittleEndian>()?,
            release_time: ReleaseTime::read_from(&mut cursor)?,
            chip_type: cursor.read_u32::<LittleEndian>()?,
            code471_num: cursor.read_u8()?,
            code471_offset: cursor.read_u32::<LittleEndian>()?,
            code471_size: cursor.read_u8()?,
            code472_num: cursor.read_u8()?,
            code472_offset: cursor.read_u32::<LittleEndian>()?,
            code472_size: cursor.read_u8()?,
            loader_num: cursor.read_u8()?,
            loader_offset: cursor.read_u32::<LittleEndian>()?,
            loader_size: cursor.read_u8()?,
            sign_flag: cursor.read_u8()?,
            rc4_flag: cursor.read_u8()?,
        })
    }
}

/// Entry record describing one payload (54 bytes on disk)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub size: u8,
    pub kind: EntryKind,
    /// Payload name as 20 little-endian UTF-16 code units, zero-padded
    pub name: [u16; MAX_NAME_LEN],
    pub data_offset: u32,
    /// Aligned payload size
    pub data_size: u32,
    pub data_delay: u32,
}

impl BootEntry {
    fn new(kind: EntryKind, stem: &str, data_offset: u32, data_size: u32) -> Self {
        Self {
            size: ENTRY_SIZE as u8,
            kind,
            name: wide_name(stem),
            data_offset,
            data_size,
            data_delay: 0,
        }
    }

    /// Entry name decoded back to a string, stopping at the first NUL.
    pub fn name_string(&self) -> String {
        let end = self.name.iter().position(|&c| c == 0).unwrap_or(MAX_NAME_LEN);
        String::from_utf16_lossy(&self.name[..end])
    }

    /// Serialize the entry to exactly 54 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(ENTRY_SIZE);
        buf.write_u8(self.size)?;
        buf.write_u8(self.kind as u8)?;
        for unit in self.name {
            buf.write_u16::<LittleEndian>(unit)?;
        }
        buf.write_u32::<LittleEndian>(self.data_offset)?;
        buf.write_u32::<LittleEndian>(self.data_size)?;
        buf.write_u32::<LittleEndian>(self.data_delay)?;
        debug_assert_eq!(buf.len(), ENTRY_SIZE);
        Ok(buf)
    }

    /// Parse an entry from a 54-byte record.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_SIZE {
            return Err(RkImageError::truncated("ID-block entry", data.len(), ENTRY_SIZE));
        }
        let mut cursor = Cursor::new(data);
        let size = cursor.read_u8()?;
        let kind = EntryKind::try_from(cursor.read_u8()?)?;
        let mut name = [0u16; MAX_NAME_LEN];
        for unit in &mut name {
            *unit = cursor.read_u16::<LittleEndian>()?;
        }
        Ok(Self {
            size,
            kind,
            name,
            data_offset: cursor.read_u32::<LittleEndian>()?,
            data_size: cursor.read_u32::<LittleEndian>()?,
            data_delay: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Pack a decimal value (0..=99) into binary-coded decimal.
pub fn bcd(value: u8) -> u8 {
    let v = value % 100;
    ((v / 10) << 4) | (v % 10)
}

/// Derive the 32-bit chip type from a chip name.
///
/// Legacy chip families use fixed group identifiers; newer names like
/// "RK3399" encode four ASCII characters of the numeric part big-endian.
pub fn chip_type(chip_name: &str) -> Result<u32> {
    if let Some(t) = legacy_chip_type(chip_name) {
        return Ok(t);
    }
    if !chip_name.is_ascii() {
        return Err(RkImageError::config(format!(
            "chip name is not ASCII: {chip_name:?}"
        )));
    }
    let id = if let Some(rest) = chip_name.strip_prefix("RK") {
        &rest[..rest.len().min(4)]
    } else {
        &chip_name[..chip_name.len().min(4)]
    };
    if id.is_empty() {
        return Err(RkImageError::config(format!(
            "cannot derive chip type from {chip_name:?}"
        )));
    }
    let mut bytes = [0u8; 4];
    bytes[..id.len()].copy_from_slice(id.as_bytes());
    Ok(u32::from_be_bytes(bytes))
}

fn legacy_chip_type(chip_name: &str) -> Option<u32> {
    let t = match chip_name {
        "RK27" => 0x10,
        "RKCAYMAN" => 0x11,
        "RK28" => 0x20,
        "RK281X" => 0x21,
        "RKPANDA" => 0x22,
        "RKNANO" => 0x30,
        "RKSMART" => 0x31,
        "RKCROWN" => 0x40,
        "RK29" => 0x50,
        "RK292X" => 0x51,
        "RK30" => 0x60,
        "RK30B" => 0x61,
        "RK31" => 0x70,
        "RK32" => 0x80,
        _ => return None,
    };
    Some(t)
}

fn wide_name(stem: &str) -> [u16; MAX_NAME_LEN] {
    let mut name = [0u16; MAX_NAME_LEN];
    for (slot, unit) in name.iter_mut().zip(stem.encode_utf16()) {
        *slot = unit;
    }
    name
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Aligned on-disk size of a payload. Loader payloads are aligned to the
/// 512-byte packet size first, then everything is aligned to 2048 bytes.
fn aligned_size(file_size: u64, kind: EntryKind) -> u64 {
    let size = match kind {
        EntryKind::Loader => align_up(file_size, SMALL_PACKET),
        _ => file_size,
    };
    align_up(size, ENTRY_ALIGN)
}

/// Packer for ID-block images
#[derive(Debug, Clone)]
pub struct IdBlockImage {
    config: BootConfig,
    rc4: bool,
    release_time: Option<ReleaseTime>,
}

impl IdBlockImage {
    pub fn new(config: BootConfig) -> Self {
        Self {
            config,
            rc4: false,
            release_time: None,
        }
    }

    /// Enable whole-image RC4 encryption
    pub fn enable_rc4(mut self, enable: bool) -> Self {
        self.rc4 = enable;
        self
    }

    /// Override the release timestamp (packing is deterministic given one)
    pub fn release_time(mut self, time: ReleaseTime) -> Self {
        self.release_time = Some(time);
        self
    }

    /// Assemble the complete image in memory.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        self.config.validate()?;
        check_inputs_exist(self.config.input_paths())?;

        let code471_num = self.config.ddr_bins.len();
        let loader_num = self.config.loader_bins.len();
        if code471_num > u8::MAX as usize || loader_num > u8::MAX as usize {
            return Err(RkImageError::config("too many entries"));
        }

        let header = self.build_header(code471_num as u8, loader_num as u8)?;

        // Entry records first, payload data after, in the same group order.
        let mut entries = Vec::with_capacity(code471_num + loader_num);
        let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(code471_num + loader_num);
        let mut data_offset = (HEADER_SIZE + (code471_num + loader_num) * ENTRY_SIZE) as u64;

        for (bin, kind) in self
            .config
            .ddr_bins
            .iter()
            .map(|b| (b, EntryKind::DdrInit))
            .chain(self.config.loader_bins.iter().map(|b| (b, EntryKind::Loader)))
        {
            let mut data = std::fs::read(&bin.path)?;
            let padded = aligned_size(data.len() as u64, kind);
            data.resize(padded as usize, 0);

            entries.push(BootEntry::new(
                kind,
                &file_stem(&bin.path),
                data_offset as u32,
                padded as u32,
            ));
            payloads.push(data);
            data_offset += padded;
        }

        let mut image = header.to_bytes()?;
        for entry in &entries {
            image.extend_from_slice(&entry.to_bytes()?);
        }
        for payload in &payloads {
            image.extend_from_slice(payload);
        }

        let crc = calculate_crc32(&image);
        image.write_u32::<LittleEndian>(crc)?;

        // Whole-image encryption covers the header, the entry records and
        // the trailing CRC in a single continuous keystream.
        if self.rc4 {
            image = rc4_crypt(&image);
        }

        Ok(image)
    }

    /// Assemble and write the image to `output` (atomically).
    pub fn pack(&self, output: &Path) -> Result<()> {
        let image = self.assemble()?;
        write_atomic(output, &image)
    }

    fn build_header(&self, code471_num: u8, loader_num: u8) -> Result<BootHeader> {
        let (major, minor) = self.config.version;
        let version = ((bcd(major) as u32) << 8) | bcd(minor) as u32;

        let code471_offset = HEADER_SIZE as u32;
        let code472_offset = code471_offset + code471_num as u32 * ENTRY_SIZE as u32;
        let loader_offset = code472_offset; // CODE472 group is empty

        Ok(BootHeader {
            tag: TAG_BOOT,
            size: HEADER_SIZE as u16,
            version,
            merger_version: MERGER_VERSION,
            release_time: self.release_time.unwrap_or_else(ReleaseTime::now),
            chip_type: chip_type(&self.config.chip_name)?,
            code471_num,
            code471_offset,
            code471_size: ENTRY_SIZE as u8,
            code472_num: 0,
            code472_offset,
            code472_size: ENTRY_SIZE as u8,
            loader_num,
            loader_offset,
            loader_size: ENTRY_SIZE as u8,
            sign_flag: 0,
            rc4_flag: if self.rc4 { 0 } else { 1 },
        })
    }
}

/// Result of unpacking an ID-block image
#[derive(Debug)]
pub struct IdBlockUnpack {
    pub header: BootHeader,
    pub entries: Vec<BootEntry>,
    /// Extracted payload files, one per entry
    pub files: Vec<PathBuf>,
    /// Non-fatal integrity findings (extraction still completed)
    pub warnings: Vec<String>,
}

/// Unpack an ID-block image, writing each payload to `<name>.bin` under
/// `out_dir`. Payloads are decrypted when the header says RC4 is active.
pub fn unpack(image_path: &Path, out_dir: &Path) -> Result<IdBlockUnpack> {
    check_inputs_exist([image_path])?;
    let data = std::fs::read(image_path)?;
    let header = BootHeader::from_bytes(&data)?;

    let mut entries = Vec::with_capacity(header.entry_count());
    let mut offset = HEADER_SIZE;
    for _ in 0..header.entry_count() {
        if data.len() < offset + ENTRY_SIZE {
            return Err(RkImageError::truncated("ID-block entry", data.len() - offset, ENTRY_SIZE));
        }
        entries.push(BootEntry::from_bytes(&data[offset..offset + ENTRY_SIZE])?);
        offset += ENTRY_SIZE;
    }

    let mut warnings = Vec::new();
    if !header.rc4_enabled() && data.len() >= 4 {
        let (body, tail) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if !verify_crc32(body, stored) {
            warnings.push(format!(
                "image CRC mismatch: stored 0x{stored:08x}, calculated 0x{:08x}",
                calculate_crc32(body)
            ));
        }
    }

    std::fs::create_dir_all(out_dir)?;
    let mut files = Vec::with_capacity(entries.len());
    for entry in &entries {
        let start = entry.data_offset as usize;
        let end = start + entry.data_size as usize;
        if data.len() < end {
            return Err(RkImageError::format(format!(
                "entry {:?} points past end of image (offset 0x{:x}, size {})",
                entry.name_string(),
                entry.data_offset,
                entry.data_size
            )));
        }
        let mut payload = data[start..end].to_vec();
        if header.rc4_enabled() {
            payload = match entry.kind {
                EntryKind::Loader => rc4_crypt_blocks(&payload, RC4_BLOCK_SIZE),
                _ => rc4_crypt(&payload),
            };
        }
        let out_file = out_dir.join(format!("{}.bin", entry.name_string()));
        std::fs::write(&out_file, payload)?;
        files.push(out_file);
    }

    Ok(IdBlockUnpack {
        header,
        entries,
        files,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time() -> ReleaseTime {
        ReleaseTime {
            year: 2025,
            month: 6,
            day: 1,
            hour: 12,
            minute: 0,
            second: 0,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = BootHeader {
            tag: TAG_BOOT,
            size: HEADER_SIZE as u16,
            version: 0x0258,
            merger_version: MERGER_VERSION,
            release_time: test_time(),
            chip_type: 0x33333939,
            code471_num: 1,
            code471_offset: 102,
            code471_size: 54,
            code472_num: 0,
            code472_offset: 156,
            code472_size: 54,
            loader_num: 1,
            loader_offset: 156,
            loader_size: 54,
            sign_flag: 0,
            rc4_flag: 1,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = BootHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_bad_magic() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0] = 0xFF;
        assert!(BootHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_header_truncated() {
        let err = BootHeader::from_bytes(&[0u8; 50]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = BootEntry::new(EntryKind::Loader, "rk3399_miniloader_v1", 156, 2048);
        let bytes = entry.to_bytes().unwrap();
        assert_eq!(bytes.len(), ENTRY_SIZE);
        let parsed = BootEntry::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.name_string(), "rk3399_miniloader_v1");
    }

    #[test]
    fn test_wide_name_truncates() {
        let entry = BootEntry::new(EntryKind::DdrInit, "a_very_long_ddr_binary_file_name", 0, 0);
        assert_eq!(entry.name_string().len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_bcd() {
        assert_eq!(bcd(25), 0x25);
        assert_eq!(bcd(58), 0x58);
        assert_eq!(bcd(0), 0x00);
        assert_eq!(bcd(125), 0x25); // wraps modulo 100
    }

    #[test]
    fn test_chip_type_derived() {
        assert_eq!(chip_type("RK3399").unwrap(), 0x33333939);
        assert_eq!(chip_type("RK330C").unwrap(), 0x33333043);
        assert_eq!(chip_type("RK3588").unwrap(), 0x33353838);
    }

    #[test]
    fn test_chip_type_legacy() {
        assert_eq!(chip_type("RK32").unwrap(), 0x80);
        assert_eq!(chip_type("RKNANO").unwrap(), 0x30);
    }

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(1000, EntryKind::DdrInit), 2048);
        assert_eq!(aligned_size(2048, EntryKind::DdrInit), 2048);
        assert_eq!(aligned_size(2049, EntryKind::DdrInit), 4096);
        // Loader payloads take the 512-byte stage first.
        assert_eq!(aligned_size(1000, EntryKind::Loader), 2048);
        assert_eq!(aligned_size(0, EntryKind::Loader), 0);
    }
}
