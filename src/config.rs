//! Build configuration for the image codecs
//!
//! The codecs consume a parsed configuration; in the full toolchain those
//! come from the vendor's `RKBOOT/*.ini` and `RKTRUST/*.ini` key/value files,
//! so a reader for exactly that format lives here too.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, RkImageError};

/// One binary payload referenced by a configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryEntry {
    /// Path to the binary file
    pub path: PathBuf,
    /// Load address for the payload
    pub address: u32,
}

impl BinaryEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            address: 0,
        }
    }

    pub fn with_address(path: impl Into<PathBuf>, address: u32) -> Self {
        Self {
            path: path.into(),
            address,
        }
    }
}

/// Configuration for packing an ID-block image (DDR init + mini-loader)
#[derive(Debug, Clone, Default)]
pub struct BootConfig {
    /// Chip name, e.g. "RK330C"
    pub chip_name: String,
    /// (major, minor) version, each 0..=99
    pub version: (u8, u8),
    /// DDR initialization binaries (CODE471 group)
    pub ddr_bins: Vec<BinaryEntry>,
    /// Mini-loader binaries (loader group)
    pub loader_bins: Vec<BinaryEntry>,
    /// Output image path
    pub output: PathBuf,
}

impl BootConfig {
    /// Parse an `RKBOOT/*.ini` configuration file.
    ///
    /// Relative binary paths are resolved against the INI file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_ini_str(&text, base)
    }

    /// Parse RKBOOT INI content, resolving relative paths against `base`.
    pub fn from_ini_str(text: &str, base: &Path) -> Result<Self> {
        let ini = IniDoc::parse(text);

        let chip_name = ini.get("CHIP_NAME", "NAME").unwrap_or_default().to_string();
        let version = ini.version()?;

        // CODE471 holds the DDR init blobs, CODE472 the mini-loader blobs.
        let ddr_bins = ini.numbered_paths("CODE471_OPTION", base)?;
        let loader_bins = ini.numbered_paths("CODE472_OPTION", base)?;

        let output = ini
            .get("OUTPUT", "PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("loader.bin"));

        Ok(Self {
            chip_name,
            version,
            ddr_bins,
            loader_bins,
            output,
        })
    }

    /// Check the packing invariants: at least one DDR-init entry and one
    /// mini-loader entry, and a chip name to derive the chip type from.
    pub fn validate(&self) -> Result<()> {
        if self.chip_name.is_empty() {
            return Err(RkImageError::config("missing chip name"));
        }
        if self.ddr_bins.is_empty() {
            return Err(RkImageError::config("no DDR init binaries configured"));
        }
        if self.loader_bins.is_empty() {
            return Err(RkImageError::config("no loader binaries configured"));
        }
        Ok(())
    }

    /// All binary paths referenced by this configuration, in pack order.
    pub fn input_paths(&self) -> impl Iterator<Item = &Path> {
        self.ddr_bins
            .iter()
            .chain(self.loader_bins.iter())
            .map(|e| e.path.as_path())
    }
}

/// Configuration for packing a trust image (BL31 + optional BL32)
#[derive(Debug, Clone, Default)]
pub struct TrustConfig {
    /// (major, minor) version, each 0..=99
    pub version: (u8, u8),
    /// ARM Trusted Firmware image (required for packing)
    pub bl31: Option<BinaryEntry>,
    /// Secure OS image (optional)
    pub bl32: Option<BinaryEntry>,
    /// Output image path
    pub output: PathBuf,
}

impl TrustConfig {
    /// Parse an `RKTRUST/*.ini` configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_ini_str(&text, base)
    }

    /// Parse RKTRUST INI content, resolving relative paths against `base`.
    pub fn from_ini_str(text: &str, base: &Path) -> Result<Self> {
        let ini = IniDoc::parse(text);

        let version = ini.version()?;
        let bl31 = ini.firmware_entry("BL31_OPTION", base)?;
        let bl32 = ini.firmware_entry("BL32_OPTION", base)?;

        let output = ini
            .get("OUTPUT", "PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("trust.img"));

        Ok(Self {
            version,
            bl31,
            bl32,
            output,
        })
    }

    /// Check the packing invariants: BL31 must be configured.
    pub fn validate(&self) -> Result<()> {
        if self.bl31.is_none() {
            return Err(RkImageError::config("BL31 entry is required"));
        }
        Ok(())
    }

    /// All binary paths referenced by this configuration.
    pub fn input_paths(&self) -> impl Iterator<Item = &Path> {
        self.bl31
            .iter()
            .chain(self.bl32.iter())
            .map(|e| e.path.as_path())
    }
}

/// Parse a load address that may be hex (`0x...`) or decimal.
pub fn parse_address(s: &str) -> Result<u32> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|_| RkImageError::config(format!("invalid address: {s:?}")))
}

/// Minimal reader for the vendor's INI dialect: `[SECTION]` lines followed by
/// `KEY=VALUE` lines; `#` and `;` start comments. The format is fixed by the
/// vendor tools, so nothing fancier is needed.
struct IniDoc {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniDoc {
    fn parse(text: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_string();
                sections.entry(current.clone()).or_default();
            } else if let Some((key, value)) = line.split_once('=') {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { sections }
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    fn version(&self) -> Result<(u8, u8)> {
        let major = self.parse_u8("VERSION", "MAJOR")?;
        let minor = self.parse_u8("VERSION", "MINOR")?;
        Ok((major, minor))
    }

    fn parse_u8(&self, section: &str, key: &str) -> Result<u8> {
        match self.get(section, key) {
            None => Ok(0),
            Some(v) => v
                .parse::<u8>()
                .map_err(|_| RkImageError::config(format!("invalid [{section}] {key}: {v:?}"))),
        }
    }

    /// Read a `NUM=` + `Path1..PathN=` section into binary entries.
    fn numbered_paths(&self, section: &str, base: &Path) -> Result<Vec<BinaryEntry>> {
        let Some(num_str) = self.get(section, "NUM") else {
            return Ok(Vec::new());
        };
        let num: usize = num_str
            .parse()
            .map_err(|_| RkImageError::config(format!("invalid [{section}] NUM: {num_str:?}")))?;
        let mut entries = Vec::with_capacity(num);
        for i in 1..=num {
            let key = format!("Path{i}");
            let Some(path) = self.get(section, &key) else {
                return Err(RkImageError::config(format!(
                    "[{section}] NUM={num} but {key} is missing"
                )));
            };
            entries.push(BinaryEntry::new(resolve(base, path)));
        }
        Ok(entries)
    }

    /// Read a `SEC=`/`PATH=`/`ADDR=` firmware section; `SEC=0` disables it.
    fn firmware_entry(&self, section: &str, base: &Path) -> Result<Option<BinaryEntry>> {
        if !self.sections.contains_key(section) {
            return Ok(None);
        }
        if self.get(section, "SEC").unwrap_or("0") == "0" {
            return Ok(None);
        }
        let Some(path) = self.get(section, "PATH") else {
            return Ok(None);
        };
        let address = match self.get(section, "ADDR") {
            Some(addr) => parse_address(addr)?,
            None => 0,
        };
        Ok(Some(BinaryEntry::with_address(
            resolve(base, path),
            address,
        )))
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() { p } else { base.join(p) }
}
