//! ELF PT_LOAD segment extraction for trust-image payloads
//!
//! BL31 is usually shipped as an ELF executable whose loadable segments are
//! packed as separate components; BL32 may be an ELF or a raw binary. Only
//! little-endian executable ELFs are accepted; anything that does not start
//! with the ELF magic is treated as a raw binary by the caller.

use object::{Object, ObjectKind, ObjectSegment};

use crate::error::{Result, RkImageError};

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// One PT_LOAD program-header segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    /// Offset of the segment data within the file
    pub offset: u64,
    /// Virtual load address
    pub vaddr: u64,
    /// Size of the segment in the file
    pub filesz: u64,
    /// Size of the segment in memory
    pub memsz: u64,
}

/// Check whether `data` starts with the ELF magic.
pub fn is_elf(data: &[u8]) -> bool {
    data.len() >= ELF_MAGIC.len() && data[..ELF_MAGIC.len()] == ELF_MAGIC
}

/// Extract every PT_LOAD segment from an ELF image.
///
/// The caller must have checked [`is_elf`] first; a file with a valid magic
/// that is big-endian or not an executable is a hard error, not a fallback
/// to raw-binary treatment.
pub fn load_segments(data: &[u8]) -> Result<Vec<LoadSegment>> {
    let file = object::File::parse(data)
        .map_err(|e| RkImageError::format(format!("ELF parse error: {e}")))?;

    if !file.is_little_endian() {
        return Err(RkImageError::format(
            "only little-endian ELF files are supported",
        ));
    }
    if file.kind() != ObjectKind::Executable {
        return Err(RkImageError::format(
            "only executable ELF files are supported",
        ));
    }

    // object yields exactly the PT_LOAD program headers here.
    let segments = file
        .segments()
        .map(|seg| {
            let (offset, filesz) = seg.file_range();
            LoadSegment {
                offset,
                vaddr: seg.address(),
                filesz,
                memsz: seg.size(),
            }
        })
        .collect();
    Ok(segments)
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Build a minimal little-endian 64-bit executable ELF with the given
    /// (vaddr, payload) PT_LOAD segments, for codec tests.
    pub fn build_elf64(segments: &[(u64, &[u8])]) -> Vec<u8> {
        let ehsize = 64usize;
        let phentsize = 56usize;
        let phnum = segments.len();
        let mut data_offset = ehsize + phentsize * phnum;

        let mut elf = vec![0u8; data_offset];
        // e_ident
        elf[0..4].copy_from_slice(&super::ELF_MAGIC);
        elf[4] = 2; // ELFCLASS64
        elf[5] = 1; // ELFDATA2LSB
        elf[6] = 1; // EV_CURRENT
        elf[16..18].copy_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
        elf[18..20].copy_from_slice(&183u16.to_le_bytes()); // e_machine = AArch64
        elf[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        elf[32..40].copy_from_slice(&(ehsize as u64).to_le_bytes()); // e_phoff
        elf[52..54].copy_from_slice(&(ehsize as u16).to_le_bytes()); // e_ehsize
        elf[54..56].copy_from_slice(&(phentsize as u16).to_le_bytes()); // e_phentsize
        elf[56..58].copy_from_slice(&(phnum as u16).to_le_bytes()); // e_phnum

        // Program headers
        for (i, (vaddr, payload)) in segments.iter().enumerate() {
            let ph = ehsize + i * phentsize;
            elf[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            elf[ph + 4..ph + 8].copy_from_slice(&5u32.to_le_bytes()); // R+X
            elf[ph + 8..ph + 16].copy_from_slice(&(data_offset as u64).to_le_bytes());
            elf[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes()); // p_vaddr
            elf[ph + 24..ph + 32].copy_from_slice(&vaddr.to_le_bytes()); // p_paddr
            elf[ph + 32..ph + 40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
            elf[ph + 40..ph + 48].copy_from_slice(&(payload.len() as u64).to_le_bytes());
            elf[ph + 48..ph + 56].copy_from_slice(&8u64.to_le_bytes()); // p_align
            data_offset += payload.len();
        }

        // Segment data
        for (_, payload) in segments {
            elf.extend_from_slice(payload);
        }
        elf
    }
}
