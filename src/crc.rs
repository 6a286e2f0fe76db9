//! CRC-32 checksum used by the Rockchip image formats
//!
//! Standard CRC-32 (IEEE 802.3, reflected, polynomial 0xEDB88320). The boot
//! ROM uses it both as the trailing checksum of ID-block images and as the
//! payload checksum inside the loader-wrapper header.

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = make_table();

/// Calculate the CRC-32 checksum of a byte slice
pub fn calculate_crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = CRC_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

/// Check a CRC-32 value against the checksum of `data`.
///
/// A mismatch is never fatal to unpacking; callers report it as a warning
/// and keep extracting.
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    calculate_crc32(data) == expected
}
