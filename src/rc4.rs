//! RC4 stream cipher with the fixed Rockchip key
//!
//! The boot ROM expects certain image regions to be RC4-encrypted with a
//! hardcoded 16-byte key. This is NOT cryptographically meaningful (the key
//! is public and RC4 is broken); the cipher exists purely for byte-for-byte
//! compatibility with the vendor tools and boot ROM.
//!
//! Two modes are used by the formats:
//! - [`rc4_crypt`]: one continuous keystream over the whole buffer (header0
//!   of the SD/MMC format, whole-image ID-block encryption, DDR-init/plug
//!   payloads on unpack).
//! - [`rc4_crypt_blocks`]: the keystream is re-derived for every block
//!   (default 512 bytes), as required for loader payload regions.
//!
//! RC4 is an involution: applying the same function twice restores the input.

/// The fixed 16-byte key hardcoded in the vendor tools
pub const RC4_KEY: [u8; 16] = [
    124, 78, 3, 4, 85, 5, 9, 7, 45, 44, 123, 56, 23, 13, 23, 17,
];

/// Block size for per-block re-initialized encryption
pub const RC4_BLOCK_SIZE: usize = 512;

/// Key-scheduling: build the initial S-box permutation for `key`.
fn key_schedule(key: &[u8]) -> [u8; 256] {
    let mut s = [0u8; 256];
    for (i, slot) in s.iter_mut().enumerate() {
        *slot = i as u8;
    }
    let mut j = 0usize;
    for i in 0..256 {
        j = (j + s[i] as usize + key[i % key.len()] as usize) % 256;
        s.swap(i, j);
    }
    s
}

/// Encrypt or decrypt `data` with an arbitrary key.
///
/// Fresh cipher state is derived on every call; this is not a running
/// stream across invocations.
pub fn rc4_crypt_with_key(data: &[u8], key: &[u8]) -> Vec<u8> {
    let mut s = key_schedule(key);
    let mut out = Vec::with_capacity(data.len());
    let (mut i, mut j) = (0usize, 0usize);
    for &byte in data {
        i = (i + 1) % 256;
        j = (j + s[i] as usize) % 256;
        s.swap(i, j);
        let t = (s[i] as usize + s[j] as usize) % 256;
        out.push(byte ^ s[t]);
    }
    out
}

/// Encrypt or decrypt `data` with the fixed Rockchip key
pub fn rc4_crypt(data: &[u8]) -> Vec<u8> {
    rc4_crypt_with_key(data, &RC4_KEY)
}

/// Encrypt or decrypt `data` in `block_size` chunks, re-initializing the
/// cipher state for every chunk. The last chunk may be shorter.
pub fn rc4_crypt_blocks(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(block_size) {
        out.extend_from_slice(&rc4_crypt(chunk));
    }
    out
}
