//! Integration tests for rkimage

use rkimage::config::{BinaryEntry, BootConfig, TrustConfig};
use rkimage::crc::calculate_crc32;
use rkimage::idblock::{self, EntryKind, IdBlockImage, ReleaseTime};
use rkimage::loader::{self, LoaderType, PackOptions};
use rkimage::sdmmc::{self, SdmmcChip};
use rkimage::trust::{self, TrustImage};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn boot_config(dir: &Path, ddr_size: usize, loader_size: usize) -> BootConfig {
    let ddr = dir.join("rk3399_ddr.bin");
    let mini = dir.join("rk3399_miniloader.bin");
    fs::write(&ddr, vec![0xD0u8; ddr_size]).unwrap();
    fs::write(&mini, vec![0x1Du8; loader_size]).unwrap();

    BootConfig {
        chip_name: "RK330C".into(),
        version: (2, 58),
        ddr_bins: vec![BinaryEntry::new(ddr)],
        loader_bins: vec![BinaryEntry::new(mini)],
        output: dir.join("loader.bin"),
    }
}

fn fixed_time() -> ReleaseTime {
    ReleaseTime {
        year: 2025,
        month: 1,
        day: 2,
        hour: 3,
        minute: 4,
        second: 5,
    }
}

/// 1000-byte DDR init and 1000-byte loader payloads: both entries align to
/// 2048 bytes and the file carries a trailing CRC over everything before it.
#[test]
fn test_idblock_layout() {
    let dir = TempDir::new().unwrap();
    let config = boot_config(dir.path(), 1000, 1000);
    let output = config.output.clone();

    IdBlockImage::new(config)
        .release_time(fixed_time())
        .pack(&output)
        .unwrap();

    let image = fs::read(&output).unwrap();
    // header + 2 entries + 2 aligned payloads + CRC
    assert_eq!(image.len(), 102 + 2 * 54 + 2 * 2048 + 4);

    let (body, tail) = image.split_at(image.len() - 4);
    let stored = u32::from_le_bytes(tail.try_into().unwrap());
    assert_eq!(stored, calculate_crc32(body));

    let out_dir = dir.path().join("unpacked");
    let report = idblock::unpack(&output, &out_dir).unwrap();
    assert!(report.warnings.is_empty());
    assert_eq!(report.header.code471_num, 1);
    assert_eq!(report.header.code472_num, 0);
    assert_eq!(report.header.loader_num, 1);
    assert_eq!(report.header.version, 0x0258); // BCD 2.58
    assert_eq!(report.header.rc4_flag, 1);

    assert_eq!(report.entries[0].kind, EntryKind::DdrInit);
    assert_eq!(report.entries[0].data_size, 2048);
    assert_eq!(report.entries[0].name_string(), "rk3399_ddr");
    assert_eq!(report.entries[1].kind, EntryKind::Loader);
    assert_eq!(report.entries[1].data_size, 2048);

    // Extracted payloads carry the original bytes plus alignment padding.
    let ddr = fs::read(&report.files[0]).unwrap();
    assert_eq!(&ddr[..1000], &vec![0xD0u8; 1000][..]);
    assert!(ddr[1000..].iter().all(|&b| b == 0));
}

/// Packing is deterministic once the release time is pinned.
#[test]
fn test_idblock_deterministic() {
    let dir = TempDir::new().unwrap();
    let config = boot_config(dir.path(), 500, 700);

    let a = IdBlockImage::new(config.clone())
        .release_time(fixed_time())
        .assemble()
        .unwrap();
    let b = IdBlockImage::new(config)
        .release_time(fixed_time())
        .assemble()
        .unwrap();
    assert_eq!(a, b);
}

/// Whole-image RC4: nothing in the output is recognizable until decrypted.
#[test]
fn test_idblock_rc4_encrypts_everything() {
    let dir = TempDir::new().unwrap();
    let config = boot_config(dir.path(), 100, 100);

    let plain = IdBlockImage::new(config.clone())
        .release_time(fixed_time())
        .assemble()
        .unwrap();
    let encrypted = IdBlockImage::new(config)
        .release_time(fixed_time())
        .enable_rc4(true)
        .assemble()
        .unwrap();

    assert_eq!(plain.len(), encrypted.len());
    assert_ne!(&plain[..4], &encrypted[..4]);
    let mut decrypted = rkimage::rc4::rc4_crypt(&encrypted);
    // The only difference after decryption is the rc4 flag and therefore
    // the trailing CRC.
    assert_ne!(decrypted, plain);
    decrypted.truncate(4);
    assert_eq!(&decrypted[..], b"BOOT");
}

/// Missing inputs are all reported at once, before anything is written.
#[test]
fn test_idblock_missing_inputs_enumerated() {
    let dir = TempDir::new().unwrap();
    let config = BootConfig {
        chip_name: "RK3399".into(),
        version: (1, 0),
        ddr_bins: vec![BinaryEntry::new(dir.path().join("no_ddr.bin"))],
        loader_bins: vec![BinaryEntry::new(dir.path().join("no_loader.bin"))],
        output: dir.path().join("loader.bin"),
    };
    let output = config.output.clone();

    let err = IdBlockImage::new(config).pack(&output).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("no_ddr.bin"));
    assert!(msg.contains("no_loader.bin"));
    assert!(!output.exists());
}

/// A 1024-byte payload at 0x200000 with the defaults: 4 MiB output, header
/// fields and CRC exactly as the boot ROM expects.
#[test]
fn test_loader_wrapper_scenario() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("u-boot.bin");
    let output = dir.path().join("uboot.img");
    fs::write(&input, vec![0u8; 1024]).unwrap();

    loader::pack(&input, &output, &PackOptions::uboot()).unwrap();

    let image = fs::read(&output).unwrap();
    assert_eq!(image.len(), 4 * 1024 * 1024);

    let header = loader::info(&output).unwrap();
    assert_eq!(header.loader_type, LoaderType::Uboot);
    assert_eq!(header.version, 0);
    assert_eq!(header.load_addr, 0x200000);
    assert_eq!(header.size, 1024);
    assert_eq!(header.crc, calculate_crc32(&vec![0u8; 1024]));
}

#[test]
fn test_loader_roundtrip() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("tee.bin");
    let output = dir.path().join("trust.img");
    let extracted = dir.path().join("tee.out");
    let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    fs::write(&input, &payload).unwrap();

    loader::pack(&input, &output, &PackOptions::trust()).unwrap();
    let report = loader::unpack(&output, &extracted).unwrap();

    assert!(report.warnings.is_empty());
    assert_eq!(report.header.load_addr, 0x8400000);
    assert_eq!(fs::read(&extracted).unwrap(), payload);
}

/// Corrupting the payload surfaces a CRC warning but extraction continues.
#[test]
fn test_loader_corrupt_payload_warns() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("u-boot.bin");
    let output = dir.path().join("uboot.img");
    let extracted = dir.path().join("payload.bin");
    fs::write(&input, vec![0x77u8; 256]).unwrap();

    loader::pack(&input, &output, &PackOptions::uboot()).unwrap();
    let mut image = fs::read(&output).unwrap();
    image[2048] ^= 0xFF;
    fs::write(&output, &image).unwrap();

    let report = loader::unpack(&output, &extracted).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("CRC mismatch"));
    assert!(extracted.exists());
}

/// An 8192-byte SPL for rk3399 fills exactly 16 blocks; the decrypted
/// header0 signature matches the boot ROM constant.
#[test]
fn test_sdmmc_scenario() {
    let dir = TempDir::new().unwrap();
    let spl = dir.path().join("spl.bin");
    let output = dir.path().join("boot.img");
    let mut payload = b"RK33".to_vec();
    payload.resize(8192, 0x33);
    fs::write(&spl, &payload).unwrap();

    let header = sdmmc::create(&spl, &output, SdmmcChip::Rk3399, 512 * 1024).unwrap();
    assert_eq!(header.init_size, 16);

    let report = sdmmc::verify(&output).unwrap();
    assert_eq!(report.header.signature, 0x0FF0AA55);
    assert_eq!(report.spl_magic, *b"RK33");
    // RK33 is shared by rk3308/rk3368/rk3399/px30; verify reports the first
    // family in the table that owns the magic.
    assert_eq!(report.chip, Some(SdmmcChip::Rk3308));
}

/// create + append, the usual idbloader.img flow.
#[test]
fn test_sdmmc_append_flow() {
    let dir = TempDir::new().unwrap();
    let spl = dir.path().join("ddr.bin");
    let mini = dir.path().join("miniloader.bin");
    let output = dir.path().join("idbloader.img");

    let mut ddr = b"RK33".to_vec();
    ddr.resize(4000, 0x44);
    fs::write(&spl, &ddr).unwrap();
    fs::write(&mini, vec![0x55u8; 1234]).unwrap();

    sdmmc::create(&spl, &output, SdmmcChip::Rk3399, 512 * 1024).unwrap();
    let before = fs::metadata(&output).unwrap().len();
    sdmmc::append(&output, &mini).unwrap();
    assert_eq!(fs::metadata(&output).unwrap().len(), before + 1234);

    let image = fs::read(&output).unwrap();
    assert_eq!(&image[before as usize..], &vec![0x55u8; 1234][..]);
}

/// A raw 4096-byte BL31 becomes a single component in a 4 MiB two-copy file.
#[test]
fn test_trust_scenario() {
    let dir = TempDir::new().unwrap();
    let bl31 = dir.path().join("bl31.bin");
    let output = dir.path().join("trust.img");
    fs::write(&bl31, vec![0xB1u8; 4096]).unwrap();

    let config = TrustConfig {
        version: (1, 0),
        bl31: Some(BinaryEntry::with_address(bl31, 0x40000)),
        bl32: None,
        output: output.clone(),
    };
    TrustImage::new(config).pack(&output).unwrap();

    let image = fs::read(&output).unwrap();
    assert_eq!(image.len(), 4 * 1024 * 1024);
    assert_eq!(&image[..4], b"BL3X");
    let size_field = u32::from_le_bytes(image[12..16].try_into().unwrap());
    assert_eq!(size_field >> 16, 1);

    let out_dir = dir.path().join("unpacked");
    let report = trust::unpack(&output, &out_dir).unwrap();
    assert_eq!(report.components.len(), 1);
    assert_eq!(report.components[0].id, "BL31");
    assert_eq!(report.components[0].load_addr, 0x40000);
    let extracted = fs::read(&report.components[0].file).unwrap();
    assert_eq!(&extracted[..4096], &vec![0xB1u8; 4096][..]);
}

/// End-to-end from an RKBOOT INI file on disk.
#[test]
fn test_idblock_from_ini() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("bin")).unwrap();
    fs::write(dir.path().join("bin/ddr.bin"), vec![0xAAu8; 300]).unwrap();
    fs::write(dir.path().join("bin/mini.bin"), vec![0xBBu8; 600]).unwrap();

    let ini = dir.path().join("RK3399MINIALL.ini");
    fs::write(
        &ini,
        "[CHIP_NAME]\nNAME=RK330C\n\n[VERSION]\nMAJOR=1\nMINOR=2\n\n\
         [CODE471_OPTION]\nNUM=1\nPath1=bin/ddr.bin\n\n\
         [CODE472_OPTION]\nNUM=1\nPath1=bin/mini.bin\n\n\
         [OUTPUT]\nPATH=loader.bin\n",
    )
    .unwrap();

    let config = BootConfig::from_file(&ini).unwrap();
    assert_eq!(config.chip_name, "RK330C");
    let output = dir.path().join(&config.output);

    IdBlockImage::new(config).pack(&output).unwrap();
    let report = idblock::unpack(&output, &dir.path().join("out")).unwrap();
    assert_eq!(report.entries.len(), 2);
}
