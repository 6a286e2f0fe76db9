//! Command line interface for rkimage

use crate::VERSION;
use crate::config::{BootConfig, TrustConfig};
use crate::error::Result;
use crate::loader::{self, LoaderType, PackOptions};
use crate::sdmmc::{self, SdmmcChip};
use crate::trust::{self, RsaMode, ShaMode, TrustImage};
use crate::idblock::{self, IdBlockImage};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Command line arguments for rkimage
#[derive(Parser, Debug)]
#[command(name = "rkimage")]
#[command(version = VERSION)]
#[command(about = "Rockchip boot image packing and unpacking tool", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode - only output errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// ID-block images (idbloader.img / loader.bin)
    #[command(subcommand)]
    Idblock(IdblockCommands),
    /// Second-stage loader wrappers (uboot.img / trust.img wrapper)
    #[command(subcommand)]
    Loader(LoaderCommands),
    /// SD/MMC boot images (rksd layout)
    #[command(subcommand)]
    Sdmmc(SdmmcCommands),
    /// Trust images (BL31/BL32 merge)
    #[command(subcommand)]
    Trust(TrustCommands),
}

#[derive(Subcommand, Debug)]
pub enum IdblockCommands {
    /// Pack DDR-init and mini-loader binaries into an ID-block image
    Pack(IdblockPackArgs),
    /// Extract every payload of an ID-block image
    Unpack(IdblockUnpackArgs),
}

#[derive(Parser, Debug)]
pub struct IdblockPackArgs {
    /// RKBOOT INI configuration file
    pub config: PathBuf,

    /// Output image file (overrides the configured path)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// RC4-encrypt the whole image
    #[arg(long)]
    pub rc4: bool,
}

#[derive(Parser, Debug)]
pub struct IdblockUnpackArgs {
    /// Image file to unpack
    pub image: PathBuf,

    /// Output directory for the extracted payloads
    #[arg(short, long, default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum LoaderCommands {
    /// Wrap a payload into a redundant loader image
    Pack(LoaderPackArgs),
    /// Extract the payload of a loader image
    Unpack(LoaderUnpackArgs),
    /// Show the header of a loader image
    Info(LoaderInfoArgs),
}

#[derive(Parser, Debug)]
pub struct LoaderPackArgs {
    /// Payload file to wrap
    pub input: PathBuf,

    /// Output image file
    pub output: PathBuf,

    /// Image type, selecting magic and default load address
    #[arg(short = 'T', long, value_enum, default_value = "uboot")]
    pub image_type: LoaderTypeArg,

    /// Load address (hexadecimal)
    #[arg(short = 'a', long, value_parser = parse_hex_u32)]
    pub load_address: Option<u32>,

    /// Version stamp bound into the image hash
    #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
    pub image_version: u32,
}

#[derive(Parser, Debug)]
pub struct LoaderUnpackArgs {
    /// Image file to unpack
    pub image: PathBuf,

    /// Output payload file
    #[arg(short, long, default_value = "payload.bin")]
    pub output: PathBuf,
}

#[derive(Parser, Debug)]
pub struct LoaderInfoArgs {
    /// Image file to examine
    pub image: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum SdmmcCommands {
    /// Create an SD/MMC boot image from an SPL binary
    Create(SdmmcCreateArgs),
    /// Append a file (mini-loader) to an existing image
    Append(SdmmcAppendArgs),
    /// Decrypt and show the header of an existing image
    Verify(SdmmcVerifyArgs),
}

#[derive(Parser, Debug)]
pub struct SdmmcCreateArgs {
    /// SPL binary (DDR init + mini-loader, carries its own chip magic)
    pub spl: PathBuf,

    /// Output image file
    pub output: PathBuf,

    /// Chip name
    #[arg(short = 'n', long, default_value = "rk3399")]
    pub chip: SdmmcChip,

    /// Room reserved for the next boot stage, in bytes
    #[arg(long, value_parser = parse_hex_u32, default_value = "0x80000")]
    pub max_boot_size: u32,
}

#[derive(Parser, Debug)]
pub struct SdmmcAppendArgs {
    /// Existing image file
    pub image: PathBuf,

    /// File to append
    pub file: PathBuf,
}

#[derive(Parser, Debug)]
pub struct SdmmcVerifyArgs {
    /// Image file to verify
    pub image: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum TrustCommands {
    /// Merge BL31/BL32 into a trust image
    Pack(TrustPackArgs),
    /// Extract every component of a trust image
    Unpack(TrustUnpackArgs),
}

#[derive(Parser, Debug)]
pub struct TrustPackArgs {
    /// RKTRUST INI configuration file
    pub config: PathBuf,

    /// Output image file (overrides the configured path)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// RSA mode: 0=none, 1=RSA-1024, 2=RSA-2048, 3=PSS, 4=PSS alternative
    #[arg(long, default_value = "2")]
    pub rsa: u8,

    /// SHA mode: 0=none, 1=SHA1, 2=SHA256 big-endian, 3=SHA256
    #[arg(long, default_value = "3")]
    pub sha: u8,
}

#[derive(Parser, Debug)]
pub struct TrustUnpackArgs {
    /// Image file to unpack
    pub image: PathBuf,

    /// Output directory for the extracted components
    #[arg(short, long, default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum LoaderTypeArg {
    Uboot,
    Trust,
}

impl From<LoaderTypeArg> for LoaderType {
    fn from(arg: LoaderTypeArg) -> Self {
        match arg {
            LoaderTypeArg::Uboot => Self::Uboot,
            LoaderTypeArg::Trust => Self::Tos,
        }
    }
}

/// Parse hexadecimal or decimal string to u32
fn parse_hex_u32(s: &str) -> std::result::Result<u32, std::num::ParseIntError> {
    if s.starts_with("0x") || s.starts_with("0X") {
        u32::from_str_radix(&s[2..], 16)
    } else {
        s.parse::<u32>()
    }
}

/// Main CLI handler
pub fn run_cli(args: Args) -> Result<()> {
    let verbose = args.verbose && !args.quiet;
    let quiet = args.quiet;

    match args.command {
        Commands::Idblock(IdblockCommands::Pack(pack_args)) => {
            handle_idblock_pack(pack_args, verbose, quiet)
        }
        Commands::Idblock(IdblockCommands::Unpack(unpack_args)) => {
            handle_idblock_unpack(unpack_args, verbose, quiet)
        }
        Commands::Loader(LoaderCommands::Pack(pack_args)) => {
            handle_loader_pack(pack_args, verbose, quiet)
        }
        Commands::Loader(LoaderCommands::Unpack(unpack_args)) => {
            handle_loader_unpack(unpack_args, verbose, quiet)
        }
        Commands::Loader(LoaderCommands::Info(info_args)) => handle_loader_info(info_args),
        Commands::Sdmmc(SdmmcCommands::Create(create_args)) => {
            handle_sdmmc_create(create_args, verbose, quiet)
        }
        Commands::Sdmmc(SdmmcCommands::Append(append_args)) => {
            handle_sdmmc_append(append_args, quiet)
        }
        Commands::Sdmmc(SdmmcCommands::Verify(verify_args)) => handle_sdmmc_verify(verify_args),
        Commands::Trust(TrustCommands::Pack(pack_args)) => {
            handle_trust_pack(pack_args, verbose, quiet)
        }
        Commands::Trust(TrustCommands::Unpack(unpack_args)) => {
            handle_trust_unpack(unpack_args, verbose, quiet)
        }
    }
}

fn handle_idblock_pack(args: IdblockPackArgs, verbose: bool, quiet: bool) -> Result<()> {
    if verbose {
        eprintln!("Reading configuration: {}", args.config.display());
    }
    let config = BootConfig::from_file(&args.config)?;
    let output = args.output.clone().unwrap_or_else(|| config.output.clone());

    if verbose {
        eprintln!("Chip: {}", config.chip_name);
        eprintln!(
            "Entries: {} DDR init, {} loader",
            config.ddr_bins.len(),
            config.loader_bins.len()
        );
    }

    IdBlockImage::new(config).enable_rc4(args.rc4).pack(&output)?;

    if !quiet {
        eprintln!("Image created successfully: {}", output.display());
        eprintln!("Image size: {} bytes", std::fs::metadata(&output)?.len());
    }
    Ok(())
}

fn handle_idblock_unpack(args: IdblockUnpackArgs, verbose: bool, quiet: bool) -> Result<()> {
    if verbose {
        eprintln!("Reading image: {}", args.image.display());
    }
    let report = idblock::unpack(&args.image, &args.out_dir)?;

    for warning in &report.warnings {
        eprintln!("Warning: {warning}");
    }
    if !quiet {
        println!("Chip type: 0x{:08x}", report.header.chip_type);
        println!("Version: 0x{:04x}", report.header.version);
        println!("RC4: {}", if report.header.rc4_enabled() { "enabled" } else { "disabled" });
        for (entry, file) in report.entries.iter().zip(&report.files) {
            println!(
                "  {:?} {} ({} bytes) -> {}",
                entry.kind,
                entry.name_string(),
                entry.data_size,
                file.display()
            );
        }
    }
    Ok(())
}

fn handle_loader_pack(args: LoaderPackArgs, verbose: bool, quiet: bool) -> Result<()> {
    let mut opts = match args.image_type {
        LoaderTypeArg::Uboot => PackOptions::uboot(),
        LoaderTypeArg::Trust => PackOptions::trust(),
    };
    if let Some(addr) = args.load_address {
        opts = opts.load_addr(addr);
    }
    opts = opts.version(args.image_version);

    if verbose {
        eprintln!(
            "Wrapping {} as {} at 0x{:08x}",
            args.input.display(),
            LoaderType::from(args.image_type).name(),
            opts.load_addr
        );
    }

    loader::pack(&args.input, &args.output, &opts)?;

    if !quiet {
        eprintln!("Image created successfully: {}", args.output.display());
        eprintln!("Image size: {} bytes", std::fs::metadata(&args.output)?.len());
    }
    Ok(())
}

fn handle_loader_unpack(args: LoaderUnpackArgs, verbose: bool, quiet: bool) -> Result<()> {
    if verbose {
        eprintln!("Reading image: {}", args.image.display());
    }
    let report = loader::unpack(&args.image, &args.output)?;

    for warning in &report.warnings {
        eprintln!("Warning: {warning}");
    }
    if !quiet {
        eprintln!(
            "Extracted {} bytes to {}",
            report.header.size,
            report.output.display()
        );
    }
    Ok(())
}

fn handle_loader_info(args: LoaderInfoArgs) -> Result<()> {
    let header = loader::info(&args.image)?;
    println!("Type: {}", header.loader_type.name());
    println!("Version: 0x{:08x}", header.version);
    println!("Load address: 0x{:08x}", header.load_addr);
    println!("Payload size: {} bytes", header.size);
    println!("Payload CRC32: 0x{:08x}", header.crc);
    Ok(())
}

fn handle_sdmmc_create(args: SdmmcCreateArgs, verbose: bool, quiet: bool) -> Result<()> {
    if verbose {
        eprintln!("Creating SD/MMC boot image for {}", args.chip);
    }
    let header = sdmmc::create(&args.spl, &args.output, args.chip, args.max_boot_size as u64)?;

    if !quiet {
        eprintln!("Image created successfully: {}", args.output.display());
        eprintln!(
            "init_size: {} blocks, init_boot_size: {} blocks",
            header.init_size, header.init_boot_size
        );
    }
    Ok(())
}

fn handle_sdmmc_append(args: SdmmcAppendArgs, quiet: bool) -> Result<()> {
    let appended = sdmmc::append(&args.image, &args.file)?;
    if !quiet {
        eprintln!("Appended {} bytes from {}", appended, args.file.display());
        eprintln!("New image size: {} bytes", std::fs::metadata(&args.image)?.len());
    }
    Ok(())
}

fn handle_sdmmc_verify(args: SdmmcVerifyArgs) -> Result<()> {
    let report = sdmmc::verify(&args.image)?;
    println!("Signature: 0x{:08x}", report.header.signature);
    println!(
        "Chip: {}",
        report
            .chip
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| format!("unknown ({:?})", String::from_utf8_lossy(&report.spl_magic)))
    );
    println!("init_offset: {} blocks", report.header.init_offset);
    println!("init_size: {} blocks", report.header.init_size);
    println!("init_boot_size: {} blocks", report.header.init_boot_size);
    println!("RC4: {}", if report.header.disable_rc4 == 0 { "enabled" } else { "disabled" });
    println!("File size: {} bytes", report.file_size);
    Ok(())
}

fn handle_trust_pack(args: TrustPackArgs, verbose: bool, quiet: bool) -> Result<()> {
    if verbose {
        eprintln!("Reading configuration: {}", args.config.display());
    }
    let config = TrustConfig::from_file(&args.config)?;
    let output = args.output.clone().unwrap_or_else(|| config.output.clone());

    TrustImage::new(config)
        .sha_mode(ShaMode::try_from(args.sha)?)
        .rsa_mode(RsaMode::try_from(args.rsa)?)
        .pack(&output)?;

    if !quiet {
        eprintln!("Image created successfully: {}", output.display());
        eprintln!("Image size: {} bytes", std::fs::metadata(&output)?.len());
    }
    Ok(())
}

fn handle_trust_unpack(args: TrustUnpackArgs, verbose: bool, quiet: bool) -> Result<()> {
    if verbose {
        eprintln!("Reading image: {}", args.image.display());
    }
    let report = trust::unpack(&args.image, &args.out_dir)?;

    if !quiet {
        println!("Version: 0x{:04x}", report.version);
        println!("Flags: SHA={}, RSA={}", report.sha_mode, report.rsa_mode);
        for comp in &report.components {
            println!(
                "  {} @ 0x{:08x} ({} bytes) -> {}",
                comp.id,
                comp.load_addr,
                comp.size,
                comp.file.display()
            );
        }
    }
    Ok(())
}
