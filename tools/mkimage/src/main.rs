mod crc32;
mod exfat;
mod fat16;
mod gpt;
mod iso9660;
mod layout;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

const DEFAULT_IMAGE_SIZE_MIB: u64 = 64;
const DEFAULT_FS_START_SECTOR: u64 = 8192;

#[derive(Parser)]
#[clap(name = "mkimage", version, about = "Write bootable BIOS, UEFI, or ISO disk images")]
#[clap(group = clap::ArgGroup::new("mode").required(true).args(&["bios", "uefi", "iso"]))]
struct Cli {
    /// Build a BIOS/MBR hard-disk image.
    #[clap(long)]
    bios: bool,
    /// Build a GPT/UEFI hard-disk image.
    #[clap(long)]
    uefi: bool,
    /// Build an El Torito-bootable ISO-9660 image.
    #[clap(long)]
    iso: bool,

    /// First-stage bootloader, required for --bios and --iso.
    #[clap(long)]
    stage1: Option<PathBuf>,
    /// Second-stage bootloader, required for --bios and --iso.
    #[clap(long)]
    stage2: Option<PathBuf>,
    /// Kernel flat binary.
    #[clap(long)]
    kernel: Option<PathBuf>,
    /// UEFI application, required for --uefi.
    #[clap(long)]
    bootloader: Option<PathBuf>,

    #[clap(long)]
    output: PathBuf,
    /// Directory tree to populate the data partition / root directory from.
    #[clap(long)]
    sysroot: Option<PathBuf>,
    /// Total image size in MiB (--bios/--uefi only).
    #[clap(long = "image-size")]
    image_size: Option<u64>,
    /// First sector of the exFAT partition (--bios only).
    #[clap(long = "fs-start")]
    fs_start: Option<u64>,
    /// Force a full reformat instead of an incremental exFAT update.
    #[clap(long)]
    reset: bool,
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("{} {e:#}", "mkimage: error:".red().bold());
        std::process::exit(1);
    }
}

fn read_required(path: &Option<PathBuf>, what: &str) -> Result<Vec<u8>> {
    let path = path.as_ref().with_context(|| format!("--{what} is required for this mode"))?;
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn read_optional(path: &Option<PathBuf>) -> Result<Option<Vec<u8>>> {
    path.as_ref().map(|p| std::fs::read(p).with_context(|| format!("reading {}", p.display()))).transpose()
}

fn run(cli: Cli) -> Result<()> {
    let image_size = cli.image_size.unwrap_or(DEFAULT_IMAGE_SIZE_MIB) * 1024 * 1024;
    let fs_start = cli.fs_start.unwrap_or(DEFAULT_FS_START_SECTOR);
    let sysroot = cli.sysroot.as_deref();

    let layout = if cli.bios {
        let stage1 = read_required(&cli.stage1, "stage1")?;
        let stage2 = read_required(&cli.stage2, "stage2")?;
        let kernel = read_optional(&cli.kernel)?.unwrap_or_default();
        Some(layout::build_bios(&stage1, &stage2, &kernel, sysroot, image_size, fs_start)?)
    } else if cli.uefi {
        let bootloader = read_required(&cli.bootloader, "bootloader")?;
        let kernel = read_optional(&cli.kernel)?;
        Some(layout::build_uefi(&bootloader, kernel.as_deref(), sysroot, image_size)?)
    } else if cli.iso {
        let stage1 = read_required(&cli.stage1, "stage1")?;
        let stage2 = read_required(&cli.stage2, "stage2")?;
        let image = layout::build_iso(&stage1, &stage2, sysroot)?;
        std::fs::write(&cli.output, &image).with_context(|| format!("writing {}", cli.output.display()))?;
        return Ok(());
    } else {
        unreachable!("clap enforces exactly one of --bios/--uefi/--iso");
    };

    let layout = layout.expect("BIOS/UEFI branch always produces a layout");

    let reuse_existing = !cli.reset
        && cli.output.exists()
        && std::fs::metadata(&cli.output).map(|m| m.len() == layout.image.len() as u64).unwrap_or(false);

    if reuse_existing {
        let mut existing = std::fs::read(&cli.output).with_context(|| format!("reading {}", cli.output.display()))?;
        let region = layout.exfat_region.clone();
        existing[..region.start].copy_from_slice(&layout.image[..region.start]);
        existing[region.end..].copy_from_slice(&layout.image[region.end..]);
        match sysroot {
            Some(sysroot) => exfat::incremental_update(&mut existing[region.clone()], sysroot)
                .context("incremental exFAT update")?,
            None => existing[region.clone()].copy_from_slice(&layout.image[region]),
        }
        std::fs::write(&cli.output, &existing).with_context(|| format!("writing {}", cli.output.display()))?;
    } else {
        std::fs::write(&cli.output, &layout.image).with_context(|| format!("writing {}", cli.output.display()))?;
    }

    Ok(())
}
