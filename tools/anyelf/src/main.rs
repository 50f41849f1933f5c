mod codec;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use goblin::elf::Elf;

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Bin,
    Pflat,
    Dlib,
    Kdrv,
}

#[derive(Parser)]
#[clap(name = "anyelf", version, about = "Translate an ELF64 image into a flat or custom-header binary format")]
struct Cli {
    #[clap(value_enum)]
    mode: Mode,
    input: PathBuf,
    output: PathBuf,
    /// pflat's physical base address (decimal or 0x-prefixed hex).
    #[clap(parse(try_from_str = parse_base))]
    base: Option<u64>,
    /// kdrv's exports symbol name, default `DRIVER_EXPORTS`.
    #[clap(long = "exports-symbol", value_name = "NAME")]
    exports_symbol: Option<String>,
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_base(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("{} {e:#}", "anyelf: error:".red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let bytes = std::fs::read(&cli.input).with_context(|| format!("reading {}", cli.input.display()))?;
    let elf = Elf::parse(&bytes).with_context(|| format!("{}: not a valid ELF", cli.input.display()))?;

    if cli.verbose {
        let name = match cli.mode {
            Mode::Bin => "bin",
            Mode::Pflat => "pflat",
            Mode::Dlib => "dlib",
            Mode::Kdrv => "kdrv",
        };
        eprintln!("anyelf: {name}: {} -> {}", cli.input.display(), cli.output.display());
    }

    let out = match cli.mode {
        Mode::Bin => codec::bin(&elf, &bytes)?,
        Mode::Pflat => {
            let base = cli.base.context("pflat mode requires a base address argument")?;
            codec::pflat(&elf, &bytes, base)?
        }
        Mode::Dlib => codec::dlib(&elf, &bytes)?,
        Mode::Kdrv => {
            let symbol = cli.exports_symbol.as_deref().unwrap_or("DRIVER_EXPORTS");
            codec::kdrv(&elf, &bytes, symbol)?
        }
    };

    std::fs::write(&cli.output, &out).with_context(|| format!("writing {}", cli.output.display()))?;
    Ok(())
}
