mod index;
mod pack;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

#[derive(Parser)]
#[clap(name = "anypack", version, about = "Package a directory into a tar.gz with a JSON file index")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `out.tar.gz` from `src_dir`.
    Pack { src_dir: PathBuf, out: PathBuf },
    /// Extract `archive.tar.gz` into `dest_dir`.
    Unpack { archive: PathBuf, dest_dir: PathBuf },
    /// Print the file index of `archive.tar.gz`.
    List { archive: PathBuf },
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("{} {e:#}", "anypack: error:".red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Pack { src_dir, out } => pack::pack(&src_dir, &out),
        Command::Unpack { archive, dest_dir } => pack::unpack(&archive, &dest_dir),
        Command::List { archive } => {
            let index = pack::list(&archive)?;
            for entry in &index.entries {
                println!("{:>10}  {}", entry.size, entry.path);
            }
            Ok(())
        }
    }
    .context("anypack command failed")
}
