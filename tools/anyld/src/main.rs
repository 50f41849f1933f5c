mod archive;
mod classify;
mod layout;
mod link;
mod object;
mod output;
mod reloc;
mod symtab;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

/// A minimal ELF64 static linker emitting position-independent shared objects.
#[derive(Parser)]
#[clap(name = "anyld", version, about = "Link ELF64 relocatable objects into a position-independent shared object")]
struct Cli {
    #[clap(short = 'o', value_name = "FILE")]
    output: PathBuf,

    #[clap(short = 'b', value_name = "ADDR", parse(try_from_str = parse_base))]
    base: Option<u64>,

    #[clap(short = 'e', long = "exports", value_name = "FILE")]
    exports_def: Option<PathBuf>,

    #[clap(short = 'v', long = "verbose")]
    verbose: bool,

    #[clap(required = true)]
    inputs: Vec<String>,
}

fn parse_base(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("{} {e:#}", "anyld: error:".red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let inputs = object::read_inputs(&cli.inputs)?;
    let (soname, only) = match &cli.exports_def {
        Some(path) => parse_def_file(path)?,
        None => (None, None),
    };
    let opts = link::LinkOptions {
        base: cli.base.unwrap_or(0x1_0000_0000),
        soname: soname.as_deref(),
        exports_only: only.as_deref(),
    };
    if cli.verbose {
        for f in &inputs {
            eprintln!("anyld: {}", f.name);
        }
    }
    let bytes = link::link(&inputs, &opts)?;
    std::fs::write(&cli.output, &bytes)
        .with_context(|| format!("writing {}", cli.output.display()))?;
    Ok(())
}

/// Parses a `.def` export file: `# comments`, an optional `LIBRARY name`
/// line, an `EXPORTS` line, then one symbol name per line.
fn parse_def_file(path: &std::path::Path) -> Result<(Option<String>, Option<Vec<String>>)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut soname = None;
    let mut symbols = Vec::new();
    let mut in_exports = false;
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("LIBRARY") {
            soname = Some(rest.trim().to_string());
        } else if line.eq_ignore_ascii_case("EXPORTS") {
            in_exports = true;
        } else if in_exports {
            symbols.push(line.to_string());
        }
    }
    Ok((soname, Some(symbols)))
}
