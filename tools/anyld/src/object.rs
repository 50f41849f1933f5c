//! Input ingestion (spec §4.2.1): reads `.o` files and `ar` archives into a
//! uniform in-memory representation, validating machine/class/type.

use anyhow::{bail, Context, Result};
use goblin::elf::header::{EM_AARCH64, EM_X86_64, ET_REL};
use goblin::elf::Elf;

use crate::archive;

pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Reads every `.o`/`.a` argument into owned byte buffers, expanding archive
/// members, before any of them are parsed as ELF (so parsed `Elf<'_>`
/// values can borrow from a `Vec` that never needs to grow afterward).
pub fn read_inputs(paths: &[String]) -> Result<Vec<InputFile>> {
    let mut files = Vec::new();
    for path in paths {
        let data = std::fs::read(path).with_context(|| format!("reading {path}"))?;
        if archive::is_archive(&data) {
            for member in archive::parse(&data).with_context(|| format!("parsing archive {path}"))? {
                files.push(InputFile {
                    name: format!("{path}({})", member.name),
                    bytes: member.data,
                });
            }
        } else {
            files.push(InputFile {
                name: path.clone(),
                bytes: data,
            });
        }
    }
    Ok(files)
}

/// Parses and validates every input file's ELF header, ensuring a single
/// consistent machine across the whole link.
pub fn parse_and_validate<'a>(files: &'a [InputFile]) -> Result<Vec<(&'a InputFile, Elf<'a>)>> {
    let mut out = Vec::new();
    let mut machine: Option<u16> = None;
    for file in files {
        let elf = Elf::parse(&file.bytes)
            .with_context(|| format!("{}: not a valid ELF object", file.name))?;
        if elf.header.e_type != ET_REL {
            bail!("{}: not a relocatable object (ET_REL)", file.name);
        }
        if elf.header.e_machine != EM_X86_64 && elf.header.e_machine != EM_AARCH64 {
            bail!(
                "{}: unsupported machine {}",
                file.name,
                elf.header.e_machine
            );
        }
        match machine {
            None => machine = Some(elf.header.e_machine),
            Some(m) if m == elf.header.e_machine => {}
            Some(_) => bail!(
                "{}: machine mismatch within one link (x86_64 and AArch64 mixed)",
                file.name
            ),
        }
        out.push((file, elf));
    }
    Ok(out)
}

pub fn machine_of(parsed: &[(&InputFile, Elf<'_>)]) -> u16 {
    parsed
        .first()
        .map(|(_, e)| e.header.e_machine)
        .unwrap_or(EM_X86_64)
}
