//! Core linker orchestration (spec §4.2): ingestion → section merging →
//! symbol resolution → export selection → layout → relocation → output.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use elf_common::{align_up, Buf};
use goblin::elf::reloc;
use goblin::elf::section_header::{SHF_ALLOC, SHN_ABS, SHN_UNDEF, SHT_NOBITS};
use goblin::elf::sym::STB_GLOBAL;
use goblin::elf::Elf;

use crate::classify::{classify, OutKind};
use crate::layout::{self, Layout};
use crate::object::{self, InputFile};
use crate::output::{self, DynReloc, DynSym};
use crate::symtab::{Bind, SymbolTable};

pub struct LinkOptions<'a> {
    pub base: u64,
    pub soname: Option<&'a str>,
    pub exports_only: Option<&'a [String]>,
}

#[derive(Clone, Copy)]
enum Mapped {
    Buf(OutKind, u64),
    Bss(u64),
}

pub fn link(inputs: &[InputFile], opts: &LinkOptions<'_>) -> Result<Vec<u8>> {
    let parsed = object::parse_and_validate(inputs)?;
    if parsed.is_empty() {
        bail!("no input objects");
    }
    let machine = object::machine_of(&parsed);
    let names: Vec<&str> = inputs.iter().map(|f| f.name.as_str()).collect();

    let mut text = Buf::new();
    let mut rodata = Buf::new();
    let mut data = Buf::new();
    let mut bss_size: u64 = 0;
    let mut section_map: Vec<HashMap<usize, Mapped>> = Vec::with_capacity(parsed.len());

    for (file, elf) in &parsed {
        let mut map = HashMap::new();
        for (idx, sh) in elf.section_headers.iter().enumerate() {
            if sh.sh_flags as u32 & SHF_ALLOC == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");
            let kind = classify(name, sh);
            let align = sh.sh_addralign.max(1);
            match kind {
                OutKind::Discarded => {}
                OutKind::Bss => {
                    let off = align_up(bss_size, align);
                    bss_size = off + sh.sh_size;
                    map.insert(idx, Mapped::Bss(off));
                }
                OutKind::Text | OutKind::Rodata | OutKind::Data => {
                    let buf = match kind {
                        OutKind::Text => &mut text,
                        OutKind::Rodata => &mut rodata,
                        OutKind::Data => &mut data,
                        _ => unreachable!(),
                    };
                    buf.align(align);
                    let off = if sh.sh_type == SHT_NOBITS {
                        buf.append_zero(sh.sh_size as usize)
                    } else {
                        let start = sh.sh_offset as usize;
                        let end = start + sh.sh_size as usize;
                        let bytes = file
                            .bytes
                            .get(start..end)
                            .with_context(|| format!("{}: section `{name}` runs past EOF", file.name))?;
                        buf.append(bytes)
                    };
                    map.insert(idx, Mapped::Buf(kind, off as u64));
                }
            }
        }
        section_map.push(map);
    }

    let sym_rows: Vec<Vec<(usize, String, u8, usize)>> = parsed
        .iter()
        .map(|(_, elf)| {
            elf.syms
                .iter()
                .enumerate()
                .map(|(idx, sym)| {
                    let name = elf.strtab.get_at(sym.st_name).unwrap_or("").to_string();
                    (idx, name, sym.st_info, sym.st_shndx)
                })
                .collect()
        })
        .collect();
    let table = SymbolTable::resolve(&names, |obj| sym_rows[obj].clone())?;

    let exports = select_exports(&table, opts.exports_only);

    // .rela.dyn's size only depends on relocation *types*, not addresses, so
    // the counting pass and the real layout agree without needing a second
    // full layout rebuild.
    let rela_count = count_dynamic_relocs(&parsed, &section_map);

    let dynstr_size: u64 = 1
        + opts.soname.map(|s| s.len() as u64 + 1).unwrap_or(0)
        + exports.iter().map(|n| n.len() as u64 + 1).sum::<u64>();
    let nsyms = exports.len() + 1;
    let hash_size = output::hash_table_size(nsyms);
    let dynamic_size =
        output::dynamic_entry_count(rela_count > 0, opts.soname.is_some()) as u64 * 16;

    let layout = layout::build(
        opts.base,
        nsyms,
        dynstr_size,
        hash_size,
        rela_count,
        text.len() as u64,
        rodata.len() as u64,
        data.len() as u64,
        dynamic_size,
        bss_size,
    );

    debug_assert_eq!(rela_count, layout.rela_count);
    if layout.end() > (1u64 << 47) {
        bail!("link base {:#x} places the image beyond the canonical address range", opts.base);
    }

    let mut cache: HashMap<(usize, usize), u64> = HashMap::new();
    let mut relas = Vec::new();

    for (obj, (file, elf)) in parsed.iter().enumerate() {
        for (reloc_sec_idx, relocs) in &elf.shdr_relocs {
            // `shdr_relocs` is keyed by the `.rela.*` section's own index;
            // the section it patches is named by that section's `sh_info`.
            let target_idx = elf.section_headers[*reloc_sec_idx].sh_info as usize;
            let target = match section_map[obj].get(&target_idx) {
                Some(m) => *m,
                None => continue, // relocations into discarded/non-alloc sections are dropped.
            };
            let (out_kind, out_off) = match target {
                Mapped::Buf(k, o) => (k, o),
                Mapped::Bss(_) => continue, // no file bytes to patch.
            };
            let section_off = match out_kind {
                OutKind::Text => layout.text_off,
                OutKind::Rodata => layout.rodata_off,
                OutKind::Data => layout.data_off,
                OutKind::Bss | OutKind::Discarded => unreachable!(),
            };
            let target_buf = match out_kind {
                OutKind::Text => &mut text,
                OutKind::Rodata => &mut rodata,
                OutKind::Data => &mut data,
                OutKind::Bss | OutKind::Discarded => unreachable!(),
            };
            for r in relocs {
                let file_off = section_off + out_off + r.r_offset;
                let patch_vaddr = layout.vaddr(file_off);
                let s = value_of(
                    obj,
                    r.r_sym,
                    &parsed,
                    &section_map,
                    &table,
                    &names,
                    &layout,
                    &mut cache,
                    0,
                )?;
                let a = r.r_addend.with_context(|| {
                    format!(
                        "{}: REL-format relocations (implicit addend) are not supported",
                        file.name
                    )
                })?;
                let preceding = if file_off > section_off {
                    Some(target_buf.as_slice()[(file_off - section_off - 1) as usize])
                } else {
                    None
                };
                let patch = crate::reloc::compute(r.r_type, s, a, patch_vaddr, preceding)
                    .with_context(|| format!("{}: relocation at {:#x}", names[obj], r.r_offset))?;
                apply_patch(target_buf, (file_off - section_off) as usize, r.r_type, &patch.bytes);

                if crate::reloc::emits_dynamic_reloc(r.r_type) {
                    relas.push(DynReloc {
                        offset: file_off,
                        addend: s.wrapping_add(a as u64) as i64,
                    });
                }
            }
        }
    }

    let dynsyms: Vec<DynSym> = exports
        .iter()
        .map(|name| {
            let def = table.globals[name];
            let (_, elf) = &parsed[def.obj];
            let sym = elf.syms.get(def.idx).context("export symbol vanished")?;
            let value = value_of(
                def.obj, def.idx, &parsed, &section_map, &table, &names, &layout, &mut cache, 0,
            )?;
            let shndx = output_shndx(sym.st_shndx, &section_map[def.obj]);
            Ok(DynSym {
                name: name.clone(),
                value,
                size: sym.st_size,
                info: (STB_GLOBAL << 4) | (sym.st_info & 0xf),
                shndx,
            })
        })
        .collect::<Result<_>>()?;

    output::assemble(
        machine,
        &layout,
        opts.soname,
        &dynsyms,
        &relas,
        text.as_slice(),
        rodata.as_slice(),
        data.as_slice(),
    )
}

fn output_shndx(input_shndx: usize, map: &HashMap<usize, Mapped>) -> u16 {
    if input_shndx == SHN_ABS as usize {
        return SHN_ABS as u16;
    }
    match map.get(&input_shndx) {
        Some(Mapped::Buf(OutKind::Text, _)) => output::SEC_TEXT,
        Some(Mapped::Buf(OutKind::Rodata, _)) => output::SEC_RODATA,
        Some(Mapped::Buf(OutKind::Data, _)) => output::SEC_DATA,
        Some(Mapped::Bss(_)) => output::SEC_BSS,
        _ => 0,
    }
}

fn select_exports(table: &SymbolTable, only: Option<&[String]>) -> Vec<String> {
    match only {
        Some(list) => {
            for name in list {
                match table.globals.get(name) {
                    Some(def) if def.defined => {}
                    _ => eprintln!("anyld: warning: exported symbol `{name}` was not defined"),
                }
            }
            list.iter()
                .filter(|n| table.globals.get(n.as_str()).map(|d| d.defined).unwrap_or(false))
                .cloned()
                .collect()
        }
        None => table
            .order
            .iter()
            .filter(|n| {
                let d = &table.globals[*n];
                d.defined && d.bind == Bind::Global
            })
            .cloned()
            .collect(),
    }
}

fn count_dynamic_relocs(
    parsed: &[(&InputFile, Elf<'_>)],
    section_map: &[HashMap<usize, Mapped>],
) -> usize {
    let mut n = 0;
    for (obj, (_, elf)) in parsed.iter().enumerate() {
        for (reloc_sec_idx, relocs) in &elf.shdr_relocs {
            let target_idx = elf.section_headers[*reloc_sec_idx].sh_info as usize;
            if !matches!(section_map[obj].get(&target_idx), Some(Mapped::Buf(_, _))) {
                continue;
            }
            for r in relocs {
                if crate::reloc::emits_dynamic_reloc(r.r_type) {
                    n += 1;
                }
            }
        }
    }
    n
}

#[allow(clippy::too_many_arguments)]
fn value_of(
    obj: usize,
    idx: usize,
    parsed: &[(&InputFile, Elf<'_>)],
    section_map: &[HashMap<usize, Mapped>],
    table: &SymbolTable,
    names: &[&str],
    layout: &Layout,
    cache: &mut HashMap<(usize, usize), u64>,
    depth: u32,
) -> Result<u64> {
    if let Some(v) = cache.get(&(obj, idx)) {
        return Ok(*v);
    }
    if depth > 64 {
        bail!("symbol resolution cycle involving {}", names[obj]);
    }
    let (_, elf) = &parsed[obj];
    let sym = elf
        .syms
        .get(idx)
        .with_context(|| format!("{}: symbol index {idx} out of range", names[obj]))?;
    let value = if sym.st_shndx == SHN_ABS as usize {
        sym.st_value
    } else if sym.st_shndx == SHN_UNDEF as usize {
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
        match table.globals.get(name) {
            Some(def) if def.defined => value_of(
                def.obj, def.idx, parsed, section_map, table, names, layout, cache, depth + 1,
            )?,
            _ => 0,
        }
    } else {
        match section_map[obj].get(&sym.st_shndx) {
            Some(Mapped::Buf(kind, off)) => {
                let base = match kind {
                    OutKind::Text => layout.vaddr(layout.text_off),
                    OutKind::Rodata => layout.vaddr(layout.rodata_off),
                    OutKind::Data => layout.vaddr(layout.data_off),
                    OutKind::Bss | OutKind::Discarded => unreachable!(),
                };
                base + off + sym.st_value
            }
            Some(Mapped::Bss(off)) => layout.vaddr(layout.bss_off) + off + sym.st_value,
            None => bail!(
                "{}: symbol `{}` lives in a discarded or non-allocated section",
                names[obj],
                elf.strtab.get_at(sym.st_name).unwrap_or("<unnamed>")
            ),
        }
    };
    cache.insert((obj, idx), value);
    Ok(value)
}

/// Writes `patch.bytes` (always a little-endian 4-byte value from
/// [`crate::reloc::compute`]) into `buf` at `offset`, either as a full
/// overwrite or OR'd into the relevant instruction bitfield, matching each
/// relocation family's encoding.
fn apply_patch(buf: &mut Buf, offset: usize, r_type: u32, bytes: &[u8]) {
    use reloc::*;
    match r_type {
        R_X86_64_64 | R_AARCH64_ABS64 | R_X86_64_PC64 | R_AARCH64_PREL64 => {
            buf.write_at(offset, bytes);
        }
        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
            let imm26 = u32::from_le_bytes(bytes.try_into().unwrap());
            let mut word = u32::from_le_bytes(buf.as_slice()[offset..offset + 4].try_into().unwrap());
            word = (word & !0x03ff_ffff) | imm26;
            buf.write_at(offset, &word.to_le_bytes());
        }
        R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_GOT_PAGE => {
            let bits = u32::from_le_bytes(bytes.try_into().unwrap());
            let mut word = u32::from_le_bytes(buf.as_slice()[offset..offset + 4].try_into().unwrap());
            word &= !((0x3 << 29) | (0x7_ffff << 5));
            word |= bits;
            buf.write_at(offset, &word.to_le_bytes());
        }
        R_AARCH64_ADD_ABS_LO12_NC
        | R_AARCH64_LDST8_ABS_LO12_NC
        | R_AARCH64_LDST16_ABS_LO12_NC
        | R_AARCH64_LDST32_ABS_LO12_NC
        | R_AARCH64_LDST64_ABS_LO12_NC
        | R_AARCH64_LDST128_ABS_LO12_NC
        | R_AARCH64_LD64_GOT_LO12_NC => {
            let bits = u32::from_le_bytes(bytes.try_into().unwrap());
            let mut word = u32::from_le_bytes(buf.as_slice()[offset..offset + 4].try_into().unwrap());
            word &= !(0xfff << 10);
            word |= bits;
            buf.write_at(offset, &word.to_le_bytes());
        }
        R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
            if offset > 0 {
                if let Some(&op) = buf.as_slice().get(offset - 1) {
                    if op == 0x8b {
                        buf.write_at(offset - 1, &[0x8d]);
                    }
                }
            }
            buf.write_at(offset, bytes);
        }
        _ => buf.write_at(offset, bytes),
    }
}
