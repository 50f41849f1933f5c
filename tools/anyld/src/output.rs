//! Output file assembly (spec §4.2.7): `ET_DYN` with three program headers,
//! eleven section headers, a `.dynamic`, and a classical SysV symbol hash.

use anyhow::Result;
use elf_common::Buf;
use goblin::container::{Container, Ctx};
use goblin::elf::dynamic::Dyn;
use goblin::elf::dynamic::{
    DT_HASH, DT_NULL, DT_RELA, DT_RELACOUNT, DT_RELAENT, DT_RELASZ, DT_SONAME, DT_STRSZ,
    DT_STRTAB, DT_SYMENT, DT_SYMTAB,
};
use goblin::elf::header::{self, Header};
use goblin::elf::program_header::{ProgramHeader, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD};
use goblin::elf::section_header::{
    SectionHeader, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_DYNAMIC, SHT_DYNSYM, SHT_HASH,
    SHT_NOBITS, SHT_NULL, SHT_PROGBITS, SHT_RELA, SHT_STRTAB,
};
use goblin::elf::sym::Sym;
use scroll::Pwrite;

use crate::layout::Layout;

/// One exported `.dynsym` entry, already carrying its final virtual address.
pub struct DynSym {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub shndx: u16,
}

/// One `.rela.dyn` entry: always base-relative (`r_sym` is always 0; the
/// runtime loader adds its own load bias to `addend`).
pub struct DynReloc {
    pub offset: u64,
    pub addend: i64,
}

#[allow(clippy::too_many_arguments)]
pub fn assemble(
    machine: u16,
    layout: &Layout,
    soname: Option<&str>,
    dynsyms: &[DynSym],
    relas: &[DynReloc],
    text: &[u8],
    rodata: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    let ctx = Ctx::new(Container::Big, scroll::Endian::Little);

    // .dynstr: index 0 is the empty string; the soname (if any) sits at
    // offset 1 per spec, then every exported symbol's name.
    let mut dynstr: Vec<u8> = vec![0];
    let soname_off = soname.map(|s| {
        let off = dynstr.len() as u32;
        dynstr.extend_from_slice(s.as_bytes());
        dynstr.push(0);
        off
    });
    let mut name_offs = Vec::with_capacity(dynsyms.len());
    for sym in dynsyms {
        name_offs.push(dynstr.len() as u32);
        dynstr.extend_from_slice(sym.name.as_bytes());
        dynstr.push(0);
    }

    // .dynsym: a null entry at index 0, then one entry per export. Output
    // section indices are assigned below; symbols are STT_FUNC/OBJECT-
    // agnostic from this module's point of view, so `info` is passed through.
    let nsyms = dynsyms.len() + 1;
    let mut dynsym_buf = vec![0u8; nsyms * Sym::size(ctx.container)];
    for (i, (sym, name_off)) in dynsyms.iter().zip(&name_offs).enumerate() {
        let entry = Sym {
            st_name: *name_off as usize,
            st_info: sym.info,
            st_other: 0,
            st_shndx: sym.shndx as usize,
            st_value: sym.value,
            st_size: sym.size,
        };
        dynsym_buf.pwrite_with(entry, (i + 1) * Sym::size(ctx.container), ctx)?;
    }

    let hash = sysv_hash(&dynsyms.iter().map(|s| s.name.as_str()).collect::<Vec<_>>());

    let mut rela_buf = Vec::with_capacity(relas.len() * 24);
    for r in relas {
        let reloc = goblin::elf::reloc::Reloc {
            r_offset: layout.vaddr(r.offset),
            r_addend: Some(r.addend),
            r_sym: 0,
            r_type: 0,
        };
        let mut entry = [0u8; 24];
        entry.pwrite_with(reloc, 0, (true, ctx))?;
        rela_buf.extend_from_slice(&entry);
    }

    let dyn_entries = dynamic_entries(layout, soname_off, relas.len(), dynstr.len() as u64);
    let mut dynamic_buf = vec![0u8; dyn_entries.len() * Dyn::size(ctx.container)];
    for (i, d) in dyn_entries.iter().enumerate() {
        dynamic_buf.pwrite_with(Dyn { d_tag: d.d_tag, d_val: d.d_val }, i * Dyn::size(ctx.container), ctx)?;
    }
    debug_assert_eq!(dynamic_buf.len() as u64, layout.dynamic_size);

    let shstrtab = build_shstrtab();
    let shstrtab_off = layout.dynamic_off + layout.dynamic_size;
    let shoff = elf_common::align_up(shstrtab_off + shstrtab.len() as u64, 8);
    let file_len = shoff + NUM_SHDRS as u64 * SectionHeader::size(ctx) as u64;

    let mut buf = Buf::new();
    buf.append_zero(file_len as usize);

    write_ehdr(&mut buf, machine, shoff)?;
    write_phdrs(&mut buf, layout)?;
    buf.write_at(layout.dynsym_off as usize, &dynsym_buf);
    buf.write_at(layout.dynstr_off as usize, &dynstr);
    buf.write_at(layout.hash_off as usize, &hash);
    buf.write_at(layout.rela_off as usize, &rela_buf);
    buf.write_at(layout.text_off as usize, text);
    buf.write_at(layout.rodata_off as usize, rodata);
    buf.write_at(layout.data_off as usize, data);
    buf.write_at(layout.dynamic_off as usize, &dynamic_buf);
    buf.write_at(shstrtab_off as usize, &shstrtab);
    write_shdrs(&mut buf, layout, shoff, shstrtab_off, nsyms, rela_buf.len() as u64)?;

    Ok(buf.into_vec())
}

fn dynamic_entries(layout: &Layout, soname_off: Option<u32>, rela_count: usize, dynstr_len: u64) -> Vec<Dyn> {
    let mut d = vec![
        Dyn { d_tag: DT_HASH, d_val: layout.vaddr(layout.hash_off) },
        Dyn { d_tag: DT_STRTAB, d_val: layout.vaddr(layout.dynstr_off) },
        Dyn { d_tag: DT_SYMTAB, d_val: layout.vaddr(layout.dynsym_off) },
        Dyn { d_tag: DT_STRSZ, d_val: dynstr_len },
        Dyn { d_tag: DT_SYMENT, d_val: 24 },
    ];
    if rela_count > 0 {
        d.push(Dyn { d_tag: DT_RELA, d_val: layout.vaddr(layout.rela_off) });
        d.push(Dyn { d_tag: DT_RELASZ, d_val: rela_count as u64 * 24 });
        d.push(Dyn { d_tag: DT_RELAENT, d_val: 24 });
        d.push(Dyn { d_tag: DT_RELACOUNT, d_val: rela_count as u64 });
    }
    if let Some(off) = soname_off {
        d.push(Dyn { d_tag: DT_SONAME, d_val: off as u64 });
    }
    d.push(Dyn { d_tag: DT_NULL, d_val: 0 });
    d
}

/// Byte size of the `.hash` table [`sysv_hash`] would produce for `nsyms`
/// total symbol-table entries (including the null entry at index 0).
pub fn hash_table_size(nsyms: usize) -> u64 {
    let nbucket = std::cmp::max(3, (nsyms as u32) | 1) as u64;
    let nchain = nsyms as u64;
    8 + nbucket * 4 + nchain * 4
}

/// Total `.dynamic` entry count for a given rela/soname configuration,
/// matching [`dynamic_entries`] without needing final addresses.
pub fn dynamic_entry_count(has_rela: bool, has_soname: bool) -> usize {
    5 + if has_rela { 4 } else { 0 } + if has_soname { 1 } else { 0 } + 1
}

/// Classical SysV symbol hash (the algorithm used by `.hash` sections since
/// the original System V ABI); `nbucket` is `nsyms | 1`, floored at 3.
pub fn sysv_hash(names: &[&str]) -> Vec<u8> {
    let nsyms = names.len() + 1; // +1 for the null entry at index 0.
    let nbucket = std::cmp::max(3, (nsyms as u32) | 1);
    let nchain = nsyms as u32;
    let mut buckets = vec![0u32; nbucket as usize];
    let mut chain = vec![0u32; nchain as usize];
    for (i, name) in names.iter().enumerate() {
        let sym_idx = (i + 1) as u32;
        let h = elf_hash(name.as_bytes()) % nbucket;
        chain[sym_idx as usize] = buckets[h as usize];
        buckets[h as usize] = sym_idx;
    }
    let mut out = Vec::with_capacity(8 + buckets.len() * 4 + chain.len() * 4);
    out.extend_from_slice(&nbucket.to_le_bytes());
    out.extend_from_slice(&nchain.to_le_bytes());
    for b in buckets {
        out.extend_from_slice(&b.to_le_bytes());
    }
    for c in chain {
        out.extend_from_slice(&c.to_le_bytes());
    }
    out
}

fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &c in name {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

const SEC_NULL: u16 = 0;
const SEC_DYNSYM: u16 = 1;
const SEC_DYNSTR: u16 = 2;
const SEC_HASH: u16 = 3;
const SEC_RELA_DYN: u16 = 4;
pub const SEC_TEXT: u16 = 5;
pub const SEC_RODATA: u16 = 6;
pub const SEC_DATA: u16 = 7;
const SEC_DYNAMIC: u16 = 8;
pub const SEC_BSS: u16 = 9;
const SEC_SHSTRTAB: u16 = 10;
const NUM_SHDRS: usize = 11;

fn write_ehdr(buf: &mut Buf, machine: u16, shoff: u64) -> Result<()> {
    let ctx = Ctx::new(Container::Big, scroll::Endian::Little);
    let mut hdr = Header::new(ctx);
    hdr.e_type = header::ET_DYN;
    hdr.e_machine = machine;
    hdr.e_version = 1;
    hdr.e_entry = 0;
    hdr.e_phoff = header::header64::SIZEOF_EHDR as u64;
    hdr.e_shoff = shoff;
    hdr.e_phnum = 3;
    hdr.e_shnum = NUM_SHDRS as u16;
    hdr.e_shstrndx = SEC_SHSTRTAB;
    let mut bytes = [0u8; 64];
    bytes.pwrite_with(hdr, 0, ctx.le)?;
    buf.write_at(0, &bytes);
    Ok(())
}

fn write_phdrs(buf: &mut Buf, layout: &Layout) -> Result<()> {
    let ctx = Ctx::new(Container::Big, scroll::Endian::Little);
    let rx_filesz = layout.rodata_off + layout.rodata_size;
    let rw_off = layout.data_off;
    let rw_filesz = layout.dynamic_off + layout.dynamic_size - rw_off;
    let rw_memsz = layout.bss_off + layout.bss_size - rw_off;

    let phdrs = [
        ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: 0,
            p_vaddr: layout.vaddr(0),
            p_paddr: layout.vaddr(0),
            p_filesz: rx_filesz,
            p_memsz: rx_filesz,
            p_align: crate::layout::PAGE,
        },
        ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_W,
            p_offset: rw_off,
            p_vaddr: layout.vaddr(rw_off),
            p_paddr: layout.vaddr(rw_off),
            p_filesz: rw_filesz,
            p_memsz: rw_memsz,
            p_align: crate::layout::PAGE,
        },
        ProgramHeader {
            p_type: PT_DYNAMIC,
            p_flags: PF_R | PF_W,
            p_offset: layout.dynamic_off,
            p_vaddr: layout.vaddr(layout.dynamic_off),
            p_paddr: layout.vaddr(layout.dynamic_off),
            p_filesz: layout.dynamic_size,
            p_memsz: layout.dynamic_size,
            p_align: 8,
        },
    ];
    let ehdr_size = header::header64::SIZEOF_EHDR as u64;
    for (i, ph) in phdrs.into_iter().enumerate() {
        let off = ehdr_size as usize
            + i * goblin::elf::program_header::program_header64::SIZEOF_PHDR;
        let mut bytes = [0u8; 56];
        bytes.pwrite_with(ph, 0, ctx)?;
        buf.write_at(off, &bytes);
    }
    Ok(())
}

fn build_shstrtab() -> Vec<u8> {
    let names = [
        "", ".dynsym", ".dynstr", ".hash", ".rela.dyn", ".text", ".rodata", ".data", ".dynamic",
        ".bss", ".shstrtab",
    ];
    let mut out = Vec::new();
    for n in names {
        out.extend_from_slice(n.as_bytes());
        out.push(0);
    }
    out
}

fn shstrtab_offsets() -> [u32; NUM_SHDRS] {
    let names = [
        "", ".dynsym", ".dynstr", ".hash", ".rela.dyn", ".text", ".rodata", ".data", ".dynamic",
        ".bss", ".shstrtab",
    ];
    let mut offsets = [0u32; NUM_SHDRS];
    let mut off = 0u32;
    for (i, n) in names.iter().enumerate() {
        offsets[i] = off;
        off += n.len() as u32 + 1;
    }
    offsets
}

#[allow(clippy::too_many_arguments)]
fn write_shdrs(
    buf: &mut Buf,
    layout: &Layout,
    shoff: u64,
    shstrtab_off: u64,
    nsyms: usize,
    rela_bytes: u64,
) -> Result<()> {
    let ctx = Ctx::new(Container::Big, scroll::Endian::Little);
    let names = shstrtab_offsets();
    let sh = |idx: u16, sh_type: u32, flags: u64, addr: u64, offset: u64, size: u64, link: u32,
              entsize: u64, align: u64| SectionHeader {
        sh_name: names[idx as usize] as usize,
        sh_type,
        sh_flags: flags,
        sh_addr: addr,
        sh_offset: offset,
        sh_size: size,
        sh_link: link,
        sh_info: 0,
        sh_addralign: align,
        sh_entsize: entsize,
    };
    let shdrs = [
        sh(SEC_NULL, SHT_NULL, 0, 0, 0, 0, 0, 0, 0),
        sh(
            SEC_DYNSYM,
            SHT_DYNSYM,
            SHF_ALLOC as u64,
            layout.vaddr(layout.dynsym_off),
            layout.dynsym_off,
            nsyms as u64 * 24,
            SEC_DYNSTR as u32,
            24,
            8,
        ),
        sh(
            SEC_DYNSTR,
            SHT_STRTAB,
            SHF_ALLOC as u64,
            layout.vaddr(layout.dynstr_off),
            layout.dynstr_off,
            layout.hash_off - layout.dynstr_off,
            0,
            0,
            1,
        ),
        sh(
            SEC_HASH,
            SHT_HASH,
            SHF_ALLOC as u64,
            layout.vaddr(layout.hash_off),
            layout.hash_off,
            layout.rela_off - layout.hash_off,
            SEC_DYNSYM as u32,
            4,
            4,
        ),
        sh(
            SEC_RELA_DYN,
            SHT_RELA,
            SHF_ALLOC as u64,
            layout.vaddr(layout.rela_off),
            layout.rela_off,
            rela_bytes,
            SEC_DYNSYM as u32,
            24,
            8,
        ),
        sh(
            SEC_TEXT,
            SHT_PROGBITS,
            (SHF_ALLOC | SHF_EXECINSTR) as u64,
            layout.vaddr(layout.text_off),
            layout.text_off,
            layout.text_size,
            0,
            0,
            16,
        ),
        sh(
            SEC_RODATA,
            SHT_PROGBITS,
            SHF_ALLOC as u64,
            layout.vaddr(layout.rodata_off),
            layout.rodata_off,
            layout.rodata_size,
            0,
            0,
            16,
        ),
        sh(
            SEC_DATA,
            SHT_PROGBITS,
            (SHF_ALLOC | SHF_WRITE) as u64,
            layout.vaddr(layout.data_off),
            layout.data_off,
            layout.data_size,
            0,
            0,
            16,
        ),
        sh(
            SEC_DYNAMIC,
            SHT_DYNAMIC,
            (SHF_ALLOC | SHF_WRITE) as u64,
            layout.vaddr(layout.dynamic_off),
            layout.dynamic_off,
            layout.dynamic_size,
            SEC_DYNSTR as u32,
            16,
            8,
        ),
        sh(
            SEC_BSS,
            SHT_NOBITS,
            (SHF_ALLOC | SHF_WRITE) as u64,
            layout.vaddr(layout.bss_off),
            layout.bss_off,
            layout.bss_size,
            0,
            0,
            16,
        ),
        sh(
            SEC_SHSTRTAB,
            SHT_STRTAB,
            0,
            0,
            shstrtab_off,
            crate::output::build_shstrtab().len() as u64,
            0,
            0,
            1,
        ),
    ];
    for (i, header) in shdrs.into_iter().enumerate() {
        let off = shoff as usize + i * SectionHeader::size(ctx);
        let mut bytes = [0u8; 64];
        bytes.pwrite_with(header, 0, ctx)?;
        buf.write_at(off, &bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_hash_nbucket_floors_at_three() {
        let h = sysv_hash(&[]);
        let nbucket = u32::from_le_bytes(h[0..4].try_into().unwrap());
        assert_eq!(nbucket, 3);
    }

    #[test]
    fn sysv_hash_nbucket_is_odd() {
        let names = vec!["a"; 8];
        let h = sysv_hash(&names);
        let nbucket = u32::from_le_bytes(h[0..4].try_into().unwrap());
        assert_eq!(nbucket % 2, 1);
    }

    #[test]
    fn assembles_a_minimal_dynsym_free_object() {
        let layout = crate::layout::build(0x40000, 1, 1, 24, 0, 4, 0, 0, 96, 0);
        let out = assemble(
            goblin::elf::header::EM_X86_64,
            &layout,
            None,
            &[],
            &[],
            &[0x90, 0x90, 0x90, 0xc3],
            &[],
            &[],
        )
        .unwrap();
        let elf = goblin::elf::Elf::parse(&out).unwrap();
        assert_eq!(elf.header.e_type, goblin::elf::header::ET_DYN);
        assert_eq!(elf.program_headers.len(), 3);
        assert_eq!(elf.section_headers.len(), NUM_SHDRS);
    }
}
