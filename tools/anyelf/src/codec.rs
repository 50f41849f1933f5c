//! Format translation (spec §4.3): each mode reads `PT_LOAD` segments from a
//! parsed ELF64 and re-emits them in a different container. Strictly
//! format-translation — no relocation is applied.

use anyhow::{bail, Context, Result};
use elf_common::Buf;
use goblin::elf::program_header::{PT_LOAD, PF_W};
use goblin::elf::Elf;

const PAGE: u64 = 0x1000;

fn load_segments<'a>(elf: &'a Elf<'_>) -> Vec<&'a goblin::elf::ProgramHeader> {
    elf.program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .collect()
}

fn segment_bytes<'a>(file: &'a [u8], ph: &goblin::elf::ProgramHeader) -> Result<&'a [u8]> {
    let start = ph.p_offset as usize;
    let end = start + ph.p_filesz as usize;
    file.get(start..end)
        .context("PT_LOAD segment file range runs past EOF")
}

/// `bin` mode: a zero-initialized buffer spanning the virtual-address range
/// of every `PT_LOAD` segment, each segment's file bytes copied to its
/// offset within that range. BSS is implicit (the buffer starts zeroed).
pub fn bin(elf: &Elf<'_>, file: &[u8]) -> Result<Vec<u8>> {
    flatten(elf, file, |ph| ph.p_vaddr, |ph| ph.p_vaddr + ph.p_memsz)
}

/// `pflat` mode: identical to `bin` but keyed on physical addresses, for
/// kernel images loaded at a fixed physical location. `base` overrides the
/// lowest physical address observed (segments below it are an error).
pub fn pflat(elf: &Elf<'_>, file: &[u8], base: u64) -> Result<Vec<u8>> {
    let segs = load_segments(elf);
    if segs.is_empty() {
        bail!("no PT_LOAD segments to encode");
    }
    for ph in &segs {
        if ph.p_paddr < base {
            bail!(
                "segment physical address {:#x} is below the supplied base {:#x}",
                ph.p_paddr,
                base
            );
        }
    }
    let max = segs.iter().map(|ph| ph.p_paddr + ph.p_memsz).max().unwrap();
    let mut out = vec![0u8; (max - base) as usize];
    for ph in &segs {
        let bytes = segment_bytes(file, ph)?;
        let off = (ph.p_paddr - base) as usize;
        out[off..off + bytes.len()].copy_from_slice(bytes);
    }
    Ok(out)
}

fn flatten(
    elf: &Elf<'_>,
    file: &[u8],
    lo: impl Fn(&goblin::elf::ProgramHeader) -> u64,
    hi: impl Fn(&goblin::elf::ProgramHeader) -> u64,
) -> Result<Vec<u8>> {
    let segs = load_segments(elf);
    if segs.is_empty() {
        bail!("no PT_LOAD segments to encode");
    }
    let min = segs.iter().map(|ph| lo(ph)).min().unwrap();
    let max = segs.iter().map(|ph| hi(ph)).max().unwrap();
    let mut out = vec![0u8; (max - min) as usize];
    for ph in &segs {
        let bytes = segment_bytes(file, ph)?;
        let off = (lo(ph) - min) as usize;
        out[off..off + bytes.len()].copy_from_slice(bytes);
    }
    Ok(out)
}

fn page_up(v: u64) -> u64 {
    elf_common::align_up(v, PAGE)
}

/// `dlib` mode: segments partitioned into RO/RW groups by the write flag;
/// a 4096-byte header is followed by the concatenated RO + data content.
/// BSS pages are implied by the RW segment's mem-size minus its file-size,
/// never written.
pub fn dlib(elf: &Elf<'_>, file: &[u8]) -> Result<Vec<u8>> {
    let segs = load_segments(elf);
    if segs.is_empty() {
        bail!("no PT_LOAD segments to encode");
    }
    let base = segs.iter().map(|ph| ph.p_vaddr).min().unwrap();

    let mut ro = Buf::new();
    let mut rw_data = Buf::new();
    let mut rw_file_size: u64 = 0;
    let mut rw_mem_size: u64 = 0;
    for ph in &segs {
        let bytes = segment_bytes(file, ph)?;
        if ph.p_flags & PF_W != 0 {
            rw_data.append(bytes);
            rw_file_size += ph.p_filesz;
            rw_mem_size += ph.p_memsz;
        } else {
            ro.append(bytes);
        }
    }

    let ro_pages = page_up(ro.len() as u64) / PAGE;
    let data_pages = page_up(rw_file_size) / PAGE;
    let bss_pages = page_up(rw_mem_size.saturating_sub(rw_file_size)) / PAGE;
    let total_pages = 1 + ro_pages + data_pages + bss_pages;

    let mut header = Buf::new();
    header.append(b"DLIB");
    header.append(&3u32.to_le_bytes()); // version
    header.append(&4096u32.to_le_bytes()); // header size
    header.append(&0u32.to_le_bytes()); // flags
    header.append(&base.to_le_bytes()); // base vaddr (u64)
    header.append(&(ro_pages as u32).to_le_bytes());
    header.append(&(data_pages as u32).to_le_bytes());
    header.append(&(bss_pages as u32).to_le_bytes());
    header.append(&(total_pages as u32).to_le_bytes());
    header.append_zero(4096 - header.len());

    let mut out = header.into_vec();
    out.resize(4096 + (ro_pages * PAGE) as usize, 0);
    out[4096..4096 + ro.len()].copy_from_slice(ro.as_slice());
    let data_start = 4096 + (ro_pages * PAGE) as usize;
    out.resize(data_start + (data_pages * PAGE) as usize, 0);
    out[data_start..data_start + rw_data.len()].copy_from_slice(rw_data.as_slice());
    Ok(out)
}

/// `kdrv` mode: ELF64 only; segments separated into code (non-writable) and
/// data (writable); the exports symbol's offset from the page-aligned base
/// is recorded in the header so the loader can locate the driver's export
/// table without its own symbol table.
pub fn kdrv(elf: &Elf<'_>, file: &[u8], exports_symbol: &str) -> Result<Vec<u8>> {
    if !elf.is_64 {
        bail!("kdrv mode requires an ELF64 input");
    }
    let mut segs = load_segments(elf);
    if segs.is_empty() {
        bail!("no PT_LOAD segments to encode");
    }
    segs.sort_by_key(|ph| ph.p_vaddr);

    let min_vaddr = segs.iter().map(|ph| ph.p_vaddr).min().unwrap();
    let base = min_vaddr - (min_vaddr % PAGE);

    let mut code = Buf::new();
    let mut data = Buf::new();
    let mut code_mem: u64 = 0;
    let mut data_file: u64 = 0;
    let mut data_mem: u64 = 0;
    for ph in &segs {
        let bytes = segment_bytes(file, ph)?;
        if ph.p_flags & PF_W != 0 {
            data.append(bytes);
            data_file += ph.p_filesz;
            data_mem += ph.p_memsz;
        } else {
            code.append(bytes);
            code_mem += ph.p_memsz;
        }
    }

    let exports_vaddr = elf
        .syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some(exports_symbol))
        .map(|sym| sym.st_value)
        .with_context(|| format!("exports symbol `{exports_symbol}` not found"))?;
    let exports_offset = PAGE + (exports_vaddr - base);

    let code_pages = page_up(code_mem) / PAGE;
    let data_pages = page_up(data_file) / PAGE;
    let bss_pages = page_up(data_mem.saturating_sub(data_file)) / PAGE;

    let mut header = Buf::new();
    header.append(b"KDRV");
    header.append(&1u32.to_le_bytes()); // version
    header.append(&1u32.to_le_bytes()); // ABI version
    header.append(&0u32.to_le_bytes()); // flags
    header.append(&exports_offset.to_le_bytes());
    header.append(&(code_pages as u32).to_le_bytes());
    header.append(&(data_pages as u32).to_le_bytes());
    header.append(&(bss_pages as u32).to_le_bytes());
    header.append_zero(4096 - header.len());

    let mut out = header.into_vec();
    out.resize(4096 + (code_pages * PAGE) as usize, 0);
    out[4096..4096 + code.len()].copy_from_slice(code.as_slice());
    let data_start = 4096 + (code_pages * PAGE) as usize;
    out.resize(data_start + (data_pages * PAGE) as usize, 0);
    out[data_start..data_start + data.len()].copy_from_slice(data.as_slice());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::container::Ctx;
    use goblin::elf::header::Header;
    use goblin::elf::ProgramHeader;
    use scroll::{Pwrite, Endian};

    /// Builds a minimal ET_EXEC ELF64 file with the given `(vaddr, flags,
    /// bytes, extra_bss)` segments, no section headers, for codec tests.
    fn build_elf(segments: &[(u64, u32, &[u8], u64)]) -> Vec<u8> {
        let ctx = Ctx::new(goblin::container::Container::Big, Endian::Little);
        let ehdr_size = Header::size(ctx);
        let phdr_size = ProgramHeader::size(ctx);
        let mut off = ehdr_size as u64 + segments.len() as u64 * phdr_size as u64;
        let mut phdrs = Vec::new();
        let mut payload = Vec::new();
        for (vaddr, flags, bytes, extra_bss) in segments {
            phdrs.push(ProgramHeader {
                p_type: PT_LOAD,
                p_flags: *flags,
                p_offset: off,
                p_vaddr: *vaddr,
                p_paddr: *vaddr,
                p_filesz: bytes.len() as u64,
                p_memsz: bytes.len() as u64 + extra_bss,
                p_align: 0x1000,
            });
            payload.extend_from_slice(bytes);
            off += bytes.len() as u64;
        }
        let mut hdr = Header::new(ctx);
        hdr.e_type = goblin::elf::header::ET_EXEC;
        hdr.e_machine = goblin::elf::header::EM_X86_64;
        hdr.e_phoff = ehdr_size as u64;
        hdr.e_phentsize = phdr_size as u16;
        hdr.e_phnum = segments.len() as u16;

        let mut buf = vec![0u8; off as usize];
        buf.pwrite_with(hdr, 0, ctx.le).unwrap();
        let mut poff = ehdr_size;
        for ph in &phdrs {
            buf.pwrite_with(ph.clone(), poff, ctx).unwrap();
            poff += phdr_size;
        }
        buf[poff..].copy_from_slice(&payload);
        buf
    }

    #[test]
    fn bin_flattens_with_implicit_bss() {
        let bytes: Vec<u8> = (0..16).collect();
        let file = build_elf(&[(0x1000, 4, &bytes, 16)]);
        let elf = Elf::parse(&file).unwrap();
        let out = bin(&elf, &file).unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(&out[..16], &bytes[..]);
        assert_eq!(&out[16..], &[0u8; 16]);
    }

    #[test]
    fn pflat_keys_on_physical_address() {
        let bytes = [1u8, 2, 3, 4];
        let file = build_elf(&[(0x2000, 4, &bytes, 0)]);
        let elf = Elf::parse(&file).unwrap();
        let out = pflat(&elf, &file, 0x1000).unwrap();
        assert_eq!(out.len(), 0x1004);
        assert_eq!(&out[0x1000..0x1004], &bytes);
    }

    #[test]
    fn dlib_header_has_magic_and_version() {
        let ro = [0xAAu8; 16];
        let file = build_elf(&[(0x1000, 4, &ro, 0)]);
        let elf = Elf::parse(&file).unwrap();
        let out = dlib(&elf, &file).unwrap();
        assert_eq!(&out[0..4], b"DLIB");
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()), 3);
        assert_eq!(out.len() % 4096, 0);
    }

    #[test]
    fn kdrv_requires_exports_symbol() {
        let code = [0x90u8; 4];
        let file = build_elf(&[(0x1000, 5, &code, 0)]);
        let elf = Elf::parse(&file).unwrap();
        let err = kdrv(&elf, &file, "DRIVER_EXPORTS").unwrap_err();
        assert!(err.to_string().contains("DRIVER_EXPORTS"));
    }
}
