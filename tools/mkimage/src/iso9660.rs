//! ISO-9660 (+El Torito) writer for the optical-media image mode
//! (spec §4.4.4), grounded on the both-endian field encoding and directory
//! record layout of the Nohac-rum ISO generator, extended with nested
//! directories, a path table covering every directory (not just root), and
//! an El Torito boot catalog instead of Rock Ridge.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

pub const SECTOR_SIZE: u64 = 2048;
const PVD_SECTOR: u64 = 16;
const BOOT_RECORD_SECTOR: u64 = 17;
const VDST_SECTOR: u64 = 18;
const BOOT_CATALOG_SECTOR: u64 = 19;
const PATH_TABLE_L_SECTOR: u64 = 20;
const PATH_TABLE_M_SECTOR: u64 = 21;
const BOOT_IMAGE_SECTOR: u64 = 22;
const BOOT_IMAGE_SECTORS: u64 = 16; // 32KiB
const FIRST_DIR_SECTOR: u64 = 38;

fn put_u32_both(buf: &mut [u8], val: u32) {
    buf[0..4].copy_from_slice(&val.to_le_bytes());
    buf[4..8].copy_from_slice(&val.to_be_bytes());
}

fn put_u16_both(buf: &mut [u8], val: u16) {
    buf[0..2].copy_from_slice(&val.to_le_bytes());
    buf[2..4].copy_from_slice(&val.to_be_bytes());
}

fn sectors_for(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(SECTOR_SIZE).max(1)
}

/// Maps an arbitrary filename to an ISO 9660 Level 1 identifier: uppercase
/// 8.3, `;1` version suffix for files (directories get none).
fn level1_name(name: &str, is_dir: bool) -> String {
    let sanitized: String = name
        .to_ascii_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '_' })
        .collect();
    let base = if let Some(dot) = sanitized.find('.') {
        let base = &sanitized[..dot.min(8)];
        let ext_end = (dot + 1 + 3).min(sanitized.len());
        let ext = &sanitized[dot + 1..ext_end];
        format!("{base}.{ext}")
    } else {
        sanitized[..sanitized.len().min(8)].to_string()
    };
    if is_dir {
        base
    } else {
        format!("{base};1")
    }
}

fn dir_record(extent: u64, size: u64, name: &[u8], is_dir: bool) -> Vec<u8> {
    let name_len = name.len();
    let padding = if name_len.is_multiple_of(2) { 1 } else { 0 };
    let record_len = 33 + name_len + padding;
    let mut buf = vec![0u8; record_len];
    buf[0] = record_len as u8;
    put_u32_both(&mut buf[2..10], extent as u32);
    put_u32_both(&mut buf[10..18], size as u32);
    buf[25] = if is_dir { 0x02 } else { 0x00 };
    put_u16_both(&mut buf[28..32], 1);
    buf[32] = name_len as u8;
    buf[33..33 + name_len].copy_from_slice(name);
    buf
}

/// A directory queued for layout: its sysroot-relative path (empty for
/// root), the files it directly contains, and the extent/size assigned
/// once all directories have been discovered.
struct DirPlan {
    files: Vec<(String, Vec<u8>)>,
    subdirs: Vec<String>, // rel paths of direct children
    extent: u64,
    size_sectors: u64,
    parent_index: u16, // 1-based index into the path table, self for root
}

fn collect_dirs(sysroot: &Path) -> Result<BTreeMap<String, DirPlan>> {
    let mut dirs = BTreeMap::new();
    dirs.insert(
        String::new(),
        DirPlan { files: Vec::new(), subdirs: Vec::new(), extent: 0, size_sectors: 0, parent_index: 1 },
    );
    collect_recursive(sysroot, "", &mut dirs)?;
    Ok(dirs)
}

fn collect_recursive(path: &Path, rel: &str, dirs: &mut BTreeMap<String, DirPlan>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(path)
        .with_context(|| format!("reading sysroot directory {}", path.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_rel = if rel.is_empty() { name.clone() } else { format!("{rel}/{name}") };
        let meta = entry.metadata()?;
        if meta.is_dir() {
            dirs.get_mut(rel).unwrap().subdirs.push(child_rel.clone());
            dirs.insert(
                child_rel.clone(),
                DirPlan { files: Vec::new(), subdirs: Vec::new(), extent: 0, size_sectors: 0, parent_index: 0 },
            );
            collect_recursive(&entry.path(), &child_rel, dirs)?;
        } else if meta.is_file() {
            let data = std::fs::read(entry.path())?;
            dirs.get_mut(rel).unwrap().files.push((name, data));
        }
    }
    Ok(())
}

/// Builds a bootable El Torito ISO 9660 image. `boot_image` is the
/// no-emulation boot blob (Stage1+Stage2, padded to exactly 32KiB by the
/// caller) placed at the fixed boot-catalog load address; `sysroot`, if
/// given, populates the directory tree starting at the root.
pub fn build(boot_image: &[u8], sysroot: Option<&Path>) -> Result<Vec<u8>> {
    if boot_image.len() as u64 != BOOT_IMAGE_SECTORS * SECTOR_SIZE {
        bail!("ISO boot image must be exactly {} bytes", BOOT_IMAGE_SECTORS * SECTOR_SIZE);
    }

    let mut dirs = if let Some(sysroot) = sysroot {
        collect_dirs(sysroot)?
    } else {
        let mut m = BTreeMap::new();
        m.insert(String::new(), DirPlan { files: Vec::new(), subdirs: Vec::new(), extent: 0, size_sectors: 0, parent_index: 1 });
        m
    };

    // Assign directory extents in path-table order: root first, then
    // breadth-first by depth so each directory's path-table index is
    // known before its children reference it as parent.
    let mut order: Vec<String> = vec![String::new()];
    let mut frontier = vec![String::new()];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for rel in &frontier {
            let subdirs = dirs[rel].subdirs.clone();
            for sub in subdirs {
                order.push(sub.clone());
                next.push(sub);
            }
        }
        frontier = next;
    }

    let mut path_table_index: BTreeMap<String, u16> = BTreeMap::new();
    for (i, rel) in order.iter().enumerate() {
        path_table_index.insert(rel.clone(), (i + 1) as u16);
    }
    for rel in &order {
        let parent_rel = rel.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default();
        let parent_index = if rel.is_empty() { 1 } else { path_table_index[&parent_rel] };
        dirs.get_mut(rel).unwrap().parent_index = parent_index;
    }

    let mut next_sector = FIRST_DIR_SECTOR;
    for rel in &order {
        let dir = &dirs[rel];
        // ".", "..", one record per subdir, one record per file.
        let mut size = dir_record(0, 0, b"\x00", true).len() + dir_record(0, 0, b"\x01", true).len();
        for sub in &dir.subdirs {
            let name = sub.rsplit_once('/').map(|(_, n)| n).unwrap_or(sub.as_str());
            size += dir_record(0, 0, level1_name(name, true).as_bytes(), true).len();
        }
        for (name, _) in &dir.files {
            size += dir_record(0, 0, level1_name(name, false).as_bytes(), false).len();
        }
        let size_sectors = sectors_for(size);
        let plan = dirs.get_mut(rel).unwrap();
        plan.extent = next_sector;
        plan.size_sectors = size_sectors;
        next_sector += size_sectors;
    }

    let mut file_layout: BTreeMap<(String, String), (u64, usize)> = BTreeMap::new();
    for rel in &order {
        for (name, data) in &dirs[rel].files {
            file_layout.insert((rel.clone(), name.clone()), (next_sector, data.len()));
            next_sector += sectors_for(data.len());
        }
    }

    let total_sectors = next_sector;
    let mut iso = vec![0u8; (total_sectors * SECTOR_SIZE) as usize];

    write_boot_image(&mut iso, boot_image);
    write_boot_catalog(&mut iso);
    write_boot_record_descriptor(&mut iso);
    write_pvd(&mut iso, "MKIMAGE", total_sectors, dirs[""].extent, dirs[""].size_sectors * SECTOR_SIZE);
    write_vdst(&mut iso);
    write_path_tables(&mut iso, &order, &dirs);

    for rel in &order {
        write_directory(&mut iso, rel, &dirs, &file_layout);
    }
    for ((rel, name), (sector, len)) in &file_layout {
        let data = dirs[rel].files.iter().find(|(n, _)| n == name).map(|(_, d)| d).unwrap();
        let off = (*sector * SECTOR_SIZE) as usize;
        iso[off..off + len].copy_from_slice(data);
    }

    Ok(iso)
}

fn write_boot_image(iso: &mut [u8], boot_image: &[u8]) {
    let off = (BOOT_IMAGE_SECTOR * SECTOR_SIZE) as usize;
    iso[off..off + boot_image.len()].copy_from_slice(boot_image);
}

/// The El Torito validation entry's checksum word (bytes 28..30) is chosen
/// so the 16-bit LE word sum across the whole 32-byte entry is zero (spec
/// testable property 9).
fn validation_entry_checksum(validation: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for (i, chunk) in validation.chunks(2).enumerate() {
        if i == 14 {
            continue; // checksum word itself (bytes 28..30)
        }
        sum = sum.wrapping_add(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    0u16.wrapping_sub(sum)
}

/// El Torito boot catalog: validation entry plus default (bootable) entry.
fn write_boot_catalog(iso: &mut [u8]) {
    let off = (BOOT_CATALOG_SECTOR * SECTOR_SIZE) as usize;
    let cat = &mut iso[off..off + 64];

    let validation = &mut cat[0..32];
    validation[0] = 1; // header id
    validation[1] = 0; // platform: 80x86
    validation[30] = 0x55;
    validation[31] = 0xAA;
    let checksum = validation_entry_checksum(validation);
    validation[28..30].copy_from_slice(&checksum.to_le_bytes());

    let default_entry = &mut cat[32..64];
    default_entry[0] = 0x88; // bootable
    default_entry[1] = 0x00; // no emulation
    let sector_count_512 = (BOOT_IMAGE_SECTORS * SECTOR_SIZE / 512) as u16;
    default_entry[6..8].copy_from_slice(&sector_count_512.to_le_bytes());
    default_entry[8..12].copy_from_slice(&(BOOT_IMAGE_SECTOR as u32).to_le_bytes());
}

fn write_boot_record_descriptor(iso: &mut [u8]) {
    let off = (BOOT_RECORD_SECTOR * SECTOR_SIZE) as usize;
    let brvd = &mut iso[off..off + SECTOR_SIZE as usize];
    brvd[0] = 0;
    brvd[1..6].copy_from_slice(b"CD001");
    brvd[6] = 1;
    brvd[7..30].copy_from_slice(b"EL TORITO SPECIFICATION");
    brvd[71..75].copy_from_slice(&(BOOT_CATALOG_SECTOR as u32).to_le_bytes());
}

fn write_pvd(iso: &mut [u8], volume_id: &str, total_sectors: u64, root_extent: u64, root_size: u64) {
    let off = (PVD_SECTOR * SECTOR_SIZE) as usize;
    let pvd = &mut iso[off..off + SECTOR_SIZE as usize];
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;
    pvd[8..40].fill(b' ');
    pvd[40..72].fill(b' ');
    let vid = volume_id.as_bytes();
    pvd[40..40 + vid.len()].copy_from_slice(vid);
    put_u32_both(&mut pvd[80..88], total_sectors as u32);
    put_u16_both(&mut pvd[120..124], 1);
    put_u16_both(&mut pvd[124..128], 1);
    put_u16_both(&mut pvd[128..132], SECTOR_SIZE as u16);
    pvd[140..144].copy_from_slice(&(PATH_TABLE_L_SECTOR as u32).to_le_bytes());
    pvd[148..152].copy_from_slice(&(PATH_TABLE_M_SECTOR as u32).to_be_bytes());
    let rec = dir_record(root_extent, root_size, b"\x00", true);
    pvd[156..156 + rec.len()].copy_from_slice(&rec);
    pvd[190..814].fill(b' ');
    pvd[881] = 1;
}

fn write_vdst(iso: &mut [u8]) {
    let off = (VDST_SECTOR * SECTOR_SIZE) as usize;
    iso[off] = 255;
    iso[off + 1..off + 6].copy_from_slice(b"CD001");
    iso[off + 6] = 1;
}

fn write_path_tables(iso: &mut [u8], order: &[String], dirs: &BTreeMap<String, DirPlan>) {
    let mut l = Vec::new();
    let mut m = Vec::new();
    for rel in order {
        let dir = &dirs[rel];
        let name: &[u8] = if rel.is_empty() { b"\x00" } else { rel.rsplit_once('/').map(|(_, n)| n).unwrap_or(rel.as_str()).as_bytes() };
        let len = if rel.is_empty() { 1 } else { level1_name(name_str(name), true).len() };
        let ident = if rel.is_empty() { vec![0u8] } else { level1_name(name_str(name), true).into_bytes() };

        let mut le = vec![0u8; 8 + ident.len() + ident.len() % 2];
        le[0] = len as u8;
        le[2..6].copy_from_slice(&(dir.extent as u32).to_le_bytes());
        le[6..8].copy_from_slice(&dir.parent_index.to_le_bytes());
        le[8..8 + ident.len()].copy_from_slice(&ident);
        l.extend_from_slice(&le);

        let mut be = vec![0u8; 8 + ident.len() + ident.len() % 2];
        be[0] = len as u8;
        be[2..6].copy_from_slice(&(dir.extent as u32).to_be_bytes());
        be[6..8].copy_from_slice(&dir.parent_index.to_be_bytes());
        be[8..8 + ident.len()].copy_from_slice(&ident);
        m.extend_from_slice(&be);
    }
    let l_off = (PATH_TABLE_L_SECTOR * SECTOR_SIZE) as usize;
    iso[l_off..l_off + l.len()].copy_from_slice(&l);
    let m_off = (PATH_TABLE_M_SECTOR * SECTOR_SIZE) as usize;
    iso[m_off..m_off + m.len()].copy_from_slice(&m);
}

fn name_str(b: &[u8]) -> &str {
    std::str::from_utf8(b).unwrap_or("_")
}

fn write_directory(iso: &mut [u8], rel: &str, dirs: &BTreeMap<String, DirPlan>, file_layout: &BTreeMap<(String, String), (u64, usize)>) {
    let dir = &dirs[rel];
    let parent_rel = rel.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default();
    let parent_extent = if rel.is_empty() { dir.extent } else { dirs[&parent_rel].extent };
    let parent_size = if rel.is_empty() { dir.size_sectors * SECTOR_SIZE } else { dirs[&parent_rel].size_sectors * SECTOR_SIZE };

    let off = (dir.extent * SECTOR_SIZE) as usize;
    let mut pos = off;

    let dot = dir_record(dir.extent, dir.size_sectors * SECTOR_SIZE, b"\x00", true);
    iso[pos..pos + dot.len()].copy_from_slice(&dot);
    pos += dot.len();

    let dotdot = dir_record(parent_extent, parent_size, b"\x01", true);
    iso[pos..pos + dotdot.len()].copy_from_slice(&dotdot);
    pos += dotdot.len();

    for sub in &dir.subdirs {
        let sub_plan = &dirs[sub];
        let name = sub.rsplit_once('/').map(|(_, n)| n).unwrap_or(sub.as_str());
        let rec = dir_record(sub_plan.extent, sub_plan.size_sectors * SECTOR_SIZE, level1_name(name, true).as_bytes(), true);
        iso[pos..pos + rec.len()].copy_from_slice(&rec);
        pos += rec.len();
    }
    for (name, _) in &dir.files {
        let (sector, len) = file_layout[&(rel.to_string(), name.clone())];
        let rec = dir_record(sector, len as u64, level1_name(name, false).as_bytes(), false);
        iso[pos..pos + rec.len()].copy_from_slice(&rec);
        pos += rec.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_blob() -> Vec<u8> {
        let mut v = vec![0xEBu8; 16];
        v.resize((BOOT_IMAGE_SECTORS * SECTOR_SIZE) as usize, 0);
        v
    }

    #[test]
    fn boot_catalog_validation_checksum_zeroes_word_sum() {
        let mut iso = vec![0u8; (FIRST_DIR_SECTOR * SECTOR_SIZE) as usize];
        write_boot_catalog(&mut iso);
        let off = (BOOT_CATALOG_SECTOR * SECTOR_SIZE) as usize;
        let validation = &iso[off..off + 32];
        let sum: u16 = validation.chunks(2).fold(0u16, |acc, c| acc.wrapping_add(u16::from_le_bytes([c[0], c[1]])));
        assert_eq!(sum, 0);
    }

    proptest::proptest! {
        // Property 9 (spec.md §8): for any 32-byte validation entry content,
        // patching in the computed checksum word makes the full word sum
        // zero mod 2^16.
        #[test]
        fn validation_checksum_zeroes_word_sum_for_arbitrary_content(mut entry in proptest::prelude::any::<[u8; 32]>()) {
            let checksum = validation_entry_checksum(&entry);
            entry[28..30].copy_from_slice(&checksum.to_le_bytes());
            let sum: u16 = entry.chunks(2).fold(0u16, |acc, c| acc.wrapping_add(u16::from_le_bytes([c[0], c[1]])));
            proptest::prop_assert_eq!(sum, 0);
        }
    }

    #[test]
    fn builds_iso_with_magic_and_sector_alignment() {
        let iso = build(&boot_blob(), None).unwrap();
        let pvd_off = (PVD_SECTOR * SECTOR_SIZE) as usize;
        assert_eq!(&iso[pvd_off + 1..pvd_off + 6], b"CD001");
        assert_eq!(iso.len() as u64 % SECTOR_SIZE, 0);
    }

    #[test]
    fn sysroot_file_is_placed_and_named() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kernel.bin"), b"KERNELDATA").unwrap();
        let iso = build(&boot_blob(), Some(dir.path())).unwrap();
        let has_name = iso.windows(10).any(|w| w == b"KERNEL.BIN");
        assert!(has_name, "missing uppercased KERNEL.BIN identifier");
        let has_data = iso.windows(10).any(|w| w == b"KERNELDATA");
        assert!(has_data, "missing file contents");
    }
}
