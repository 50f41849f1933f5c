//! FAT16 writer for the UEFI ESP (spec §4.4.3): classic BPB, one FAT pair,
//! a fixed 512-entry root directory, and long-filename (VFAT) entries for
//! names that don't fit 8.3.

use std::path::Path;

use anyhow::{bail, Context, Result};

const SECTOR_SIZE: usize = 512;
const ROOT_ENTRIES: usize = 512;
const SECTORS_PER_CLUSTER: u8 = 1;

struct Fat16Builder {
    total_sectors: u32,
    fat: Vec<u16>,
    data: Vec<u8>, // cluster heap, cluster N at data[(N-2)*cluster_size..]
    cluster_size: usize,
    root: Vec<u8>, // fixed-size root directory region
    next_free: u16,
}

impl Fat16Builder {
    fn new(total_sectors: u32) -> Self {
        let cluster_size = SECTOR_SIZE * SECTORS_PER_CLUSTER as usize;
        let reserved_for_root = (ROOT_ENTRIES * 32).div_ceil(SECTOR_SIZE);
        // Solve for the cluster count that leaves room for two FAT copies
        // (whose own size depends on the cluster count) plus the root
        // region; a few fixed-point iterations converge immediately since
        // fat_sectors changes by at most one sector per iteration.
        let mut cluster_count = (total_sectors as usize - 1 - reserved_for_root) / SECTORS_PER_CLUSTER as usize;
        for _ in 0..4 {
            let fat_sectors = ((cluster_count + 2) * 2).div_ceil(SECTOR_SIZE);
            let usable_sectors = total_sectors as usize - 1 - 2 * fat_sectors - reserved_for_root;
            cluster_count = usable_sectors / SECTORS_PER_CLUSTER as usize;
        }
        let mut fat = vec![0u16; cluster_count + 2];
        fat[0] = 0xFFF8;
        fat[1] = 0xFFFF;
        Fat16Builder {
            total_sectors,
            fat,
            data: vec![0u8; cluster_count * cluster_size],
            cluster_size,
            root: vec![0u8; ROOT_ENTRIES * 32],
            next_free: 2,
        }
    }

    fn alloc_chain(&mut self, bytes: &[u8]) -> Result<u16> {
        let first = self.next_free;
        let mut prev: Option<u16> = None;
        let mut cur = first;
        for chunk in bytes.chunks(self.cluster_size) {
            if cur as usize - 2 >= self.fat.len() - 2 {
                bail!("FAT16 ESP exhausted: no free clusters");
            }
            let off = (cur as usize - 2) * self.cluster_size;
            self.data[off..off + chunk.len()].copy_from_slice(chunk);
            if let Some(p) = prev {
                self.fat[p as usize] = cur;
            }
            prev = Some(cur);
            cur += 1;
        }
        if let Some(p) = prev {
            self.fat[p as usize] = 0xFFFF;
        } else {
            // zero-length file: still needs one cluster by convention here.
            self.fat[first as usize] = 0xFFFF;
            cur += 1;
        }
        self.next_free = cur;
        Ok(first)
    }
}

fn short_name_candidate(name: &str, tail: u32) -> [u8; 11] {
    let upper: String = name.to_uppercase().chars().filter(|c| !c.is_whitespace()).collect();
    let (base, ext) = match upper.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (upper.as_str(), ""),
    };
    let sanitize = |s: &str, len: usize| -> Vec<u8> {
        let mut out: Vec<u8> = s
            .bytes()
            .filter(|b| !b" +,;=[]".contains(b))
            .collect();
        out.truncate(len);
        out
    };
    let mut base_bytes = sanitize(base, 8);
    if tail > 0 {
        let suffix = format!("~{tail}");
        let keep = 8usize.saturating_sub(suffix.len());
        base_bytes.truncate(keep);
        base_bytes.extend_from_slice(suffix.as_bytes());
    }
    let ext_bytes = sanitize(ext, 3);

    let mut out = [b' '; 11];
    out[..base_bytes.len()].copy_from_slice(&base_bytes);
    out[8..8 + ext_bytes.len()].copy_from_slice(&ext_bytes);
    out
}

fn needs_lfn(name: &str) -> bool {
    let upper_ascii = name.chars().all(|c| c.is_ascii() && !c.is_lowercase());
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    !upper_ascii || base.len() > 8 || ext.len() > 3 || base.contains(' ') || name.bytes().any(|b| b" +,;=[]".contains(&b))
}

fn short_checksum(short_name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in short_name {
        sum = (sum >> 1).wrapping_add(sum << 7).wrapping_add(b);
    }
    sum
}

fn lfn_entries(name: &str, checksum: u8) -> Vec<[u8; 32]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut padded = units.clone();
    padded.push(0x0000);
    while !padded.len().is_multiple_of(13) {
        padded.push(0xFFFF);
    }
    let chunk_count = padded.len() / 13;
    let mut entries = Vec::with_capacity(chunk_count);
    for (i, chunk) in padded.chunks(13).enumerate() {
        let mut e = [0u8; 32];
        let seq = (i + 1) as u8;
        let is_last = i == chunk_count - 1;
        e[0] = if is_last { seq | 0x40 } else { seq };
        for (j, &u) in chunk[0..5.min(chunk.len())].iter().enumerate() {
            e[1 + j * 2..3 + j * 2].copy_from_slice(&u.to_le_bytes());
        }
        e[11] = 0x0F; // attribute: LFN
        e[12] = 0; // type
        e[13] = checksum;
        for (j, &u) in chunk[5..11.min(chunk.len())].iter().enumerate() {
            e[14 + j * 2..16 + j * 2].copy_from_slice(&u.to_le_bytes());
        }
        e[26..28].copy_from_slice(&0u16.to_le_bytes()); // first cluster (lfn): 0
        for (j, &u) in chunk[11..13.min(chunk.len())].iter().enumerate() {
            e[28 + j * 2..30 + j * 2].copy_from_slice(&u.to_le_bytes());
        }
        entries.push(e);
    }
    entries.reverse(); // stored highest-order-first, immediately before the short entry
    entries
}

const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE: u8 = 0x20;

fn short_entry(short_name: [u8; 11], attr: u8, first_cluster: u16, size: u32) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[0..11].copy_from_slice(&short_name);
    e[11] = attr;
    e[26..28].copy_from_slice(&first_cluster.to_le_bytes());
    e[28..32].copy_from_slice(&size.to_le_bytes());
    e
}

/// One named entry destined for a FAT16 directory region (root or a
/// subdirectory cluster chain): its short 8.3 name, optional LFN entries,
/// and the short entry itself.
fn build_entries(name: &str, attr: u8, first_cluster: u16, size: u32, used_shorts: &mut Vec<[u8; 11]>) -> Vec<u8> {
    let mut tail = 0u32;
    let short = loop {
        let candidate = short_name_candidate(name, tail);
        if !used_shorts.contains(&candidate) {
            break candidate;
        }
        tail += 1;
    };
    used_shorts.push(short);

    let mut bytes = Vec::new();
    if needs_lfn(name) {
        let checksum = short_checksum(&short);
        for entry in lfn_entries(name, checksum) {
            bytes.extend_from_slice(&entry);
        }
    }
    bytes.extend_from_slice(&short_entry(short, attr, first_cluster, size));
    bytes
}

fn write_dir_region(region: &mut [u8], entries: &[u8]) -> Result<()> {
    if entries.len() > region.len() {
        bail!("FAT16 directory region too small for entry set");
    }
    region[..entries.len()].copy_from_slice(entries);
    Ok(())
}

/// Builds a FAT16 ESP image of `total_sectors` sectors containing the
/// given `(esp_relative_path, file_bytes)` pairs (paths use `/` separators,
/// e.g. `EFI/BOOT/BOOTX64.EFI`).
pub fn build(total_sectors: u32, files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut b = Fat16Builder::new(total_sectors);

    // Group files by parent directory so each directory's entries are
    // written together and subdirectories get their own cluster chains.
    use std::collections::BTreeMap;
    let mut tree: BTreeMap<String, Vec<(String, Vec<u8>)>> = BTreeMap::new();
    for (path, data) in files {
        let p = Path::new(path);
        let parent = p.parent().map(|p| p.to_string_lossy().replace('\\', "/")).unwrap_or_default();
        let fname = p.file_name().context("ESP file path has no filename")?.to_string_lossy().into_owned();
        tree.entry(parent).or_default().push((fname, data.clone()));
    }

    // Ensure every ancestor directory exists, even if empty.
    let mut all_dirs: std::collections::BTreeSet<String> = tree.keys().cloned().collect();
    for dir in tree.keys() {
        let mut cur = dir.as_str();
        while let Some((head, _)) = cur.rsplit_once('/') {
            all_dirs.insert(head.to_string());
            cur = head;
        }
    }
    all_dirs.insert(String::new());

    // Allocate a directory cluster for every non-root directory, deepest
    // first so children's clusters are known when building their parent.
    let mut dir_clusters: BTreeMap<String, u16> = BTreeMap::new();
    let mut dirs_by_depth: Vec<&String> = all_dirs.iter().filter(|d| !d.is_empty()).collect();
    dirs_by_depth.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));

    for dir in &dirs_by_depth {
        let mut used_shorts = Vec::new();
        let mut entries = Vec::new();
        // `.` and `..` placeholders point at this directory/parent; fixed
        // up with real cluster numbers once both clusters are known, so
        // start with a zero-filled chain sized for current children and
        // patch below.
        let children = tree.get(dir.as_str()).cloned().unwrap_or_default();
        for (name, data) in &children {
            let is_dir = all_dirs.contains(&format!("{dir}/{name}")) || all_dirs.contains(name);
            if is_dir {
                continue; // handled as a subdirectory entry below
            }
            let cluster = b.alloc_chain(data)?;
            entries.extend(build_entries(name, ATTR_ARCHIVE, cluster, data.len() as u32, &mut used_shorts));
        }
        for sub in dirs_by_depth.iter().filter(|d| {
            let parent = d.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            parent == dir.as_str() || (dir.is_empty() && !d.contains('/'))
        }) {
            let sub_name = sub.rsplit_once('/').map(|(_, n)| n).unwrap_or(sub.as_str());
            let cluster = *dir_clusters.entry((*sub).clone()).or_insert(0);
            if cluster != 0 {
                entries.extend(build_entries(sub_name, ATTR_DIRECTORY, cluster, 0, &mut used_shorts));
            }
        }

        let region_size = (entries.len() + 64).max(b.cluster_size).div_ceil(b.cluster_size) * b.cluster_size;
        let mut region = vec![0u8; region_size];
        write_dir_region(&mut region, &entries)?;
        let cluster = b.alloc_chain(&region)?;
        dir_clusters.insert((*dir).clone(), cluster);
    }

    // Re-link `.`/`..` now every directory's cluster is known.
    for dir in &dirs_by_depth {
        let cluster = dir_clusters[*dir];
        let parent = dir.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default();
        let parent_cluster = if parent.is_empty() { 0 } else { dir_clusters[&parent] };
        let off = (cluster as usize - 2) * b.cluster_size;
        let dot = short_entry(*b"..         ", ATTR_DIRECTORY, cluster, 0);
        let dotdot = short_entry(*b"..         ", ATTR_DIRECTORY, parent_cluster, 0);
        b.data[off..off + 32].copy_from_slice(&dot);
        b.data[off + 32..off + 64].copy_from_slice(&dotdot);
    }

    // Root directory entries.
    let mut used_shorts = Vec::new();
    let mut root_entries = Vec::new();
    if let Some(children) = tree.get("") {
        for (name, data) in children {
            if all_dirs.contains(name.as_str()) {
                continue;
            }
            let cluster = b.alloc_chain(data)?;
            root_entries.extend(build_entries(name, ATTR_ARCHIVE, cluster, data.len() as u32, &mut used_shorts));
        }
    }
    for sub in dirs_by_depth.iter().filter(|d| !d.contains('/')) {
        let cluster = dir_clusters[*sub];
        root_entries.extend(build_entries(sub, ATTR_DIRECTORY, cluster, 0, &mut used_shorts));
    }
    write_dir_region(&mut b.root, &root_entries)?;

    assemble(&b)
}

fn assemble(b: &Fat16Builder) -> Result<Vec<u8>> {
    let mut image = vec![0u8; b.total_sectors as usize * SECTOR_SIZE];
    let bpb = &mut image[0..SECTOR_SIZE];
    bpb[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    bpb[3..11].copy_from_slice(b"MKIMAGE ");
    bpb[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    bpb[13] = SECTORS_PER_CLUSTER;
    bpb[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved sectors
    bpb[16] = 2; // number of FATs
    bpb[17..19].copy_from_slice(&(ROOT_ENTRIES as u16).to_le_bytes());
    let fat_sectors = (b.fat.len() * 2).div_ceil(SECTOR_SIZE) as u16;
    if b.total_sectors < 0x10000 {
        bpb[19..21].copy_from_slice(&(b.total_sectors as u16).to_le_bytes());
    }
    bpb[21] = 0xF8; // media descriptor: fixed disk
    bpb[22..24].copy_from_slice(&fat_sectors.to_le_bytes());
    bpb[36] = 0x80; // drive number
    bpb[38] = 0x29; // extended boot signature
    bpb[43..54].copy_from_slice(b"MKIMAGE ESP");
    bpb[54..62].copy_from_slice(b"FAT16   ");
    bpb[510] = 0x55;
    bpb[511] = 0xAA;

    let reserved_sectors = 1usize;
    let fat1_off = reserved_sectors * SECTOR_SIZE;
    let fat2_off = fat1_off + fat_sectors as usize * SECTOR_SIZE;
    for (i, &entry) in b.fat.iter().enumerate() {
        let off = i * 2;
        image[fat1_off + off..fat1_off + off + 2].copy_from_slice(&entry.to_le_bytes());
        image[fat2_off + off..fat2_off + off + 2].copy_from_slice(&entry.to_le_bytes());
    }

    let root_off = fat2_off + fat_sectors as usize * SECTOR_SIZE;
    image[root_off..root_off + b.root.len()].copy_from_slice(&b.root);

    let data_off = root_off + b.root.len();
    image[data_off..data_off + b.data.len()].copy_from_slice(&b.data);

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_for_long_ascii_name_gets_tilde_suffix() {
        let n = short_name_candidate("BOOTX64.EFI", 0);
        assert_eq!(&n, b"BOOTX64 EFI");
    }

    #[test]
    fn lfn_required_for_lowercase_names() {
        assert!(needs_lfn("bootx64.efi"));
        assert!(!needs_lfn("KERNEL.BIN"));
    }

    #[test]
    fn build_places_bootloader_and_is_fat16_signed() {
        let files = vec![("EFI/BOOT/BOOTX64.EFI".to_string(), vec![1u8, 2, 3, 4])];
        let image = build(6144, &files).unwrap(); // 3MiB
        assert_eq!(image[510], 0x55);
        assert_eq!(image[511], 0xAA);
        assert_eq!(&image[54..62], b"FAT16   ");
    }
}
