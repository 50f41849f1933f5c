//! Thin tar.gz + JSON index glue (spec.md §1: excluded from core, no
//! internal algorithmic complexity). `pack` walks a directory into a
//! gzip-compressed tar with an `index.json` manifest entry; `unpack`
//! reverses it; `list` reads the manifest back out without extracting.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

use crate::index::{Index, IndexEntry};

const INDEX_NAME: &str = "index.json";

pub fn pack(src_dir: &Path, out: &Path) -> Result<()> {
    let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);

    let mut index = Index::default();
    for entry in WalkDir::new(src_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .expect("walkdir yields paths under src_dir");
        let size = entry.metadata()?.len();
        builder
            .append_path_with_name(entry.path(), rel)
            .with_context(|| format!("adding {} to archive", entry.path().display()))?;
        index.entries.push(IndexEntry {
            path: rel.to_string_lossy().replace('\\', "/"),
            size,
        });
    }

    let index_json = serde_json::to_vec_pretty(&index).context("serializing index")?;
    let mut header = tar::Header::new_gnu();
    header.set_size(index_json.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, INDEX_NAME, index_json.as_slice())
        .context("writing index.json into archive")?;

    builder.into_inner().context("flushing archive")?.finish().context("finishing gzip stream")?;
    Ok(())
}

pub fn unpack(archive: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let dec = GzDecoder::new(file);
    let mut ar = tar::Archive::new(dec);
    ar.unpack(dest_dir)
        .with_context(|| format!("extracting into {}", dest_dir.display()))?;
    Ok(())
}

pub fn list(archive: &Path) -> Result<Index> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let dec = GzDecoder::new(file);
    let mut ar = tar::Archive::new(dec);
    for entry in ar.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == INDEX_NAME {
            let index: Index = serde_json::from_reader(&mut entry).context("parsing index.json")?;
            return Ok(index);
        }
    }
    anyhow::bail!("archive {} has no index.json entry", archive.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn pack_then_list_reports_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a.txt"), b"hello").unwrap();
        fs::create_dir(src.join("sub")).unwrap();
        fs::write(src.join("sub/b.txt"), b"world!").unwrap();

        let out = dir.path().join("out.tar.gz");
        pack(&src, &out).unwrap();

        let index = list(&out).unwrap();
        let mut paths: Vec<_> = index.entries.iter().map(|e| e.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.txt".to_string(), "sub/b.txt".to_string()]);
        let a = index.entries.iter().find(|e| e.path == "a.txt").unwrap();
        assert_eq!(a.size, 5);
    }

    #[test]
    fn pack_then_unpack_round_trips_file_contents() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("f.bin"), [1u8, 2, 3, 4]).unwrap();
        let archive = root.path().join("out.tar.gz");
        pack(&src, &archive).unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&archive, dest.path()).unwrap();
        let roundtrip = fs::read(dest.path().join("f.bin")).unwrap();
        assert_eq!(roundtrip, vec![1, 2, 3, 4]);
    }
}
