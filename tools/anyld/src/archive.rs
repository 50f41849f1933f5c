//! `ar` archive reader (spec §4.2.1): enough of the System V/GNU format to
//! pull ELF64 relocatable objects out of a `.a` file, including the GNU
//! long-filename extension (the `//` member and `/N` back-references into
//! it).

use anyhow::{bail, Context, Result};

const MAGIC: &[u8; 8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;

pub struct Member {
    pub name: String,
    pub data: Vec<u8>,
}

pub fn is_archive(data: &[u8]) -> bool {
    data.len() >= MAGIC.len() && &data[..MAGIC.len()] == MAGIC
}

/// Parses every member out of an `ar` archive, resolving GNU long filenames
/// via the special `//` member.
pub fn parse(data: &[u8]) -> Result<Vec<Member>> {
    if !is_archive(data) {
        bail!("not an ar archive (bad magic)");
    }
    let mut pos = MAGIC.len();
    let mut long_names: Vec<u8> = Vec::new();
    let mut members = Vec::new();

    while pos + HEADER_LEN <= data.len() {
        let header = &data[pos..pos + HEADER_LEN];
        let raw_name = std::str::from_utf8(&header[0..16])
            .context("ar header name is not valid utf-8")?
            .trim_end();
        let size_str = std::str::from_utf8(&header[48..58])
            .context("ar header size is not valid utf-8")?
            .trim();
        let size: usize = size_str
            .parse()
            .with_context(|| format!("ar header size {size_str:?}"))?;
        pos += HEADER_LEN;
        let body = data
            .get(pos..pos + size)
            .context("ar member body runs past end of file")?;

        if raw_name == "//" {
            long_names = body.to_vec();
        } else if raw_name == "/" {
            // Symbol lookup table: irrelevant, we resolve undefineds by
            // scanning every member instead.
        } else if let Some(name) = resolve_name(raw_name, &long_names) {
            members.push(Member {
                name,
                data: body.to_vec(),
            });
        }

        pos += size;
        if pos % 2 == 1 {
            pos += 1; // members are 2-byte aligned
        }
    }
    Ok(members)
}

fn resolve_name(raw: &str, long_names: &[u8]) -> Option<String> {
    if let Some(offset) = raw.strip_prefix('/').and_then(|s| s.parse::<usize>().ok()) {
        let rest = long_names.get(offset..)?;
        let end = rest.iter().position(|&b| b == b'/' || b == b'\n')?;
        return Some(String::from_utf8_lossy(&rest[..end]).into_owned());
    }
    Some(raw.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad_header(name: &str, size: usize) -> Vec<u8> {
        let mut h = vec![b' '; HEADER_LEN];
        h[0..name.len()].copy_from_slice(name.as_bytes());
        let size_str = size.to_string();
        h[48..48 + size_str.len()].copy_from_slice(size_str.as_bytes());
        h[58] = b'`';
        h[59] = b'\n';
        h
    }

    fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        for (name, body) in members {
            out.extend_from_slice(&pad_header(&format!("{name}/"), body.len()));
            out.extend_from_slice(body);
            if body.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn parses_short_names() {
        let archive = build_archive(&[("a.o", b"AAAA"), ("b.o", b"BBB")]);
        let members = parse(&archive).unwrap();
        assert_eq!(members[0].name, "a.o");
        assert_eq!(members[0].data, b"AAAA");
        assert_eq!(members[1].name, "b.o");
        assert_eq!(members[1].data, b"BBB");
    }

    #[test]
    fn resolves_gnu_long_filename_table() {
        let long_names: &[u8] = b"a_very_long_object_name.o/\n";
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&pad_header("//", long_names.len()));
        out.extend_from_slice(long_names);
        if long_names.len() % 2 == 1 {
            out.push(b'\n');
        }
        out.extend_from_slice(&pad_header("/0", 3));
        out.extend_from_slice(b"XYZ");
        let members = parse(&out).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "a_very_long_object_name.o");
        assert_eq!(members[0].data, b"XYZ");
    }
}
