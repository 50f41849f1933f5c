//! In-process `-E` builtins (spec §4.1.7): a handful of file/dir operations
//! the executor runs without forking when a command's argv starts with
//! `<self> -E <subcommand>`.

use std::path::Path;

use anyhow::{bail, Result};

/// If `argv` starts with `self_exe -E <subcommand> ...`, runs it in-process
/// and returns `Some(result)`. Otherwise returns `None` so the caller knows
/// to fork a real child process.
pub fn try_run(self_exe: &Path, argv: &[String]) -> Option<Result<()>> {
    if argv.len() < 3 {
        return None;
    }
    if !matches_self(self_exe, &argv[0]) || argv[1] != "-E" {
        return None;
    }
    let sub = argv[2].as_str();
    let rest = &argv[3..];
    Some(match sub {
        "make_directory" => make_directory(rest),
        "copy" => copy(rest),
        "copy_directory" => copy_directory(rest),
        "rm" => rm(rest),
        "touch" => touch(rest),
        "echo" => {
            println!("{}", rest.join(" "));
            Ok(())
        }
        "compare_files" => compare_files(rest),
        _ => Ok(()), // unrecognized -E subcommand: silently ignored.
    })
}

fn matches_self(self_exe: &Path, candidate: &str) -> bool {
    let candidate = Path::new(candidate);
    candidate == self_exe
        || candidate.file_name() == self_exe.file_name() && candidate.file_name().is_some()
}

fn make_directory(args: &[String]) -> Result<()> {
    for dir in args {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn copy(args: &[String]) -> Result<()> {
    // `-E copy <file>... <dest>`
    let Some((dest, sources)) = args.split_last() else {
        return Ok(());
    };
    let dest_path = Path::new(dest);
    for src in sources {
        let target = if dest_path.is_dir() {
            dest_path.join(Path::new(src).file_name().unwrap_or_default())
        } else {
            dest_path.to_path_buf()
        };
        std::fs::copy(src, target)?;
    }
    Ok(())
}

fn copy_directory(args: &[String]) -> Result<()> {
    let Some((dest, sources)) = args.split_last() else {
        return Ok(());
    };
    for src in sources {
        copy_dir_recursive(Path::new(src), Path::new(dest))?;
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &to)?;
        } else {
            std::fs::copy(entry.path(), to)?;
        }
    }
    Ok(())
}

fn rm(args: &[String]) -> Result<()> {
    for a in args {
        if a.starts_with('-') {
            continue; // variant flags (-f, -r, -rf, ...) ignored per spec.
        }
        let p = Path::new(a);
        if p.is_dir() {
            let _ = std::fs::remove_dir_all(p);
        } else {
            let _ = std::fs::remove_file(p);
        }
    }
    Ok(())
}

fn touch(args: &[String]) -> Result<()> {
    for a in args {
        if !Path::new(a).exists() {
            std::fs::write(a, [])?;
        } else {
            let now = std::time::SystemTime::now();
            filetime_bump(a, now)?;
        }
    }
    Ok(())
}

fn filetime_bump(path: &str, _now: std::time::SystemTime) -> Result<()> {
    // Re-writing the file's own bytes back is the simplest portable way to
    // bump mtime without a filetime dependency.
    let data = std::fs::read(path)?;
    std::fs::write(path, data)?;
    Ok(())
}

fn compare_files(args: &[String]) -> Result<()> {
    let (Some(a), Some(b)) = (args.first(), args.get(1)) else {
        bail!("compare_files requires two paths");
    };
    let (da, db) = (std::fs::read(a)?, std::fs::read(b)?);
    if da != db {
        bail!("files differ: {a} {b}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn recognizes_self_invocation() {
        let self_exe = PathBuf::from("/usr/bin/amake");
        let argv = vec![
            "/usr/bin/amake".to_string(),
            "-E".to_string(),
            "touch".to_string(),
            "/tmp/does-not-matter".to_string(),
        ];
        assert!(matches_self(&self_exe, &argv[0]));
        assert!(try_run(&self_exe, &["other".to_string()]).is_none());
    }

    #[test]
    fn make_directory_and_touch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("a/b");
        make_directory(&[sub.to_string_lossy().into_owned()]).unwrap();
        assert!(sub.is_dir());
        let file = sub.join("f");
        touch(&[file.to_string_lossy().into_owned()]).unwrap();
        assert!(file.is_file());
    }
}
