// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{config::Config, rid::Rid};
use std::{
    io::Write,
    path::{Path, PathBuf},
};

/// Every on-disk structure reserves this much space for its header.
pub const HEADER_SIZE: usize = 512;

pub const METADATA_FILE: &str = "metadata.nt";
pub const RUNTIME_INFO_FILE: &str = "runtime.info";

/// Characters permitted in a KB name.
pub const LEGAL_KB_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";

#[must_use]
pub fn kb_name_is_legal(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| LEGAL_KB_CHARS.contains(c))
}

#[must_use]
pub fn kb_dir(config: &Config, kb: &str) -> PathBuf {
    config.store_root.join(kb)
}

#[must_use]
pub fn metadata_path(config: &Config, kb: &str) -> PathBuf {
    kb_dir(config, kb).join(METADATA_FILE)
}

#[must_use]
pub fn runtime_info_path(config: &Config, kb: &str) -> PathBuf {
    kb_dir(config, kb).join(RUNTIME_INFO_FILE)
}

/// Segment directories are named with 4 hex digits so they sort.
#[must_use]
pub fn segment_dir(config: &Config, kb: &str, segment: u32) -> PathBuf {
    kb_dir(config, kb).join(format!("{segment:04x}"))
}

#[must_use]
pub fn rhash_path(seg_dir: &Path, label: &str) -> PathBuf {
    seg_dir.join(format!("{label}.rhash"))
}

#[must_use]
pub fn lex_path(seg_dir: &Path, label: &str) -> PathBuf {
    seg_dir.join(format!("{label}.lex"))
}

#[must_use]
pub fn mhash_path(seg_dir: &Path, label: &str) -> PathBuf {
    seg_dir.join(format!("{label}.mhash"))
}

#[must_use]
pub fn tbchain_path(seg_dir: &Path, label: &str) -> PathBuf {
    seg_dir.join(format!("{label}.tbchain"))
}

#[must_use]
pub fn ptable_path(seg_dir: &Path, label: &str) -> PathBuf {
    seg_dir.join(format!("{label}.ptable"))
}

#[must_use]
pub fn list_path(seg_dir: &Path, label: &str) -> PathBuf {
    seg_dir.join(format!("{label}.list"))
}

/// One ptree per predicate per direction; `pk` is `'s'` or `'o'`.
#[must_use]
pub fn ptree_path(seg_dir: &Path, pk: char, pred: Rid) -> PathBuf {
    seg_dir.join(format!("p{pk}-{:016x}.ptree", pred.0))
}

/// Per-graph triple lists fan out over two levels of hash-prefix
/// directories so one directory never holds millions of entries.
#[must_use]
pub fn tlist_path(seg_dir: &Path, graph: Rid) -> PathBuf {
    let hex = format!("{:016x}", graph.0);
    seg_dir
        .join("m")
        .join(&hex[0..2])
        .join(&hex[2..4])
        .join(format!("{hex}.tlist"))
}

#[must_use]
pub fn tlist_root(seg_dir: &Path) -> PathBuf {
    seg_dir.join("m")
}

#[must_use]
pub fn lock_path(seg_dir: &Path, name: &str) -> PathBuf {
    seg_dir.join(format!("{name}.lock"))
}

/// Atomically rewrites a file.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let folder = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        fsync_directory(folder)?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}

/// Free space (GB) on the filesystem holding `path`.
///
/// Errs on the side of permitting writes when the filesystem cannot be
/// inspected.
#[must_use]
pub fn free_disk_gb(path: &Path) -> f64 {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;

        let Ok(cstr) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
            return 50.0;
        };

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: cstr is NUL-terminated and stat is a plain-data out param
        if unsafe { libc::statvfs(cstr.as_ptr(), &mut stat) } != 0 {
            log::warn!(
                "cannot statvfs {path:?}: {}",
                std::io::Error::last_os_error()
            );

            return 50.0;
        }

        #[allow(clippy::cast_precision_loss)]
        {
            (stat.f_bavail as f64 * stat.f_frsize as f64) / (1024.0 * 1024.0 * 1024.0)
        }
    }

    #[cfg(not(unix))]
    {
        50.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn atomic_rewrite() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = dir.path().join("test.txt");
        std::fs::write(&path, "asdasdasdasdasd")?;

        rewrite_atomic(&path, b"newcontent")?;

        assert_eq!("newcontent", std::fs::read_to_string(&path)?);

        Ok(())
    }

    #[test]
    fn tlist_fanout() {
        let path = tlist_path(Path::new("/seg"), Rid(0xabcd_ef01_2345_6789));
        assert_eq!(
            PathBuf::from("/seg/m/ab/cd/abcdef0123456789.tlist"),
            path
        );
    }

    #[test]
    fn kb_names() {
        assert!(kb_name_is_legal("my_kb_01"));
        assert!(!kb_name_is_legal(""));
        assert!(!kb_name_is_legal("../escape"));
        assert!(!kb_name_is_legal("white space"));
    }

    #[test]
    fn free_disk_is_positive() {
        assert!(free_disk_gb(Path::new("/")) >= 0.0);
    }
}
