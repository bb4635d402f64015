//! Filesystem-side stat/read helpers used by `CommitEngine` to walk a live
//! source directory (§4.3's per-file write path). Reading a commit back out
//! onto a real filesystem ("checkout") is the boot/deployment system's job
//! and is out of scope (§1).

use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::{Error, IoResultExt, Result};
use crate::objects::Xattr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileType {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_file() {
            FileType::Regular
        } else if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Symlink
        } else {
            FileType::Other
        }
    }
}

/// stat of one directory entry, enough to drive the commit write path and
/// to hand to a `CommitModifier` filter/xattr callback.
#[derive(Debug, Clone)]
pub struct EntryStat {
    pub file_type: FileType,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
}

impl EntryStat {
    /// does not follow symlinks.
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).with_path(path)?;
        Ok(Self::from_std_metadata(&meta))
    }

    pub fn from_std_metadata(meta: &Metadata) -> Self {
        Self {
            file_type: FileType::from_metadata(meta),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
            size: meta.len(),
            dev: meta.dev(),
            ino: meta.ino(),
            nlink: meta.nlink(),
        }
    }

    /// only regular files with more than one link are hardlink candidates
    /// for the devino cache (§4.3 step 2).
    pub fn could_be_hardlink(&self) -> bool {
        self.file_type == FileType::Regular && self.nlink > 1
    }
}

/// reads all extended attributes from a path, sorted by name.
pub fn read_xattrs(path: &Path) -> Result<Vec<Xattr>> {
    let mut xattrs = Vec::new();
    let names: Vec<String> = match xattr::list(path) {
        Ok(iter) => iter.map(|n| n.to_string_lossy().into_owned()).collect(),
        Err(e) => {
            if matches!(
                e.raw_os_error(),
                Some(libc_enotsup) if libc_enotsup == nix::libc::ENOTSUP || libc_enotsup == nix::libc::ENODATA
            ) {
                return Ok(vec![]);
            }
            return Err(Error::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, format!("xattr list failed: {e}")),
            });
        }
    };

    for name in names {
        match xattr::get(path, &name) {
            Ok(Some(value)) => xattrs.push(Xattr::new(name, value)),
            Ok(None) => {}
            Err(e) => {
                if e.raw_os_error() != Some(nix::libc::ENODATA) {
                    tracing::warn!(path = %path.display(), xattr = %name, error = %e, "failed to read xattr");
                }
            }
        }
    }

    xattrs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(xattrs)
}

/// reads a symlink's target as a UTF-8 string.
pub fn read_symlink_target(path: &Path) -> Result<String> {
    let target = fs::read_link(path).with_path(path)?;
    Ok(target.to_string_lossy().into_owned())
}
