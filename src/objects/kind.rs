use std::path::PathBuf;

use crate::Digest;

/// the six object kinds of §3's table, each with its own loose-path
/// extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    FileContent,
    DirTree,
    DirMeta,
    Commit,
    CommitMeta,
    TombstoneCommit,
}

impl ObjectKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ObjectKind::FileContent => "file",
            ObjectKind::DirTree => "dirtree",
            ObjectKind::DirMeta => "dirmeta",
            ObjectKind::Commit => "commit",
            ObjectKind::CommitMeta => "commitmeta",
            ObjectKind::TombstoneCommit => "tombstone-commit",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "file" => Some(ObjectKind::FileContent),
            "dirtree" => Some(ObjectKind::DirTree),
            "dirmeta" => Some(ObjectKind::DirMeta),
            "commit" => Some(ObjectKind::Commit),
            "commitmeta" => Some(ObjectKind::CommitMeta),
            "tombstone-commit" => Some(ObjectKind::TombstoneCommit),
            _ => None,
        }
    }

    /// whether this kind's written bytes are subject to the metadata
    /// hard-size-limit (file-content objects are exempt, §4.1 edge cases).
    pub fn is_metadata(&self) -> bool {
        !matches!(self, ObjectKind::FileContent)
    }
}

/// `objects/XX/YYYY...Z.EXT` beneath `objects_dir`.
pub fn loose_path(objects_dir: &std::path::Path, kind: ObjectKind, digest: &Digest) -> PathBuf {
    let (dir, file) = digest.to_path_components();
    objects_dir.join(dir).join(format!("{file}.{}", kind.extension()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_roundtrip() {
        for kind in [
            ObjectKind::FileContent,
            ObjectKind::DirTree,
            ObjectKind::DirMeta,
            ObjectKind::Commit,
            ObjectKind::CommitMeta,
            ObjectKind::TombstoneCommit,
        ] {
            assert_eq!(ObjectKind::from_extension(kind.extension()), Some(kind));
        }
    }

    #[test]
    fn file_content_is_not_metadata() {
        assert!(!ObjectKind::FileContent.is_metadata());
        assert!(ObjectKind::Commit.is_metadata());
    }

    #[test]
    fn loose_path_shape() {
        let d = Digest::of(b"x");
        let p = loose_path(std::path::Path::new("/repo/objects"), ObjectKind::DirTree, &d);
        let (dir, rest) = d.to_path_components();
        assert_eq!(p, std::path::PathBuf::from(format!("/repo/objects/{dir}/{rest}.dirtree")));
    }
}
