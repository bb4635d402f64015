//! Branch pointers (§4.5): flat `refs/heads/<name>`, remote-scoped
//! `refs/remotes/<remote>/<name>`, and collection-mirror-scoped
//! `refs/mirrors/<collection>/<name>` namespaces, plus a refspec grammar
//! that resolves `remote:name`, collection-qualified names, ref aliases,
//! and literal 64-hex-digit digests. Grounded in the prior flat-namespace
//! `write_ref`'s atomic temp-write-then-rename-then-fsync pattern,
//! generalized to three namespaces and to alias indirection.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::repo::Repo;
use crate::Digest;

const MAX_ALIAS_DEPTH: u32 = 16;

fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidArgument(format!("invalid ref name: {name:?}")));
    }
    for component in name.split('/') {
        if component.is_empty() || component == "." || component == ".." || component.contains('\0') {
            return Err(Error::InvalidArgument(format!("invalid ref name: {name:?}")));
        }
    }
    Ok(())
}

/// a ref file's content: either a direct digest or an alias pointing at
/// another refspec, resolved transitively by `RefStore::resolve`.
pub enum RefContents {
    Digest(Digest),
    Alias(String),
}

impl RefContents {
    fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Some(target) = text.strip_prefix("ref: ") {
            return Ok(RefContents::Alias(target.trim().to_string()));
        }
        match Digest::try_from_hex(text) {
            Some(d) => Ok(RefContents::Digest(d)),
            None => Err(Error::MalformedObject(format!("unreadable ref contents: {text:?}"))),
        }
    }

    fn serialize(&self) -> String {
        match self {
            RefContents::Digest(d) => d.to_hex(),
            RefContents::Alias(target) => format!("ref: {target}"),
        }
    }
}

/// manages the three ref namespaces under one repository (§4.5).
pub struct RefStore<'a> {
    repo: &'a Repo,
    fsync: bool,
}

impl<'a> RefStore<'a> {
    pub fn new(repo: &'a Repo) -> Self {
        Self { repo, fsync: repo.config().core.fsync }
    }

    fn heads_path(&self, name: &str) -> PathBuf {
        self.repo.refs_path().join(name)
    }

    fn remote_path(&self, remote: &str, name: &str) -> PathBuf {
        self.repo.remote_refs_path().join(remote).join(name)
    }

    fn mirror_path(&self, collection: &str, name: &str) -> PathBuf {
        self.repo.mirror_refs_path().join(collection).join(name)
    }

    fn write_contents(&self, path: &Path, contents: &RefContents) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let tmp_path = self.repo.tmp_path().join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(self.repo.tmp_path()).with_path(&self.repo.tmp_path())?;
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            write!(tmp_file, "{}", contents.serialize()).with_path(&tmp_path)?;
            if self.fsync {
                tmp_file.sync_all().with_path(&tmp_path)?;
            }
        }
        fs::rename(&tmp_path, path).with_path(path)?;
        if self.fsync {
            if let Some(parent) = path.parent() {
                let dir = File::open(parent).with_path(parent)?;
                dir.sync_all().with_path(parent)?;
            }
        }
        Ok(())
    }

    fn read_contents(&self, path: &Path) -> Result<Option<RefContents>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(RefContents::parse(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io { path: path.to_path_buf(), source: e }),
        }
    }

    fn delete_path(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io { path: path.to_path_buf(), source: e }),
        }
    }

    fn list_dir(&self, dir: &Path, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if !dir.is_dir() {
            return Ok(out);
        }
        collect_ref_names(dir, prefix, &mut out)?;
        out.sort();
        Ok(out)
    }

    // --- flat `refs/heads` namespace ---

    pub fn set_ref(&self, name: &str, digest: Digest) -> Result<()> {
        validate_ref_name(name)?;
        self.write_contents(&self.heads_path(name), &RefContents::Digest(digest))
    }

    /// writes `name` as an alias resolving to `target_refspec` rather than
    /// a direct digest.
    pub fn set_alias(&self, name: &str, target_refspec: &str) -> Result<()> {
        validate_ref_name(name)?;
        self.write_contents(&self.heads_path(name), &RefContents::Alias(target_refspec.to_string()))
    }

    pub fn delete_ref(&self, name: &str) -> Result<()> {
        validate_ref_name(name)?;
        self.delete_path(&self.heads_path(name))
    }

    /// reads `name`'s immediate contents without following aliases; use
    /// `resolve` to follow a refspec to its final digest.
    pub fn read_ref(&self, name: &str) -> Result<Option<Digest>> {
        validate_ref_name(name)?;
        match self.read_contents(&self.heads_path(name))? {
            Some(RefContents::Digest(d)) => Ok(Some(d)),
            Some(RefContents::Alias(target)) => self.resolve(&target).map(Some),
            None => Ok(None),
        }
    }

    pub fn list_refs(&self) -> Result<Vec<String>> {
        self.list_dir(&self.repo.refs_path(), "")
    }

    // --- remote-scoped `refs/remotes/<remote>` namespace ---

    pub fn set_remote_ref(&self, remote: &str, name: &str, digest: Digest) -> Result<()> {
        validate_ref_name(remote)?;
        validate_ref_name(name)?;
        self.write_contents(&self.remote_path(remote, name), &RefContents::Digest(digest))
    }

    pub fn delete_remote_ref(&self, remote: &str, name: &str) -> Result<()> {
        validate_ref_name(remote)?;
        validate_ref_name(name)?;
        self.delete_path(&self.remote_path(remote, name))
    }

    pub fn read_remote_ref(&self, remote: &str, name: &str) -> Result<Option<Digest>> {
        validate_ref_name(remote)?;
        validate_ref_name(name)?;
        match self.read_contents(&self.remote_path(remote, name))? {
            Some(RefContents::Digest(d)) => Ok(Some(d)),
            Some(RefContents::Alias(target)) => self.resolve(&target).map(Some),
            None => Ok(None),
        }
    }

    pub fn list_remote_refs(&self, remote: &str) -> Result<Vec<String>> {
        validate_ref_name(remote)?;
        self.list_dir(&self.repo.remote_refs_path().join(remote), "")
    }

    // --- collection-mirror-scoped `refs/mirrors/<collection>` namespace ---

    pub fn set_collection_ref(&self, collection: &str, name: &str, digest: Digest) -> Result<()> {
        validate_ref_name(collection)?;
        validate_ref_name(name)?;
        self.write_contents(&self.mirror_path(collection, name), &RefContents::Digest(digest))
    }

    pub fn delete_collection_ref(&self, collection: &str, name: &str) -> Result<()> {
        validate_ref_name(collection)?;
        validate_ref_name(name)?;
        self.delete_path(&self.mirror_path(collection, name))
    }

    pub fn read_collection_ref(&self, collection: &str, name: &str) -> Result<Option<Digest>> {
        validate_ref_name(collection)?;
        validate_ref_name(name)?;
        match self.read_contents(&self.mirror_path(collection, name))? {
            Some(RefContents::Digest(d)) => Ok(Some(d)),
            Some(RefContents::Alias(target)) => self.resolve(&target).map(Some),
            None => Ok(None),
        }
    }

    /// lists every `(name, digest)` pair mirrored under `collection`,
    /// sorted by name.
    pub fn list_collection_refs(&self, collection: &str) -> Result<Vec<(String, Digest)>> {
        validate_ref_name(collection)?;
        let names = self.list_dir(&self.repo.mirror_refs_path().join(collection), "")?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(digest) = self.read_collection_ref(collection, &name)? {
                out.push((name, digest));
            }
        }
        Ok(out)
    }

    /// resolves a refspec to a digest (§4.5's grammar):
    /// - `remote:name` resolves within that remote's namespace;
    /// - `collection:name` (when `collection` matches a mirrored
    ///   collection id) resolves within the mirror namespace;
    /// - otherwise `name` is looked up in the flat `refs/heads` namespace;
    /// - alias indirection is followed recursively, with cycle detection
    ///   and a depth cap of `MAX_ALIAS_DEPTH`;
    /// - only once no ref file matches does a bare 64-hex-digit refspec
    ///   fall back to being read as a literal digest (B2).
    pub fn resolve(&self, refspec: &str) -> Result<Digest> {
        self.resolve_with_budget(refspec, &mut Vec::new())
    }

    fn resolve_with_budget(&self, refspec: &str, visited: &mut Vec<String>) -> Result<Digest> {
        if visited.len() as u32 >= MAX_ALIAS_DEPTH {
            return Err(Error::InvalidArgument(format!("refspec alias chain too deep: {refspec}")));
        }
        if visited.iter().any(|v| v == refspec) {
            return Err(Error::InvalidArgument(format!("refspec alias cycle detected at {refspec}")));
        }
        visited.push(refspec.to_string());

        let contents = if let Some((remote, name)) = refspec.split_once(':') {
            if self.mirror_refs_path().join(remote).is_dir() {
                self.read_contents(&self.mirror_path(remote, name))?
            } else {
                self.read_contents(&self.remote_path(remote, name))?
            }
        } else {
            self.read_contents(&self.heads_path(refspec))?
        };

        // B2: a 64-hex-digit refspec resolves as a literal digest only
        // when no ref file by that name exists under refs/ — a ref file
        // that happens to be named with 64 hex characters takes
        // precedence over the literal-digest reading.
        match contents {
            Some(RefContents::Digest(d)) => Ok(d),
            Some(RefContents::Alias(target)) => self.resolve_with_budget(&target, visited),
            None => match Digest::try_from_hex(refspec) {
                Some(digest) => Ok(digest),
                None => Err(Error::NotFound(format!("ref {refspec}"))),
            },
        }
    }

    fn mirror_refs_path(&self) -> PathBuf {
        self.repo.mirror_refs_path()
    }
}

fn collect_ref_names(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir).with_path(dir)?.collect::<std::io::Result<Vec<_>>>().with_path(dir)?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let qualified = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
        if path.is_dir() {
            collect_ref_names(&path, &qualified, out)?;
        } else {
            out.push(qualified);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoMode;
    use tempfile::tempdir;

    fn repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        let repo = Repo::init(&repo_path, RepoMode::Bare).unwrap();
        (dir, repo)
    }

    #[test]
    fn set_and_read_flat_ref() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        let digest = Digest::of(b"commit-1");
        refs.set_ref("main", digest).unwrap();
        assert_eq!(refs.read_ref("main").unwrap(), Some(digest));
    }

    #[test]
    fn hierarchical_ref_names() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        let digest = Digest::of(b"commit-2");
        refs.set_ref("x86_64/pkg/foo/1.0", digest).unwrap();
        assert_eq!(refs.read_ref("x86_64/pkg/foo/1.0").unwrap(), Some(digest));
        assert_eq!(refs.list_refs().unwrap(), vec!["x86_64/pkg/foo/1.0".to_string()]);
    }

    #[test]
    fn delete_ref_is_idempotent() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        refs.delete_ref("nonexistent").unwrap();
        refs.set_ref("a", Digest::of(b"a")).unwrap();
        refs.delete_ref("a").unwrap();
        assert_eq!(refs.read_ref("a").unwrap(), None);
    }

    #[test]
    fn rejects_invalid_names() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        assert!(refs.set_ref("../escape", Digest::of(b"x")).is_err());
        assert!(refs.set_ref("/leading", Digest::of(b"x")).is_err());
        assert!(refs.set_ref("", Digest::of(b"x")).is_err());
    }

    #[test]
    fn remote_scoped_refs() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        let digest = Digest::of(b"remote-commit");
        refs.set_remote_ref("origin", "main", digest).unwrap();
        assert_eq!(refs.read_remote_ref("origin", "main").unwrap(), Some(digest));
        assert_eq!(refs.list_remote_refs("origin").unwrap(), vec!["main".to_string()]);
    }

    #[test]
    fn collection_mirror_refs() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        let d1 = Digest::of(b"one");
        let d2 = Digest::of(b"two");
        refs.set_collection_ref("org.example.Repo", "stable", d1).unwrap();
        refs.set_collection_ref("org.example.Repo", "testing", d2).unwrap();
        let all = refs.list_collection_refs("org.example.Repo").unwrap();
        assert_eq!(all, vec![("stable".to_string(), d1), ("testing".to_string(), d2)]);
    }

    #[test]
    fn resolve_literal_digest() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        let digest = Digest::of(b"literal");
        assert_eq!(refs.resolve(&digest.to_hex()).unwrap(), digest);
    }

    #[test]
    fn resolve_prefers_ref_file_over_literal_digest_reading() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        let name_as_hex = Digest::of(b"this-string-is-also-a-ref-name").to_hex();
        let target = Digest::of(b"actual-target");
        refs.set_ref(&name_as_hex, target).unwrap();

        // B2: since a ref file named `name_as_hex` exists, resolve must
        // return its target rather than treating `name_as_hex` itself as
        // a literal digest.
        assert_eq!(refs.resolve(&name_as_hex).unwrap(), target);
        assert_ne!(target, Digest::from_hex(&name_as_hex).unwrap());
    }

    #[test]
    fn resolve_remote_qualified_refspec() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        let digest = Digest::of(b"origin-main");
        refs.set_remote_ref("origin", "main", digest).unwrap();
        assert_eq!(refs.resolve("origin:main").unwrap(), digest);
    }

    #[test]
    fn resolve_follows_alias() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        let digest = Digest::of(b"target");
        refs.set_ref("target", digest).unwrap();
        refs.set_alias("current", "target").unwrap();
        assert_eq!(refs.resolve("current").unwrap(), digest);
        assert_eq!(refs.read_ref("current").unwrap(), Some(digest));
    }

    #[test]
    fn resolve_detects_alias_cycle() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        refs.set_alias("a", "b").unwrap();
        refs.set_alias("b", "a").unwrap();
        assert!(refs.resolve("a").is_err());
    }

    #[test]
    fn resolve_missing_ref_not_found() {
        let (_dir, repo) = repo();
        let refs = RefStore::new(&repo);
        assert!(matches!(refs.resolve("nope"), Err(Error::NotFound(_))));
    }
}
