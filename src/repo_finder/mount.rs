//! `mount` finder (§4.7): walks mounted filesystems looking for a sibling
//! repository under `<mount>/.ostree/repos/<collection>/<ref>`. Grounded
//! in `ostree-repo-finder-mount.c`'s two safety checks before trusting a
//! candidate: a symlink at that path must resolve to somewhere still
//! under the mount point (never escape it), and the resolved repo must
//! not be the same device+inode as the repo doing the search (otherwise
//! every local repo would "discover" itself through its own bind mount).

use std::fs;
use std::future::Future;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use super::{CollectionRef, FinderResult, FinderVariant, RepoFinder};
use crate::config::RemoteConfig;
use crate::refs::RefStore;
use crate::repo::Repo;

/// enumerates candidate mount points to probe. Production code lists
/// `/proc/self/mountinfo`; tests inject a fixed list so the finder's
/// symlink/device-identity logic can run against real temp directories
/// without depending on the host's actual mount table.
pub trait MountSource: Send + Sync {
    fn mounts(&self) -> Vec<PathBuf>;
}

/// reads the live mount table via `/proc/self/mountinfo`, one mount point
/// per line (field 5, the third whitespace-delimited field counting from
/// zero — see `proc(5)`).
pub struct ProcMountinfoSource;

impl MountSource for ProcMountinfoSource {
    fn mounts(&self) -> Vec<PathBuf> {
        let Ok(contents) = fs::read_to_string("/proc/self/mountinfo") else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| line.split_whitespace().nth(4))
            .map(PathBuf::from)
            .collect()
    }
}

pub struct MountFinder {
    source: Box<dyn MountSource>,
    priority: i64,
}

impl MountFinder {
    pub fn new(source: Box<dyn MountSource>, priority: i64) -> Self {
        Self { source, priority }
    }

    /// resolves `candidate` (possibly a symlink) and confirms it stays
    /// under `mount` and is not the same device+inode as `local_repo`.
    fn validate_candidate(candidate: &Path, mount: &Path, local_repo: &Repo) -> Option<PathBuf> {
        let resolved = fs::canonicalize(candidate).ok()?;
        let mount_resolved = fs::canonicalize(mount).ok()?;
        if !resolved.starts_with(&mount_resolved) {
            tracing::warn!(path = %candidate.display(), "mount finder: candidate escapes mount, ignoring");
            return None;
        }

        let candidate_meta = fs::metadata(&resolved).ok()?;
        if let Ok(local_meta) = fs::metadata(local_repo.path()) {
            if candidate_meta.dev() == local_meta.dev() && candidate_meta.ino() == local_meta.ino() {
                tracing::warn!(path = %candidate.display(), "mount finder: candidate is the local repo, ignoring");
                return None;
            }
        }

        Some(resolved)
    }
}

impl RepoFinder for MountFinder {
    fn variant(&self) -> FinderVariant {
        FinderVariant::Mount
    }

    fn resolve<'a>(
        &'a self,
        refs: &'a [CollectionRef],
        local: &'a Repo,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Vec<FinderResult>> + Send + 'a>> {
        Box::pin(async move {
            let mut results = Vec::new();

            for mount in self.source.mounts() {
                if cancel.is_cancelled() {
                    break;
                }

                let mut ref_to_digest = std::collections::BTreeMap::new();
                let mut repo_path = None;

                for cref in refs {
                    let candidate = mount.join(".ostree/repos").join(&cref.collection).join(&cref.ref_name);
                    if !candidate.exists() {
                        continue;
                    }
                    let Some(resolved) = Self::validate_candidate(&candidate, &mount, local) else {
                        continue;
                    };
                    if !resolved.join("config").is_file() {
                        continue;
                    }

                    let Ok(candidate_repo) = Repo::open(&resolved) else { continue };
                    let store = RefStore::new(&candidate_repo);
                    let digest = store.resolve(&cref.ref_name).ok();
                    ref_to_digest.insert(cref.clone(), digest);
                    repo_path.get_or_insert(resolved);
                }

                if ref_to_digest.values().any(Option::is_some) {
                    let remote_name = mount.display().to_string();
                    results.push(FinderResult {
                        remote_name: remote_name.clone(),
                        remote: RemoteConfig { url: format!("file://{}", mount.display()), ..Default::default() },
                        finder_variant: FinderVariant::Mount,
                        priority: self.priority,
                        ref_to_digest,
                        summary_mtime: 0,
                    });
                }
            }

            results
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoMode;
    use crate::transaction::Transaction;
    use crate::Digest;
    use tempfile::tempdir;

    struct FixedMounts(Vec<PathBuf>);
    impl MountSource for FixedMounts {
        fn mounts(&self) -> Vec<PathBuf> {
            self.0.clone()
        }
    }

    fn make_repo_with_ref(root: &Path, ref_name: &str) -> Repo {
        let repo = Repo::init(root, RepoMode::Bare).unwrap();
        let mut txn = Transaction::prepare(&repo).unwrap();
        txn.set_ref(ref_name, Digest::of(b"mount-commit"));
        txn.commit().unwrap();
        repo
    }

    #[tokio::test]
    async fn finds_ref_in_mounted_repo() {
        let local_dir = tempdir().unwrap();
        let local = Repo::init(&local_dir.path().join("local"), RepoMode::Bare).unwrap();

        let mount_dir = tempdir().unwrap();
        let repo_root = mount_dir.path().join(".ostree/repos/org.example/stable");
        fs::create_dir_all(repo_root.parent().unwrap()).unwrap();
        make_repo_with_ref(&repo_root, "stable");

        let finder = MountFinder::new(Box::new(FixedMounts(vec![mount_dir.path().to_path_buf()])), 5);
        let wanted = CollectionRef::new("org.example", "stable");
        let results = finder.resolve(&[wanted.clone()], &local, CancellationToken::new()).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ref_to_digest.get(&wanted).unwrap(), &Some(Digest::of(b"mount-commit")));
    }

    #[tokio::test]
    async fn same_device_inode_as_local_is_ignored() {
        let local_dir = tempdir().unwrap();
        let local_root = local_dir.path().join("repo");
        let local = make_repo_with_ref(&local_root, "stable");

        // the "mount" IS the local repo's own parent directory, and the
        // candidate path resolves straight back to the local repo itself.
        let mount_dir = tempdir().unwrap();
        let link_parent = mount_dir.path().join(".ostree/repos/org.example");
        fs::create_dir_all(&link_parent).unwrap();
        std::os::unix::fs::symlink(&local_root, link_parent.join("stable")).unwrap();

        let finder = MountFinder::new(Box::new(FixedMounts(vec![mount_dir.path().to_path_buf()])), 5);
        let wanted = CollectionRef::new("org.example", "stable");
        let results = finder.resolve(&[wanted], &local, CancellationToken::new()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn escaping_symlink_is_ignored() {
        let local_dir = tempdir().unwrap();
        let local = Repo::init(&local_dir.path().join("local"), RepoMode::Bare).unwrap();

        let outside_dir = tempdir().unwrap();
        make_repo_with_ref(&outside_dir.path().join("repo"), "stable");

        let mount_dir = tempdir().unwrap();
        let link_parent = mount_dir.path().join(".ostree/repos/org.example");
        fs::create_dir_all(&link_parent).unwrap();
        std::os::unix::fs::symlink(outside_dir.path().join("repo"), link_parent.join("stable")).unwrap();

        let finder = MountFinder::new(Box::new(FixedMounts(vec![mount_dir.path().to_path_buf()])), 5);
        let wanted = CollectionRef::new("org.example", "stable");
        let results = finder.resolve(&[wanted], &local, CancellationToken::new()).await;
        assert!(results.is_empty());
    }
}
