use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::config::{RepoConfig, RepoMode};
use crate::error::{Error, IoResultExt, Result};

/// top-level handle to an on-disk repository (§6's layout, §9: "a `Repo`
/// is the single top-level handle and owns all caches").
pub struct Repo {
    path: PathBuf,
    config: RepoConfig,
}

impl Repo {
    /// initialise a new repository at `path` in the given storage mode.
    pub fn init(path: &Path, mode: RepoMode) -> Result<Self> {
        let config_path = path.join("config");
        if config_path.exists() {
            return Err(Error::AlreadyExists(format!("repository at {}", path.display())));
        }

        std::fs::create_dir_all(path.join("objects")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/heads")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/remotes")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/mirrors")).with_path(path)?;
        std::fs::create_dir_all(path.join("state")).with_path(path)?;
        std::fs::create_dir_all(path.join("tmp/cache")).with_path(path)?;
        std::fs::create_dir_all(path.join("remotes.d")).with_path(path)?;

        let config = RepoConfig::new(mode);
        config.save(&config_path)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    /// open an existing repository.
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config");
        if !config_path.exists() {
            return Err(Error::NotFound(format!("repository at {}", path.display())));
        }
        let config = RepoConfig::load_with_dropins(&config_path, &path.join("remotes.d"))?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RepoConfig {
        &mut self.config
    }

    pub fn mode(&self) -> Result<RepoMode> {
        self.config.core.mode()
    }

    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_path())
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config")
    }

    pub fn objects_path(&self) -> PathBuf {
        self.path.join("objects")
    }

    pub fn refs_path(&self) -> PathBuf {
        self.path.join("refs/heads")
    }

    pub fn remote_refs_path(&self) -> PathBuf {
        self.path.join("refs/remotes")
    }

    pub fn mirror_refs_path(&self) -> PathBuf {
        self.path.join("refs/mirrors")
    }

    pub fn state_path(&self) -> PathBuf {
        self.path.join("state")
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    pub fn tmp_cache_path(&self) -> PathBuf {
        self.path.join("tmp/cache")
    }

    pub fn remotes_d_path(&self) -> PathBuf {
        self.path.join("remotes.d")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.path.join("summary")
    }

    pub fn summary_sig_path(&self) -> PathBuf {
        self.path.join("summary.sig")
    }

    /// path to the repository's parent, if `core.parent` is configured.
    pub fn parent_path(&self) -> Option<PathBuf> {
        self.config.core.parent.as_ref().map(PathBuf::from)
    }

    /// well-known staging lockfile path; an exclusive lock on this file
    /// serialises transaction publication across cooperating processes
    /// (§4.4, §5).
    pub fn staging_lock_path(&self) -> PathBuf {
        self.tmp_path().join(".lock")
    }

    /// acquire the staging lock, blocking-free; fails with `Busy` if held.
    pub fn lock_staging(&self) -> Result<RepoLock> {
        let lock_path = self.staging_lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;
        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::Busy("staging directory locked by another process".into()))?;
        Ok(RepoLock { flock })
    }

    /// try to acquire the staging lock, returning `None` instead of erroring
    /// if another process currently holds it.
    pub fn try_lock_staging(&self) -> Result<Option<RepoLock>> {
        let lock_path = self.staging_lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(RepoLock { flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::Busy("staging directory locked by another process".into())),
        }
    }
}

/// guard that releases the staging lock when dropped (§9: "scoped cleanup
/// on every exit path" via deterministic destruction).
pub struct RepoLock {
    #[allow(dead_code)]
    flock: Flock<File>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_creates_layout() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        let repo = Repo::init(&repo_path, RepoMode::Bare).unwrap();

        assert!(repo_path.join("objects").is_dir());
        assert!(repo_path.join("refs/heads").is_dir());
        assert!(repo_path.join("refs/remotes").is_dir());
        assert!(repo_path.join("refs/mirrors").is_dir());
        assert!(repo_path.join("state").is_dir());
        assert!(repo_path.join("tmp/cache").is_dir());
        assert!(repo_path.join("config").is_file());
        assert_eq!(repo.mode().unwrap(), RepoMode::Bare);
    }

    #[test]
    fn init_twice_fails() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        Repo::init(&repo_path, RepoMode::Archive).unwrap();
        assert!(matches!(Repo::init(&repo_path, RepoMode::Archive), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn open_missing_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(Repo::open(&dir.path().join("nope")), Err(Error::NotFound(_))));
    }

    #[test]
    fn open_roundtrips_config() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        let mut repo = Repo::init(&repo_path, RepoMode::BareUserOnly).unwrap();
        repo.config_mut()
            .add_remote(
                "origin",
                crate::config::RemoteConfig { url: "https://example.invalid".into(), ..Default::default() },
            )
            .unwrap();
        repo.save_config().unwrap();

        let reopened = Repo::open(&repo_path).unwrap();
        assert_eq!(reopened.mode().unwrap(), RepoMode::BareUserOnly);
        assert_eq!(reopened.config().get_remote("origin").unwrap().url, "https://example.invalid");
    }

    #[test]
    fn staging_lock_excludes_concurrent_holder() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        let repo = Repo::init(&repo_path, RepoMode::Bare).unwrap();

        let lock = repo.lock_staging().unwrap();
        assert!(repo.try_lock_staging().unwrap().is_none());
        drop(lock);
        assert!(repo.try_lock_staging().unwrap().is_some());
    }
}
