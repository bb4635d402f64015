//! A transaction batches ref updates behind one exclusive staging lock so
//! a crash or a concurrent writer never observes a half-published set of
//! refs (§4.4). Objects written via `ObjectStore`/`CommitEngine` during an
//! open transaction are linked into `objects/` as they're written, but
//! their per-bucket fsync is deferred (§5) until `commit()` — so a ref is
//! only published once every object it can reach has actually been forced
//! to disk, not merely linked.
//!
//! State machine: `Idle -> Open -> Publishing -> Idle|Open`. `prepare`
//! moves Idle to Open; `commit`/`abort` move Open to Publishing and then
//! back to Idle (consuming `self`); a fresh `prepare` after either is a
//! new Open.

use std::fs;
use std::path::PathBuf;

use crate::commit_engine::SpaceBudget;
use crate::error::{Error, Result};
use crate::objects::store::fsync_dir;
use crate::objects::ObjectStore;
use crate::refs::RefStore;
use crate::repo::{Repo, RepoLock};
use crate::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionStats {
    pub refs_set: u64,
    pub refs_deleted: u64,
}

enum PendingRef {
    Head(String, Option<Digest>),
    Remote(String, String, Option<Digest>),
    Mirror(String, String, Option<Digest>),
}

impl PendingRef {
    /// sort key so application order is deterministic across a run (by
    /// namespace, then by name) rather than insertion order.
    fn sort_key(&self) -> (u8, &str, &str) {
        match self {
            PendingRef::Head(name, _) => (0, "", name.as_str()),
            PendingRef::Remote(remote, name, _) => (1, remote.as_str(), name.as_str()),
            PendingRef::Mirror(collection, name, _) => (2, collection.as_str(), name.as_str()),
        }
    }
}

/// an open batch of ref updates, holding the repository's exclusive
/// staging lock until `commit` or `abort` consumes it (§4.4).
pub struct Transaction<'a> {
    repo: &'a Repo,
    _lock: RepoLock,
    stage_dir: PathBuf,
    space_budget: SpaceBudget,
    pending: Vec<PendingRef>,
}

impl<'a> Transaction<'a> {
    /// opens a transaction: acquires the exclusive staging lock (failing
    /// with `Busy` if another process already holds it), creates this
    /// transaction's own scratch subdirectory under `tmp/`, and takes a
    /// `statvfs`-based free-space snapshot per the repository's configured
    /// policy.
    pub fn prepare(repo: &'a Repo) -> Result<Self> {
        let lock = repo.lock_staging()?;
        let stage_dir = repo.tmp_path().join(format!("txn-{}-{}", boot_id(), uuid::Uuid::new_v4()));
        fs::create_dir_all(&stage_dir).map_err(|e| Error::Io { path: stage_dir.clone(), source: e })?;

        let policy = repo.config().core.free_space_policy()?;
        let space_budget = SpaceBudget::from_statvfs(repo.path(), policy)?;

        Ok(Self { repo, _lock: lock, stage_dir, space_budget, pending: Vec::new() })
    }

    pub fn object_store(&self) -> ObjectStore {
        let mode = self.repo.mode().expect("mode validated at Repo::open/init");
        ObjectStore::new(
            self.repo.objects_path(),
            self.repo.tmp_path(),
            mode,
            self.repo.config().core.fsync,
            self.repo.config().core.zlib_level,
        )
    }

    pub fn space_budget(&self) -> &SpaceBudget {
        &self.space_budget
    }

    pub fn stage_dir(&self) -> &std::path::Path {
        &self.stage_dir
    }

    pub fn set_ref(&mut self, name: impl Into<String>, digest: Digest) {
        self.pending.push(PendingRef::Head(name.into(), Some(digest)));
    }

    pub fn delete_ref(&mut self, name: impl Into<String>) {
        self.pending.push(PendingRef::Head(name.into(), None));
    }

    pub fn set_remote_ref(&mut self, remote: impl Into<String>, name: impl Into<String>, digest: Digest) {
        self.pending.push(PendingRef::Remote(remote.into(), name.into(), Some(digest)));
    }

    pub fn set_collection_ref(&mut self, collection: impl Into<String>, name: impl Into<String>, digest: Digest) {
        self.pending.push(PendingRef::Mirror(collection.into(), name.into(), Some(digest)));
    }

    pub fn delete_collection_ref(&mut self, collection: impl Into<String>, name: impl Into<String>) {
        self.pending.push(PendingRef::Mirror(collection.into(), name.into(), None));
    }

    /// fsyncs every object this transaction may have linked into
    /// `objects/`, then applies every pending ref update in a deterministic
    /// order, then releases the staging lock and removes the scratch
    /// subdirectory.
    pub fn commit(mut self) -> Result<TransactionStats> {
        self.pending.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        // §4.4 steps 2-5: every object this transaction linked into
        // `objects/` was linked with `in_txn=true`, which skips the
        // per-finalize bucket fsync (§5: per-object fsync is deferred
        // during a transaction). Before any ref can be published pointing
        // at that history, force it to disk here: fsync every touched
        // bucket, then the `objects/` directory itself, so a crash right
        // after this call can never leave a ref naming an object whose
        // bytes never reached disk.
        if self.repo.config().core.fsync {
            self.fsync_objects()?;
        }

        let refs = RefStore::new(self.repo);
        let mut stats = TransactionStats::default();

        for entry in &self.pending {
            match entry {
                PendingRef::Head(name, Some(digest)) => {
                    refs.set_ref(name, *digest)?;
                    stats.refs_set += 1;
                }
                PendingRef::Head(name, None) => {
                    refs.delete_ref(name)?;
                    stats.refs_deleted += 1;
                }
                PendingRef::Remote(remote, name, Some(digest)) => {
                    refs.set_remote_ref(remote, name, *digest)?;
                    stats.refs_set += 1;
                }
                PendingRef::Remote(remote, name, None) => {
                    refs.delete_remote_ref(remote, name)?;
                    stats.refs_deleted += 1;
                }
                PendingRef::Mirror(collection, name, Some(digest)) => {
                    refs.set_collection_ref(collection, name, *digest)?;
                    stats.refs_set += 1;
                }
                PendingRef::Mirror(collection, name, None) => {
                    refs.delete_collection_ref(collection, name)?;
                    stats.refs_deleted += 1;
                }
            }
        }

        let _ = fs::remove_dir_all(&self.stage_dir);
        Ok(stats)
    }

    /// fsyncs every bucket directory under `objects/` plus `objects/`
    /// itself. Conservative (it syncs all buckets, not just ones this
    /// transaction touched) but cheap — at most 256 directory fsyncs — and
    /// correct regardless of which buckets this transaction's writes
    /// landed in.
    fn fsync_objects(&self) -> Result<()> {
        let objects_dir = self.repo.objects_path();
        if !objects_dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&objects_dir).map_err(|e| Error::Io { path: objects_dir.clone(), source: e })? {
            let entry = entry.map_err(|e| Error::Io { path: objects_dir.clone(), source: e })?;
            if entry.path().is_dir() {
                fsync_dir(&entry.path())?;
            }
        }
        fsync_dir(&objects_dir)?;
        Ok(())
    }

    /// discards every pending ref update without touching the ref
    /// namespaces. Already-written objects remain as orphans until a
    /// future GC pass (out of scope here) reclaims them — harmless, since
    /// content addressing means nothing can observe them without first
    /// finding a ref that leads to them.
    pub fn abort(self) -> Result<()> {
        let _ = fs::remove_dir_all(&self.stage_dir);
        Ok(())
    }
}

/// best-effort boot identifier used to namespace a transaction's scratch
/// directory so a process restarting after a crash doesn't collide with
/// (or mistake ownership of) a directory from a previous boot.
fn boot_id() -> String {
    fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .map(|s| s.trim().replace('-', ""))
        .unwrap_or_else(|_| "noboot".to_string())
}

/// removes transaction scratch directories under `tmp/` older than
/// `core.tmp-expiry-seconds`, leaving `tmp/cache` untouched (§4.4's crash
/// recovery note: a transaction that never reached `commit`/`abort`
/// leaves its scratch directory behind for this sweep to reclaim).
pub fn prune_stale_tmp(repo: &Repo, now: std::time::SystemTime) -> Result<u64> {
    let tmp_dir = repo.tmp_path();
    let expiry = std::time::Duration::from_secs(repo.config().core.tmp_expiry_seconds);
    let mut pruned = 0;

    if !tmp_dir.is_dir() {
        return Ok(pruned);
    }
    for entry in fs::read_dir(&tmp_dir).map_err(|e| Error::Io { path: tmp_dir.clone(), source: e })? {
        let entry = entry.map_err(|e| Error::Io { path: tmp_dir.clone(), source: e })?;
        let path = entry.path();
        if entry.file_name() == "cache" || entry.file_name() == ".lock" {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let modified = match metadata.modified() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let age = match now.duration_since(modified) {
            Ok(a) => a,
            Err(_) => continue,
        };
        if age < expiry {
            continue;
        }
        let result = if metadata.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
        if result.is_ok() {
            pruned += 1;
        }
    }
    Ok(pruned)
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
    fn prepare_acquires_exclusive_lock() {
        let (_dir, repo) = repo();
        let _txn = Transaction::prepare(&repo).unwrap();
        assert!(matches!(Transaction::prepare(&repo), Err(Error::Busy(_))));
    }

    #[test]
    fn commit_publishes_refs_and_releases_lock() {
        let (_dir, repo) = repo();
        let digest = Digest::of(b"commit-1");
        {
            let mut txn = Transaction::prepare(&repo).unwrap();
            txn.set_ref("main", digest);
            let stats = txn.commit().unwrap();
            assert_eq!(stats.refs_set, 1);
        }

        let refs = RefStore::new(&repo);
        assert_eq!(refs.read_ref("main").unwrap(), Some(digest));

        // lock released: a fresh transaction can open.
        let txn2 = Transaction::prepare(&repo).unwrap();
        txn2.abort().unwrap();
    }

    #[test]
    fn commit_fsyncs_written_objects_before_publishing_refs() {
        let (_dir, repo) = repo();
        let mut txn = Transaction::prepare(&repo).unwrap();

        let store = txn.object_store();
        let mut staged = store.stage_regfile(0, 0, 0o100644, &[], None).unwrap();
        staged.write(b"payload").unwrap();
        let outcome = store.finalize_regfile(staged, None, true).unwrap();

        txn.set_ref("main", outcome.digest);
        let stats = txn.commit().unwrap();
        assert_eq!(stats.refs_set, 1);

        let refs = RefStore::new(&repo);
        assert_eq!(refs.read_ref("main").unwrap(), Some(outcome.digest));
    }

    #[test]
    fn abort_discards_pending_refs() {
        let (_dir, repo) = repo();
        let digest = Digest::of(b"commit-2");
        let mut txn = Transaction::prepare(&repo).unwrap();
        txn.set_ref("main", digest);
        txn.abort().unwrap();

        let refs = RefStore::new(&repo);
        assert_eq!(refs.read_ref("main").unwrap(), None);
    }

    #[test]
    fn commit_applies_refs_in_deterministic_order() {
        let (_dir, repo) = repo();
        let mut txn = Transaction::prepare(&repo).unwrap();
        txn.set_ref("zzz", Digest::of(b"z"));
        txn.set_ref("aaa", Digest::of(b"a"));
        txn.set_collection_ref("org.example", "stable", Digest::of(b"c"));
        let stats = txn.commit().unwrap();
        assert_eq!(stats.refs_set, 3);

        let refs = RefStore::new(&repo);
        assert_eq!(refs.list_refs().unwrap(), vec!["aaa".to_string(), "zzz".to_string()]);
    }

    #[test]
    fn prune_stale_tmp_preserves_cache_dir() {
        let (_dir, repo) = repo();
        fs::write(repo.tmp_path().join("cache/keep"), b"x").unwrap();
        let stale = repo.tmp_path().join("stale-one");
        fs::create_dir(&stale).unwrap();

        let far_future = std::time::SystemTime::now() + std::time::Duration::from_secs(200_000);
        let pruned = prune_stale_tmp(&repo, far_future).unwrap();
        assert_eq!(pruned, 1);
        assert!(repo.tmp_path().join("cache/keep").exists());
        assert!(!stale.exists());
    }
}
