//! `config` finder (§4.7): ranks the remotes already configured on the
//! local repository. Fetching a remote's summary file is an HTTP/metalink
//! transport concern explicitly out of scope (§1) — this module depends on
//! it only through the `SummaryProvider` seam, the documented interface a
//! real transport implementation plugs into.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use super::{CollectionRef, FinderResult, FinderVariant, RepoFinder};
use crate::config::RemoteConfig;
use crate::repo::Repo;
use crate::Digest;

/// a remote's summary: which `(collection, ref)` it advertises and at
/// what digest, plus the summary file's own modification time.
#[derive(Debug, Clone, Default)]
pub struct RemoteSummary {
    pub ref_to_digest: BTreeMap<CollectionRef, Digest>,
    pub mtime: u64,
}

/// fetches (or reads a cached copy of) one remote's summary. Real
/// implementations live outside this crate's scope; tests use an
/// in-memory stand-in.
pub trait SummaryProvider: Send + Sync {
    fn fetch_summary<'a>(
        &'a self,
        remote_name: &'a str,
        remote: &'a RemoteConfig,
    ) -> Pin<Box<dyn Future<Output = Option<RemoteSummary>> + Send + 'a>>;
}

pub struct ConfigFinder {
    provider: Box<dyn SummaryProvider>,
    priority: i64,
}

impl ConfigFinder {
    pub fn new(provider: Box<dyn SummaryProvider>, priority: i64) -> Self {
        Self { provider, priority }
    }
}

impl RepoFinder for ConfigFinder {
    fn variant(&self) -> FinderVariant {
        FinderVariant::Config
    }

    fn resolve<'a>(
        &'a self,
        refs: &'a [CollectionRef],
        local: &'a Repo,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Vec<FinderResult>> + Send + 'a>> {
        Box::pin(async move {
            let mut results = Vec::new();
            for (name, remote) in &local.config().remotes {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(summary) = self.provider.fetch_summary(name, remote).await else {
                    tracing::warn!(remote = %name, "config finder: summary unavailable, skipping");
                    continue;
                };

                let ref_to_digest = refs
                    .iter()
                    .map(|r| (r.clone(), summary.ref_to_digest.get(r).copied()))
                    .collect();

                results.push(FinderResult {
                    remote_name: name.clone(),
                    remote: remote.clone(),
                    finder_variant: FinderVariant::Config,
                    priority: self.priority,
                    ref_to_digest,
                    summary_mtime: summary.mtime,
                });
            }
            results
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoMode;
    use tempfile::tempdir;

    struct FakeProvider(BTreeMap<String, RemoteSummary>);

    impl SummaryProvider for FakeProvider {
        fn fetch_summary<'a>(
            &'a self,
            remote_name: &'a str,
            _remote: &'a RemoteConfig,
        ) -> Pin<Box<dyn Future<Output = Option<RemoteSummary>> + Send + 'a>> {
            let result = self.0.get(remote_name).cloned();
            Box::pin(async move { result })
        }
    }

    fn repo_with_remote(name: &str) -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let mut repo = Repo::init(&dir.path().join("repo"), RepoMode::Archive).unwrap();
        repo.config_mut()
            .add_remote(name, RemoteConfig { url: "https://example.invalid".into(), ..Default::default() })
            .unwrap();
        repo.save_config().unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn intersects_advertised_refs_with_request() {
        let (_dir, repo) = repo_with_remote("origin");
        let wanted = CollectionRef::new("org.example", "stable");
        let unwanted = CollectionRef::new("org.example", "testing");

        let mut summary = RemoteSummary::default();
        summary.ref_to_digest.insert(wanted.clone(), Digest::of(b"x"));
        summary.mtime = 1000;
        let mut map = BTreeMap::new();
        map.insert("origin".to_string(), summary);

        let finder = ConfigFinder::new(Box::new(FakeProvider(map)), 10);
        let results = finder.resolve(&[wanted.clone(), unwanted.clone()], &repo, CancellationToken::new()).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ref_to_digest.get(&wanted).unwrap(), &Some(Digest::of(b"x")));
        assert_eq!(results[0].ref_to_digest.get(&unwanted).unwrap(), &None);
    }

    #[tokio::test]
    async fn unreachable_remote_is_skipped_not_errored() {
        let (_dir, repo) = repo_with_remote("origin");
        let finder = ConfigFinder::new(Box::new(FakeProvider(BTreeMap::new())), 10);
        let results = finder.resolve(&[], &repo, CancellationToken::new()).await;
        assert!(results.is_empty());
    }
}
