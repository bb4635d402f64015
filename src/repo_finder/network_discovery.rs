//! `network-discovery` finder (§4.7): candidate remotes arrive as service
//! records — grounded in `ostree-repo-finder-avahi.c`'s model of remotes
//! announced over the network rather than configured locally — each
//! carrying a bloom filter of the refs it advertises. A remote is only
//! probed (an expensive ref-resolution round trip) when its filter claims
//! at least one requested ref; filters that claim nothing for the whole
//! request set are skipped entirely.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use super::{CollectionRef, FinderResult, FinderVariant, RepoFinder};
use crate::bloom::BloomFilter;
use crate::config::RemoteConfig;
use crate::Digest;

/// one service record as received from whatever discovery transport is
/// in use (mDNS/Avahi-style broadcast, a directory service, etc — the
/// transport itself is out of scope, same as `config`/`override`'s
/// seams).
#[derive(Clone)]
pub struct ServiceRecord {
    pub remote_name: String,
    pub remote: RemoteConfig,
    pub refs_filter: BloomFilter,
}

fn filter_key(cref: &CollectionRef) -> String {
    format!("{}:{}", cref.collection, cref.ref_name)
}

/// resolves the refs a probed service record actually has, once its
/// filter has claimed at least one requested ref. Out-of-process, like
/// `OverrideLister`/`SummaryProvider`.
pub trait RemoteProbe: Send + Sync {
    fn probe<'a>(
        &'a self,
        record: &'a ServiceRecord,
        refs: &'a [CollectionRef],
    ) -> Pin<Box<dyn Future<Output = BTreeMap<CollectionRef, Option<Digest>>> + Send + 'a>>;
}

pub struct NetworkDiscoveryFinder {
    records: Vec<ServiceRecord>,
    probe: Box<dyn RemoteProbe>,
    priority: i64,
}

impl NetworkDiscoveryFinder {
    pub fn new(records: Vec<ServiceRecord>, probe: Box<dyn RemoteProbe>, priority: i64) -> Self {
        Self { records, probe, priority }
    }
}

impl RepoFinder for NetworkDiscoveryFinder {
    fn variant(&self) -> FinderVariant {
        FinderVariant::NetworkDiscovery
    }

    fn resolve<'a>(
        &'a self,
        refs: &'a [CollectionRef],
        _local: &'a crate::repo::Repo,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Vec<FinderResult>> + Send + 'a>> {
        Box::pin(async move {
            let mut results = Vec::new();

            for record in &self.records {
                if cancel.is_cancelled() {
                    break;
                }

                let claims_any = refs.iter().any(|r| record.refs_filter.maybe_contains(filter_key(r).as_bytes()));
                if !claims_any {
                    tracing::debug!(
                        remote = %record.remote_name,
                        "network-discovery finder: filter claims nothing requested, skipping probe"
                    );
                    continue;
                }

                let ref_to_digest = self.probe.probe(record, refs).await;
                results.push(FinderResult {
                    remote_name: record.remote_name.clone(),
                    remote: record.remote.clone(),
                    finder_variant: FinderVariant::NetworkDiscovery,
                    priority: self.priority,
                    ref_to_digest,
                    summary_mtime: 0,
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

    struct CountingProbe {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl RemoteProbe for CountingProbe {
        fn probe<'a>(
            &'a self,
            record: &'a ServiceRecord,
            refs: &'a [CollectionRef],
        ) -> Pin<Box<dyn Future<Output = BTreeMap<CollectionRef, Option<Digest>>> + Send + 'a>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let name = record.remote_name.clone();
            let map = refs.iter().map(|r| (r.clone(), Some(Digest::of(name.as_bytes())))).collect();
            Box::pin(async move { map })
        }
    }

    fn local_repo() -> (tempfile::TempDir, crate::repo::Repo) {
        let dir = tempdir().unwrap();
        let repo = crate::repo::Repo::init(&dir.path().join("repo"), RepoMode::Bare).unwrap();
        (dir, repo)
    }

    fn record_with(name: &str, refs_present: &[&CollectionRef]) -> ServiceRecord {
        let mut filter = BloomFilter::new(256, 4);
        for r in refs_present {
            filter.add_element(filter_key(r).as_bytes());
        }
        ServiceRecord { remote_name: name.to_string(), remote: RemoteConfig { url: "net".into(), ..Default::default() }, refs_filter: filter }
    }

    #[tokio::test]
    async fn probes_only_remotes_whose_filter_claims_a_requested_ref() {
        let (_dir, local) = local_repo();
        let wanted = CollectionRef::new("org.example", "stable");
        let other = CollectionRef::new("org.example", "testing");

        let matching = record_with("matches", &[&wanted]);
        let non_matching = record_with("no-match", &[&other]);

        let probe = CountingProbe { calls: std::sync::atomic::AtomicUsize::new(0) };
        let finder = NetworkDiscoveryFinder::new(vec![matching, non_matching], Box::new(probe), 1);
        let results = finder.resolve(&[wanted], &local, CancellationToken::new()).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].remote_name, "matches");
    }

    #[tokio::test]
    async fn empty_request_set_probes_nothing() {
        let (_dir, local) = local_repo();
        let record = record_with("any", &[]);
        let probe = CountingProbe { calls: std::sync::atomic::AtomicUsize::new(0) };
        let finder = NetworkDiscoveryFinder::new(vec![record], Box::new(probe), 1);
        let results = finder.resolve(&[], &local, CancellationToken::new()).await;
        assert!(results.is_empty());
    }
}
