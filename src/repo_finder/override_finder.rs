//! `override` finder (§4.7): a caller-supplied list of repository URIs,
//! each queried for the collection refs it advertises. Grounded in
//! `ostree-repo-finder-override.c`'s shape — a finder with no discovery
//! logic of its own, just a fixed candidate list the caller already
//! trusts (e.g. from a command-line `--override-url`) — generalized here
//! to key results by `(uri, keyring)` so the same URI configured twice
//! with different trust material produces two distinct candidates rather
//! than one overwriting the other.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use super::{CollectionRef, FinderResult, FinderVariant, RepoFinder};
use crate::config::RemoteConfig;
use crate::Digest;

/// one caller-supplied candidate: a URI plus the keyring identifier that
/// scopes its trust configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OverrideSource {
    pub uri: String,
    pub keyring: String,
}

impl OverrideSource {
    pub fn new(uri: impl Into<String>, keyring: impl Into<String>) -> Self {
        Self { uri: uri.into(), keyring: keyring.into() }
    }
}

/// lists the refs one override URI currently advertises. Production code
/// would speak whatever transport the URI's scheme names; that transport
/// is out of scope here, so this is the seam a real implementation plugs
/// into (mirrors `config::SummaryProvider`'s role for the `config`
/// finder).
pub trait OverrideLister: Send + Sync {
    fn list_refs<'a>(
        &'a self,
        source: &'a OverrideSource,
    ) -> Pin<Box<dyn Future<Output = Option<BTreeMap<CollectionRef, Digest>>> + Send + 'a>>;
}

pub struct OverrideFinder {
    sources: Vec<OverrideSource>,
    lister: Box<dyn OverrideLister>,
    priority: i64,
}

impl OverrideFinder {
    pub fn new(sources: Vec<OverrideSource>, lister: Box<dyn OverrideLister>, priority: i64) -> Self {
        Self { sources, lister, priority }
    }
}

impl RepoFinder for OverrideFinder {
    fn variant(&self) -> FinderVariant {
        FinderVariant::Override
    }

    fn resolve<'a>(
        &'a self,
        refs: &'a [CollectionRef],
        _local: &'a crate::repo::Repo,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Vec<FinderResult>> + Send + 'a>> {
        Box::pin(async move {
            let mut results = Vec::new();

            for source in &self.sources {
                if cancel.is_cancelled() {
                    break;
                }

                let Some(advertised) = self.lister.list_refs(source).await else {
                    tracing::warn!(uri = %source.uri, "override finder: source unreachable, skipping");
                    continue;
                };

                let ref_to_digest: BTreeMap<CollectionRef, Option<Digest>> =
                    refs.iter().map(|r| (r.clone(), advertised.get(r).copied())).collect();

                // keying by (uri, keyring) means two entries for the same
                // URI under different trust configs remain distinct
                // candidates rather than overwriting one another.
                let remote_name = format!("{}#{}", source.uri, source.keyring);
                results.push(FinderResult {
                    remote_name,
                    remote: RemoteConfig { url: source.uri.clone(), ..Default::default() },
                    finder_variant: FinderVariant::Override,
                    priority: self.priority,
                    ref_to_digest,
                    summary_mtime: 0,
                });
            }

            results
        })
    }
}
