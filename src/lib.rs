//! zub-core - a content-addressed object repository, similar in spirit to
//! ostree: a tree of files and directories is committed into a flat store
//! of SHA-256-addressed objects (blobs, directory trees, directory
//! metadata, commits), named branches point at commits, and repositories
//! can be discovered and pulled from across several transport mechanisms.
//!
//! The store is the core; pull/push transports and a CLI are out of scope
//! here (see `SPEC_FULL.md`'s Non-goals) but the pieces that make such a
//! transport possible — signature verification, remote discovery/ranking,
//! the wire-stable object encoding — live in this crate.

mod digest;
mod error;
mod record;

pub mod bloom;
pub mod commit_engine;
pub mod config;
pub mod fs;
pub mod objects;
pub mod refs;
pub mod repo;
pub mod repo_finder;
pub mod sign;
pub mod transaction;
pub mod tree_model;

pub use commit_engine::{CommitEngine, CommitModifier, FilterAction, SelinuxPolicy, SpaceBudget};
pub use config::{FreeSpacePolicy, RemoteConfig, RepoConfig, RepoMode};
pub use digest::{Digest, StreamingDigest};
pub use error::{Error, IoResultExt, Result};
pub use objects::{
    Commit, CommitMeta, DirEntry, DirMeta, DirTree, FileEntry, MetadataDict, MetadataValue, ObjectKind, ObjectStore,
    TombstoneCommit, Xattr,
};
pub use refs::{RefContents, RefStore};
pub use repo::{Repo, RepoLock};
pub use repo_finder::{resolve_all, CollectionRef, FinderResult, FinderVariant, RepoFinder};
pub use sign::{SignatureEngine, Signer, Verifier};
pub use transaction::{Transaction, TransactionStats};
pub use tree_model::MutableTree;
