pub mod kind;
pub mod store;
pub mod types;

pub use kind::ObjectKind;
pub use store::{FinalizeOutcome, ObjectOwnership, ObjectStore, StagedFile, SYMLINK_MODE};
pub use types::{Commit, CommitMeta, DirEntry, DirMeta, DirTree, FileEntry, MetadataDict, MetadataValue, TombstoneCommit, Xattr};
