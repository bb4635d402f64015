use std::path::PathBuf;

use crate::Digest;

/// closed set of failure kinds a core operation can return.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corrupted object {digest}: {message}")]
    CorruptedObject { digest: Digest, message: String },

    #[error("malformed object record: {0}")]
    MalformedObject(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("signature missing: {0}")]
    SignatureMissing(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("busy: {0}")]
    Busy(String),

    #[error("unsupported repo or object version: {0}")]
    Versioning(String),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

/// retries an I/O operation while the OS reports `EINTR`/`EAGAIN`, per
/// §7's propagation policy: transient errors are retried locally,
/// persistent ones are returned to the caller.
pub fn retry_eintr<T>(mut op: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    loop {
        match op() {
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
                ) => {}
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_path_wraps_io_error() {
        let r: std::io::Result<()> = Err(std::io::Error::new(std::io::ErrorKind::NotFound, "nope"));
        let wrapped = r.with_path("/tmp/x");
        match wrapped {
            Err(Error::Io { path, .. }) => assert_eq!(path, PathBuf::from("/tmp/x")),
            _ => panic!("expected Io variant"),
        }
    }

    #[test]
    fn retry_eintr_retries_then_succeeds() {
        let mut attempts = 0;
        let result = retry_eintr(|| {
            attempts += 1;
            if attempts < 3 {
                Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_eintr_propagates_persistent_error() {
        let result: std::io::Result<()> =
            retry_eintr(|| Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no")));
        assert!(result.is_err());
    }
}
