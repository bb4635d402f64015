//! GPG verification modeled as an external-process seam (full GPG support
//! is out of scope — §1). Shells out to a `gpgv`-style binary, grounded in
//! `ot-gpg-utils.c`'s narrow wrapper: load a keyring directory, verify one
//! detached signature, report valid/invalid. No in-process OpenPGP parsing
//! lives here.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use tempfile::NamedTempFile;

use super::{KeySet, Verifier};
use crate::error::{Error, Result};

/// `gpgv`-compatible binary invoked to check one detached signature
/// against a keyring built from `KeySet::trusted` (revoked keys are not
/// passed to `gpgv` — honoring a revocation means simply not keeping the
/// key in the trusted keyring).
pub struct GpgVerifier {
    binary: PathBuf,
}

impl Default for GpgVerifier {
    fn default() -> Self {
        Self { binary: PathBuf::from("gpgv") }
    }
}

impl GpgVerifier {
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn verify_one(&self, payload: &[u8], signature: &[u8], keys: &KeySet) -> Result<bool> {
        if keys.trusted.is_empty() {
            return Ok(false);
        }

        let mut keyring = NamedTempFile::new().map_err(|e| Error::Io { path: PathBuf::from("gpg-keyring"), source: e })?;
        for key in &keys.trusted {
            keyring.write_all(key).map_err(|e| Error::Io { path: keyring.path().to_path_buf(), source: e })?;
        }
        keyring.flush().map_err(|e| Error::Io { path: keyring.path().to_path_buf(), source: e })?;

        let mut sig_file = NamedTempFile::new().map_err(|e| Error::Io { path: PathBuf::from("gpg-sig"), source: e })?;
        sig_file.write_all(signature).map_err(|e| Error::Io { path: sig_file.path().to_path_buf(), source: e })?;
        sig_file.flush().map_err(|e| Error::Io { path: sig_file.path().to_path_buf(), source: e })?;

        let mut payload_file =
            NamedTempFile::new().map_err(|e| Error::Io { path: PathBuf::from("gpg-payload"), source: e })?;
        payload_file.write_all(payload).map_err(|e| Error::Io { path: payload_file.path().to_path_buf(), source: e })?;
        payload_file.flush().map_err(|e| Error::Io { path: payload_file.path().to_path_buf(), source: e })?;

        let status = Command::new(&self.binary)
            .arg("--keyring")
            .arg(keyring.path())
            .arg(sig_file.path())
            .arg(payload_file.path())
            .status();

        match status {
            Ok(status) => Ok(status.success()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(binary = %self.binary.display(), "gpgv binary not found, treating signature as unverifiable");
                Ok(false)
            }
            Err(e) => Err(Error::Io { path: self.binary.clone(), source: e }),
        }
    }
}

impl Verifier for GpgVerifier {
    fn name(&self) -> &'static str {
        "gpg"
    }

    fn metadata_key(&self) -> &'static str {
        "ostree.gpgsigs"
    }

    fn verify(&self, payload: &[u8], signatures: &[Vec<u8>], keys: &KeySet) -> Result<bool> {
        for sig in signatures {
            if self.verify_one(payload, sig, keys)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
