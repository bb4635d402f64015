//! Trivial equality-check verifier used for tests (§4.6's `dummy`
//! variant, grounded in `ostree-sign-dummy.c`'s "signature" being a plain
//! copy of the secret key bytes). Never appropriate outside test fixtures.

use super::{KeySet, Signer, Verifier};
use crate::error::Result;

pub struct DummyVerifier;

impl Verifier for DummyVerifier {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn metadata_key(&self) -> &'static str {
        "ostree.sign.dummy"
    }

    fn verify(&self, _payload: &[u8], signatures: &[Vec<u8>], keys: &KeySet) -> Result<bool> {
        for sig in signatures {
            if keys.revoked.iter().any(|k| k == sig) {
                return Ok(false);
            }
        }
        Ok(signatures.iter().any(|sig| keys.trusted.iter().any(|key| key == sig)))
    }
}

pub struct DummySigner;

impl Signer for DummySigner {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn metadata_key(&self) -> &'static str {
        "ostree.sign.dummy"
    }

    fn sign(&self, _payload: &[u8], secret_key: &[u8]) -> Result<Vec<u8>> {
        Ok(secret_key.to_vec())
    }
}
