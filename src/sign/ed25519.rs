//! Ed25519 signer/verifier (§4.6's `ed25519` variant), built on
//! `ed25519-dalek` — the crate the wider Rust ecosystem reaches for this,
//! rather than hand-rolling curve arithmetic.

use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier as DalekVerifier, VerifyingKey};

use super::{KeySet, Signer, Verifier};
use crate::error::{Error, Result};

pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn name(&self) -> &'static str {
        "ed25519"
    }

    fn metadata_key(&self) -> &'static str {
        "ostree.sign.ed25519"
    }

    fn verify(&self, payload: &[u8], signatures: &[Vec<u8>], keys: &KeySet) -> Result<bool> {
        let revoked: Vec<VerifyingKey> = keys.revoked.iter().filter_map(|k| parse_public_key(k)).collect();
        let trusted: Vec<VerifyingKey> = keys.trusted.iter().filter_map(|k| parse_public_key(k)).collect();

        for sig_bytes in signatures {
            let Some(sig) = parse_signature(sig_bytes) else { continue };
            for key in &trusted {
                if key.verify(payload, &sig).is_ok() {
                    if revoked.iter().any(|r| r.as_bytes() == key.as_bytes()) {
                        return Ok(false);
                    }
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

pub struct Ed25519Signer;

impl Signer for Ed25519Signer {
    fn name(&self) -> &'static str {
        "ed25519"
    }

    fn metadata_key(&self) -> &'static str {
        "ostree.sign.ed25519"
    }

    fn sign(&self, payload: &[u8], secret_key: &[u8]) -> Result<Vec<u8>> {
        // libsodium's crypto_sign secret key is the 64-byte seed||public-key
        // expansion; a bare 32-byte seed is accepted too since that's what
        // ed25519-dalek hands out natively.
        let seed: [u8; 32] = match secret_key.len() {
            64 => secret_key[..32].try_into().unwrap(),
            32 => secret_key.try_into().unwrap(),
            _ => {
                return Err(Error::InvalidArgument("ed25519 secret key must be 32 or 64 bytes".into()));
            }
        };
        let signing_key = SigningKey::from_bytes(&seed);
        Ok(signing_key.sign(payload).to_bytes().to_vec())
    }
}

fn parse_public_key(bytes: &[u8]) -> Option<VerifyingKey> {
    let arr: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}

fn parse_signature(bytes: &[u8]) -> Option<Signature> {
    let arr: [u8; 64] = bytes.try_into().ok()?;
    Some(Signature::from_bytes(&arr))
}
