//! Challenge/response authentication.
//!
//! Three proofs exist on the wire: plaintext password, an MD5 digest of
//! `challenge || secret`, and an RSA signature over the challenge. When a
//! peer offers several, the strongest is used: RSA, then MD5, then
//! plaintext. The MD5 digest doubles as the session encryption key.

use std::collections::HashMap;

use md5::{Digest, Md5};
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use subtle::ConstantTimeEq;
use tracing::debug;

use iax2_proto::constants::{AUTH_MD5, AUTH_PLAINTEXT, AUTH_RSA};

use crate::error::{EngineError, EngineResult};

/// Named RSA key material, the engine-side stand-in for the host's key
/// directory.
#[derive(Default)]
pub struct KeyStore {
    public: HashMap<String, RsaPublicKey>,
    private: HashMap<String, RsaPrivateKey>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("public", &self.public.keys())
            .field("private", &self.private.keys())
            .finish()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_public(&mut self, name: impl Into<String>, key: RsaPublicKey) {
        self.public.insert(name.into(), key);
    }

    pub fn add_private(&mut self, name: impl Into<String>, key: RsaPrivateKey) {
        self.private.insert(name.into(), key);
    }

    pub fn public(&self, name: &str) -> Option<&RsaPublicKey> {
        self.public.get(name)
    }

    pub fn private(&self, name: &str) -> Option<&RsaPrivateKey> {
        self.private.get(name)
    }
}

/// A decimal challenge in the range the protocol has always used.
pub fn generate_challenge(rng: &mut dyn RngCore) -> String {
    format!("{}", rng.next_u32() % 1_000_000_000)
}

/// Hex MD5 of `challenge || secret`: both the AUTHREP proof and the session
/// encryption key's text form.
pub fn md5_response(challenge: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(challenge.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_md5(challenge: &str, secret: &str, response: &str) -> bool {
    let expected = md5_response(challenge, secret);
    expected.as_bytes().ct_eq(response.as_bytes()).unwrap_u8() == 1
}

pub fn verify_plaintext(secret: &str, password: &str) -> bool {
    secret.as_bytes().ct_eq(password.as_bytes()).unwrap_u8() == 1
}

/// Signs a challenge with the named private key.
pub fn rsa_sign(keys: &KeyStore, keyname: &str, challenge: &str) -> EngineResult<Vec<u8>> {
    let key = keys
        .private(keyname)
        .ok_or(EngineError::AuthRejected("no such private key"))?;
    let signer = SigningKey::<Sha256>::new(key.clone());
    Ok(signer.sign(challenge.as_bytes()).to_vec())
}

/// Verifies a challenge signature against any of the named trusted keys.
pub fn rsa_verify(keys: &KeyStore, inkeys: &[String], challenge: &str, sig: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(sig) else {
        return false;
    };
    for name in inkeys {
        let Some(key) = keys.public(name) else {
            debug!(key = %name, "trusted key not loaded");
            continue;
        };
        let verifier = VerifyingKey::<Sha256>::new(key.clone());
        if verifier.verify(challenge.as_bytes(), &signature).is_ok() {
            return true;
        }
    }
    false
}

/// The proof we will produce for an AUTHREQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Rsa,
    Md5,
    Plaintext,
}

/// Picks the strongest offered method we can actually satisfy.
pub fn choose_method(offered: u16, have_secret: bool, have_outkey: bool) -> Option<AuthMethod> {
    if offered & AUTH_RSA != 0 && have_outkey {
        Some(AuthMethod::Rsa)
    } else if offered & AUTH_MD5 != 0 && have_secret {
        Some(AuthMethod::Md5)
    } else if offered & AUTH_PLAINTEXT != 0 && have_secret {
        Some(AuthMethod::Plaintext)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn md5_proof_round_trip() {
        let mut rng = StdRng::seed_from_u64(1);
        let challenge = generate_challenge(&mut rng);
        let response = md5_response(&challenge, "s3cret");
        assert!(verify_md5(&challenge, "s3cret", &response));
        assert!(!verify_md5(&challenge, "wrong", &response));
    }

    #[test]
    fn method_preference_order() {
        let all = AUTH_RSA | AUTH_MD5 | AUTH_PLAINTEXT;
        assert_eq!(choose_method(all, true, true), Some(AuthMethod::Rsa));
        assert_eq!(choose_method(all, true, false), Some(AuthMethod::Md5));
        assert_eq!(
            choose_method(AUTH_PLAINTEXT, true, false),
            Some(AuthMethod::Plaintext)
        );
        assert_eq!(choose_method(all, false, false), None);
    }

    #[test]
    fn rsa_sign_verify_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);

        let mut keys = KeyStore::new();
        keys.add_private("ours", private);
        keys.add_public("theirs", public);

        let sig = rsa_sign(&keys, "ours", "12345").unwrap();
        assert!(rsa_verify(&keys, &["theirs".into()], "12345", &sig));
        assert!(!rsa_verify(&keys, &["theirs".into()], "54321", &sig));
        assert!(!rsa_verify(&keys, &["missing".into()], "12345", &sig));
    }
}
