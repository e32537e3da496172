//! Signature backends.
//!
//! Verification messages are signed either over a 32-byte digest of the
//! serialized tuple ("new sigs") or over a string-canonicalized form of the
//! same tuple (legacy). Which form a message uses is decided by the caller;
//! this module only provides the schemes. Both sides must serialize the
//! tuple identically, so the canonical forms live next to the message types.

use std::fmt;

use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use zocd_consensus::Hash256;
use zocd_primitives::encoding::Encoder;
use zocd_primitives::hash::sha256d;

use crate::ports::MessageSigner;

const MESSAGE_MAGIC: &str = "ZeroOne Signed Message:\n";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignError {
    InvalidKey,
    InvalidSignature,
    VerifyFailed,
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::InvalidKey => write!(f, "invalid key material"),
            SignError::InvalidSignature => write!(f, "malformed signature"),
            SignError::VerifyFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignError {}

/// ECDSA over secp256k1, DER-encoded signatures.
pub struct Secp256k1Signer {
    secp: Secp256k1<All>,
}

impl Secp256k1Signer {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    fn sign_digest(&self, digest: &Hash256, key: &[u8]) -> Result<Vec<u8>, SignError> {
        let key = SecretKey::from_slice(key).map_err(|_| SignError::InvalidKey)?;
        let message = Message::from_digest_slice(digest).map_err(|_| SignError::InvalidKey)?;
        let signature = self.secp.sign_ecdsa(&message, &key);
        Ok(signature.serialize_der().to_vec())
    }

    fn verify_digest(&self, digest: &Hash256, pubkey: &[u8], sig: &[u8]) -> Result<(), SignError> {
        let pubkey = PublicKey::from_slice(pubkey).map_err(|_| SignError::InvalidKey)?;
        let signature = Signature::from_der(sig).map_err(|_| SignError::InvalidSignature)?;
        let message = Message::from_digest_slice(digest).map_err(|_| SignError::InvalidKey)?;
        self.secp
            .verify_ecdsa(&message, &signature, &pubkey)
            .map_err(|_| SignError::VerifyFailed)
    }
}

impl Default for Secp256k1Signer {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest of the magic-framed message, as legacy wallets compute it.
pub fn message_digest(message: &str) -> Hash256 {
    let mut encoder = Encoder::new();
    encoder.write_var_str(MESSAGE_MAGIC);
    encoder.write_var_str(message);
    sha256d(&encoder.into_inner())
}

impl MessageSigner for Secp256k1Signer {
    fn sign_hash(&self, hash: &Hash256, key: &[u8]) -> Result<Vec<u8>, SignError> {
        self.sign_digest(hash, key)
    }

    fn verify_hash(&self, hash: &Hash256, pubkey: &[u8], sig: &[u8]) -> Result<(), SignError> {
        self.verify_digest(hash, pubkey, sig)
    }

    fn sign_message(&self, message: &str, key: &[u8]) -> Result<Vec<u8>, SignError> {
        self.sign_digest(&message_digest(message), key)
    }

    fn verify_message(&self, message: &str, pubkey: &[u8], sig: &[u8]) -> Result<(), SignError> {
        self.verify_digest(&message_digest(message), pubkey, sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MessageSigner;

    fn test_key() -> Vec<u8> {
        let mut key = vec![0u8; 32];
        key[31] = 1;
        key
    }

    fn pubkey_for(secp: &Secp256k1<All>, key: &[u8]) -> Vec<u8> {
        let secret = SecretKey::from_slice(key).expect("secret key");
        PublicKey::from_secret_key(secp, &secret)
            .serialize()
            .to_vec()
    }

    #[test]
    fn hash_sign_verify_round_trip() {
        let signer = Secp256k1Signer::new();
        let key = test_key();
        let pubkey = pubkey_for(&signer.secp, &key);
        let digest = sha256d(b"challenge");

        let sig = signer.sign_hash(&digest, &key).expect("sign");
        signer.verify_hash(&digest, &pubkey, &sig).expect("verify");

        let other = sha256d(b"other");
        assert_eq!(
            signer.verify_hash(&other, &pubkey, &sig),
            Err(SignError::VerifyFailed)
        );
    }

    #[test]
    fn message_scheme_is_magic_framed() {
        let signer = Secp256k1Signer::new();
        let key = test_key();
        let pubkey = pubkey_for(&signer.secp, &key);

        let sig = signer.sign_message("198.51.100.7:10000", &key).expect("sign");
        signer
            .verify_message("198.51.100.7:10000", &pubkey, &sig)
            .expect("verify");
        assert_eq!(
            signer.verify_message("198.51.100.7:10001", &pubkey, &sig),
            Err(SignError::VerifyFailed)
        );
        // framed digest differs from the raw string digest
        assert_ne!(message_digest("x"), sha256d(b"x"));
    }
}
