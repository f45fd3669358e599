use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::identity::{Identity, Signatures};

/// Named secp256k1 keypairs plus sign/verify over sha2-256 digests.
///
/// One keystore is shared by all stores of a manager. Keys are held in
/// memory; every key is registered both under its given name and under the
/// hex of its public key, so signing can be keyed by identity id.
pub struct Keystore {
    secp: Secp256k1<All>,
    keys: Mutex<HashMap<String, SecretKey>>,
}

impl Keystore {
    pub fn new() -> Keystore {
        Keystore {
            secp: Secp256k1::new(),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a key under `name` if none exists and returns its public key.
    pub fn create_key(&self, name: &str) -> Result<PublicKey> {
        let mut keys = self.keys.lock().unwrap();
        if let Some(secret) = keys.get(name) {
            return Ok(secret.public_key(&self.secp));
        }
        let (secret, public) = self.secp.generate_keypair(&mut rand::thread_rng());
        keys.insert(name.to_owned(), secret);
        keys.insert(hex::encode(public.serialize()), secret);
        Ok(public)
    }

    /// Looks up the public key registered under `name`, if any.
    pub fn get_key(&self, name: &str) -> Option<PublicKey> {
        let keys = self.keys.lock().unwrap();
        keys.get(name).map(|secret| secret.public_key(&self.secp))
    }

    /// Signs `bytes` with the key registered under `name`. Returns the
    /// compact signature as lowercase hex.
    pub fn sign(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let secret = {
            let keys = self.keys.lock().unwrap();
            match keys.get(name) {
                Some(secret) => *secret,
                None => return Err(Error::NotFound(format!("key {}", name))),
            }
        };
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        let message = Message::from_digest(digest);
        let signature = self.secp.sign_ecdsa(&message, &secret);
        Ok(hex::encode(signature.serialize_compact()))
    }

    /// Verifies a hex compact signature against a hex compressed public key.
    /// Malformed keys or signatures verify as false rather than erroring.
    pub fn verify(public_key: &str, bytes: &[u8], signature: &str) -> bool {
        let key_bytes = match hex::decode(public_key) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let public = match PublicKey::from_slice(&key_bytes) {
            Ok(public) => public,
            Err(_) => return false,
        };
        let sig_bytes = match hex::decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let signature = match Signature::from_compact(&sig_bytes) {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        let message = Message::from_digest(digest);
        Secp256k1::verification_only()
            .verify_ecdsa(&message, &signature, &public)
            .is_ok()
    }

    /// Builds a self-certified [`Identity`] for the key named `name`,
    /// creating the key on first use.
    pub fn identity(&self, name: &str) -> Result<Identity> {
        let public = self.create_key(name)?;
        let id = hex::encode(public.serialize());
        let id_signature = self.sign(name, id.as_bytes())?;
        let mut certified = id.as_bytes().to_vec();
        certified.extend_from_slice(id_signature.as_bytes());
        let key_signature = self.sign(name, &certified)?;
        Ok(Identity::new(
            &id,
            &id,
            Signatures::new(&id_signature, &key_signature),
        ))
    }
}

impl Default for Keystore {
    fn default() -> Self {
        Keystore::new()
    }
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.keys.lock().unwrap();
        write!(f, "Keystore({} keys)", keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keystore = Keystore::new();
        let public = keystore.create_key("alice").unwrap();
        let signature = keystore.sign("alice", b"hello world").unwrap();
        assert!(Keystore::verify(
            &hex::encode(public.serialize()),
            b"hello world",
            &signature
        ));
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let keystore = Keystore::new();
        let public = keystore.create_key("alice").unwrap();
        let signature = keystore.sign("alice", b"hello world").unwrap();
        assert!(!Keystore::verify(
            &hex::encode(public.serialize()),
            b"other message",
            &signature
        ));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let keystore = Keystore::new();
        keystore.create_key("alice").unwrap();
        let bob = keystore.create_key("bob").unwrap();
        let signature = keystore.sign("alice", b"hello world").unwrap();
        assert!(!Keystore::verify(
            &hex::encode(bob.serialize()),
            b"hello world",
            &signature
        ));
    }

    #[test]
    fn create_key_is_idempotent() {
        let keystore = Keystore::new();
        let first = keystore.create_key("alice").unwrap();
        let second = keystore.create_key("alice").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn keys_are_addressable_by_public_key_hex() {
        let keystore = Keystore::new();
        let public = keystore.create_key("alice").unwrap();
        let id = hex::encode(public.serialize());
        let signature = keystore.sign(&id, b"by id").unwrap();
        assert!(Keystore::verify(&id, b"by id", &signature));
    }

    #[test]
    fn verify_tolerates_garbage_inputs() {
        assert!(!Keystore::verify("zz", b"m", "00"));
        assert!(!Keystore::verify("02ab", b"m", "not hex"));
    }
}
