use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::keystore::Keystore;

/// Self-certification carried by an [`Identity`].
///
/// `id` is a signature over the identity id, `public_key` a signature over
/// the concatenation of the public key and the id signature. Together they
/// prove the author holds the secret half of the advertised key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signatures {
    id: String,
    public_key: String,
}

impl Signatures {
    pub fn new(id: &str, public_key: &str) -> Signatures {
        Signatures {
            id: id.to_owned(),
            public_key: public_key.to_owned(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

/// The local author: a public key plus proof of ownership.
///
/// Entries embed only `pub_key`; the full identity object stays on the
/// authoring side and is what access controllers list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    id: String,
    pub_key: String,
    signatures: Signatures,
}

impl Identity {
    pub fn new(id: &str, pub_key: &str, signatures: Signatures) -> Identity {
        Identity {
            id: id.to_owned(),
            pub_key: pub_key.to_owned(),
            signatures,
        }
    }

    /// The identity id, also used as the Lamport clock id. Currently the
    /// lowercase hex of the compressed public key.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pub_key(&self) -> &str {
        &self.pub_key
    }

    pub fn signatures(&self) -> &Signatures {
        &self.signatures
    }

    /// Checks the self-certification chain against the embedded key.
    pub fn verify(&self) -> bool {
        if !Keystore::verify(&self.pub_key, self.id.as_bytes(), self.signatures.id()) {
            return false;
        }
        let mut certified = self.pub_key.as_bytes().to_vec();
        certified.extend_from_slice(self.signatures.id().as_bytes());
        Keystore::verify(&self.pub_key, &certified, self.signatures.public_key())
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystore_identity_self_verifies() {
        let keystore = Keystore::new();
        let identity = keystore.identity("alice").unwrap();
        assert!(identity.verify());
        assert_eq!(identity.id(), identity.pub_key());
    }

    #[test]
    fn tampered_identity_fails() {
        let keystore = Keystore::new();
        let identity = keystore.identity("alice").unwrap();
        let other = keystore.identity("bob").unwrap();
        // graft alice's signatures onto bob's key
        let forged = Identity::new(other.id(), other.pub_key(), identity.signatures().clone());
        assert!(!forged.verify());
    }

    #[test]
    fn identities_order_by_id() {
        let keystore = Keystore::new();
        let a = keystore.identity("a").unwrap();
        let b = keystore.identity("b").unwrap();
        assert_eq!(a.cmp(&b), a.id().cmp(b.id()));
    }
}
