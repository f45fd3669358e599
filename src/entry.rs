use cid::Cid;
use multihash::Multihash;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use std::convert::TryFrom;

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::keystore::Keystore;
use crate::lamport_clock::LamportClock;

const SHA2_256: u64 = 0x12;
const DAG_CBOR: u64 = 0x71;

/// Computes the content address of a canonical encoding.
pub fn cid_of(bytes: &[u8]) -> Result<Cid> {
    let digest: [u8; 32] = Sha256::digest(bytes).into();
    let hash = Multihash::<64>::wrap(SHA2_256, &digest)?;
    Ok(Cid::new_v1(DAG_CBOR, hash))
}

/// The byte layout signed by the author. Field order is the canonical
/// encoding; `next` is sorted before it gets here.
#[derive(Serialize)]
struct SignedFields<'a> {
    payload: &'a serde_bytes::Bytes,
    next: &'a [String],
    clock: &'a LamportClock,
    identity: &'a str,
}

/// The byte layout persisted to the object store: the signed fields plus the
/// signature. The hash is the CID of this encoding and is never serialized.
#[derive(Serialize, Deserialize)]
struct EntryRecord {
    payload: ByteBuf,
    next: Vec<String>,
    clock: LamportClock,
    identity: String,
    signature: String,
}

/// A signed, content-addressed log record.
///
/// Entries are immutable. `next` points at the causal parents; an entry with
/// an empty `next` is a root. Two entries with identical fields encode to
/// identical bytes and therefore carry identical hashes on every peer.
#[derive(Debug, Clone)]
pub struct Entry {
    payload: Vec<u8>,
    next: Vec<Cid>,
    clock: LamportClock,
    identity: String,
    signature: String,
    hash: Cid,
}

impl Entry {
    /// Builds, signs and addresses a new entry.
    pub fn create(
        payload: &[u8],
        next: &[Cid],
        clock: LamportClock,
        identity: &Identity,
        keystore: &Keystore,
    ) -> Result<Entry> {
        let mut next_strings: Vec<String> = next.iter().map(|cid| cid.to_string()).collect();
        next_strings.sort();
        next_strings.dedup();

        let signed = serde_cbor::to_vec(&SignedFields {
            payload: serde_bytes::Bytes::new(payload),
            next: &next_strings,
            clock: &clock,
            identity: identity.pub_key(),
        })?;
        let signature = keystore.sign(identity.id(), &signed)?;

        let record = EntryRecord {
            payload: ByteBuf::from(payload.to_vec()),
            next: next_strings,
            clock,
            identity: identity.pub_key().to_owned(),
            signature,
        };
        let bytes = serde_cbor::to_vec(&record)?;
        let hash = cid_of(&bytes)?;
        Entry::from_record(record, hash)
    }

    /// Rebuilds an entry from its stored bytes, re-deriving the hash.
    pub fn decode(bytes: &[u8]) -> Result<Entry> {
        let record: EntryRecord = serde_cbor::from_slice(bytes)?;
        let hash = cid_of(bytes)?;
        Entry::from_record(record, hash)
    }

    fn from_record(record: EntryRecord, hash: Cid) -> Result<Entry> {
        let mut next = Vec::with_capacity(record.next.len());
        for parent in &record.next {
            next.push(Cid::try_from(parent.as_str())?);
        }
        Ok(Entry {
            payload: record.payload.into_vec(),
            next,
            clock: record.clock,
            identity: record.identity,
            signature: record.signature,
            hash,
        })
    }

    /// The canonical stored bytes of this entry.
    pub fn encoded(&self) -> Result<Vec<u8>> {
        let record = EntryRecord {
            payload: ByteBuf::from(self.payload.clone()),
            next: self.next_strings(),
            clock: self.clock.clone(),
            identity: self.identity.clone(),
            signature: self.signature.clone(),
        };
        Ok(serde_cbor::to_vec(&record)?)
    }

    fn signed_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(&SignedFields {
            payload: serde_bytes::Bytes::new(&self.payload),
            next: &self.next_strings(),
            clock: &self.clock,
            identity: &self.identity,
        })?)
    }

    fn next_strings(&self) -> Vec<String> {
        self.next.iter().map(|cid| cid.to_string()).collect()
    }

    /// Checks that the hash matches the fields and that the signature
    /// verifies against the embedded identity.
    pub fn verify(&self) -> Result<()> {
        let bytes = self.encoded()?;
        let expected = cid_of(&bytes)?;
        if expected != self.hash {
            return Err(Error::Integrity(format!(
                "hash mismatch for {}",
                self.hash
            )));
        }
        let signed = self.signed_bytes()?;
        if !Keystore::verify(&self.identity, &signed, &self.signature) {
            return Err(Error::Integrity(format!(
                "bad signature on {}",
                self.hash
            )));
        }
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn next(&self) -> &[Cid] {
        &self.next
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn hash(&self) -> &Cid {
        &self.hash
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Entry {}
