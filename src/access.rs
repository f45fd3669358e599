use cid::Cid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::entry::Entry;
use crate::error::Result;
use crate::services::ContentStore;

/// Wildcard writer: any identity may append.
pub const ANY_WRITER: &str = "*";

/// Capabilities a key can hold on a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// May amend the capability list.
    Admin,
    /// May author entries.
    Write,
}

/// The capability list of one database: which keys may administer it and
/// which may write to it. Persisted as its own addressed object so the
/// manifest can reference it by hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessController {
    admin: BTreeSet<String>,
    write: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
struct AccessIo {
    admin: Vec<String>,
    write: Vec<String>,
}

impl AccessController {
    pub fn new() -> AccessController {
        AccessController::default()
    }

    pub fn add(&mut self, capability: Capability, public_key: &str) {
        let list = match capability {
            Capability::Admin => &mut self.admin,
            Capability::Write => &mut self.write,
        };
        list.insert(public_key.to_owned());
    }

    pub fn admins(&self) -> impl Iterator<Item = &str> {
        self.admin.iter().map(|s| s.as_str())
    }

    pub fn writers(&self) -> impl Iterator<Item = &str> {
        self.write.iter().map(|s| s.as_str())
    }

    /// Membership check: `id` is listed as writer or admin, or the wildcard
    /// writer is present.
    pub fn allows(&self, id: &str) -> bool {
        self.write.contains(ANY_WRITER) || self.write.contains(id) || self.admin.contains(id)
    }

    /// Full append gate: the author is allowed and the entry's signature
    /// verifies.
    pub fn can_append(&self, entry: &Entry) -> bool {
        self.allows(entry.identity()) && entry.verify().is_ok()
    }

    /// Persists the canonical JSON encoding (sorted key lists) and returns
    /// its address.
    pub fn save(&self, store: &dyn ContentStore) -> Result<Cid> {
        let io = AccessIo {
            admin: self.admin.iter().cloned().collect(),
            write: self.write.iter().cloned().collect(),
        };
        store.put(&serde_json::to_vec(&io)?)
    }

    /// Fetches and populates a capability list from the object store.
    pub fn load(store: &dyn ContentStore, hash: &Cid) -> Result<AccessController> {
        let bytes = store.get(hash)?;
        let io: AccessIo = serde_json::from_slice(&bytes)?;
        Ok(AccessController {
            admin: io.admin.into_iter().collect(),
            write: io.write.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::Keystore;
    use crate::lamport_clock::LamportClock;
    use crate::services::MemoryStore;

    #[test]
    fn membership_and_wildcard() {
        let mut access = AccessController::new();
        access.add(Capability::Write, "key-a");
        assert!(access.allows("key-a"));
        assert!(!access.allows("key-b"));

        access.add(Capability::Write, ANY_WRITER);
        assert!(access.allows("key-b"));
    }

    #[test]
    fn admins_may_append() {
        let mut access = AccessController::new();
        access.add(Capability::Admin, "root-key");
        assert!(access.allows("root-key"));
    }

    #[test]
    fn save_load_round_trips() {
        let store = MemoryStore::new();
        let mut access = AccessController::new();
        access.add(Capability::Admin, "a");
        access.add(Capability::Write, "b");
        access.add(Capability::Write, "c");

        let hash = access.save(&store).unwrap();
        let loaded = AccessController::load(&store, &hash).unwrap();
        assert_eq!(loaded, access);
    }

    #[test]
    fn can_append_requires_listed_author_and_valid_signature() {
        let keystore = Keystore::new();
        let alice = keystore.identity("alice").unwrap();
        let bob = keystore.identity("bob").unwrap();

        let mut access = AccessController::new();
        access.add(Capability::Write, alice.pub_key());

        let clock = LamportClock::new(alice.id()).set_time(1);
        let entry = Entry::create(b"data", &[], clock, &alice, &keystore).unwrap();
        assert!(access.can_append(&entry));

        let foreign = Entry::create(
            b"data",
            &[],
            LamportClock::new(bob.id()).set_time(1),
            &bob,
            &keystore,
        )
        .unwrap();
        assert!(!access.can_append(&foreign));
    }
}
