//! An immutable, operation-based conflict-free replicated log.
//!
//! The log is a DAG of signed entries keyed by content address. Appends
//! extend the current heads; merges graft in foreign sub-graphs fetched from
//! the object store. Merging is commutative, associative and idempotent, so
//! peers gossiping head sets converge on the same entry set and, through the
//! deterministic linearization, on the same iteration order.

use cid::Cid;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::access::AccessController;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::keystore::Keystore;
use crate::lamport_clock::LamportClock;
use crate::services::ContentStore;

/// Bounds for [`Log::iter`]. `gt`/`gte`/`lt`/`lte` are entry hashes acting
/// as exclusive/inclusive markers in the linearized sequence; a negative
/// `limit` means unbounded.
#[derive(Debug, Clone)]
pub struct IterOptions {
    pub gt: Option<Cid>,
    pub gte: Option<Cid>,
    pub lt: Option<Cid>,
    pub lte: Option<Cid>,
    pub limit: i64,
    pub reverse: bool,
}

impl Default for IterOptions {
    fn default() -> Self {
        IterOptions {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            limit: -1,
            reverse: false,
        }
    }
}

impl IterOptions {
    pub fn new() -> IterOptions {
        IterOptions::default()
    }

    pub fn gt(mut self, hash: Cid) -> IterOptions {
        self.gt = Some(hash);
        self
    }

    pub fn gte(mut self, hash: Cid) -> IterOptions {
        self.gte = Some(hash);
        self
    }

    pub fn lt(mut self, hash: Cid) -> IterOptions {
        self.lt = Some(hash);
        self
    }

    pub fn lte(mut self, hash: Cid) -> IterOptions {
        self.lte = Some(hash);
        self
    }

    pub fn limit(mut self, limit: i64) -> IterOptions {
        self.limit = limit;
        self
    }

    pub fn reverse(mut self, reverse: bool) -> IterOptions {
        self.reverse = reverse;
        self
    }
}

/// The operation log of one database replica.
#[derive(Debug)]
pub struct Log {
    id: String,
    identity: Identity,
    entries: HashMap<Cid, Entry>,
    /// Entries with no known child.
    heads: HashSet<Cid>,
    /// Every hash referenced as a parent by some entry; the incremental
    /// has-child index behind head maintenance.
    nexts: HashSet<Cid>,
    clock: LamportClock,
}

impl Log {
    /// Constructs an empty log identified by the database address string.
    pub fn new(id: &str, identity: Identity) -> Log {
        let clock = LamportClock::new(identity.id());
        Log {
            id: id.to_owned(),
            identity,
            entries: HashMap::new(),
            heads: HashSet::new(),
            nexts: HashSet::new(),
            clock,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, hash: &Cid) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Cid) -> Option<&Entry> {
        self.entries.get(hash)
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// The current head entries, in linearization order.
    pub fn heads(&self) -> Vec<&Entry> {
        let mut heads: Vec<&Entry> = self
            .heads
            .iter()
            .filter_map(|hash| self.entries.get(hash))
            .collect();
        heads.sort_by_cached_key(|e| Log::sort_key(e));
        heads
    }

    /// The current head hashes in deterministic (sorted) order, as sent on
    /// the wire and written to the heads cache slot.
    pub fn head_hashes(&self) -> Vec<Cid> {
        self.heads().into_iter().map(|e| e.hash().clone()).collect()
    }

    /// Parent hashes referenced by entries in this log but not themselves
    /// present: the unresolved boundary of the local sub-graph.
    pub fn external_refs(&self) -> Vec<Cid> {
        let mut missing: Vec<Cid> = self
            .nexts
            .iter()
            .filter(|hash| !self.entries.contains_key(hash))
            .cloned()
            .collect();
        missing.sort_by_key(|cid| cid.to_bytes());
        missing
    }

    /// Builds and signs a new entry extending the current heads, without
    /// inserting it. The caller decides persistence and insertion order.
    pub fn draft(&self, payload: &[u8], keystore: &Keystore) -> Result<Entry> {
        let time = self.clock.time() + 1;
        let next: Vec<Cid> = self.heads.iter().cloned().collect();
        let clock = LamportClock::new(self.identity.id()).set_time(time);
        Entry::create(payload, &next, clock, &self.identity, keystore)
    }

    /// Appends a payload as a new entry: drafts it against the current
    /// heads, gates it on the access controller, inserts it. The new entry
    /// becomes the sole head.
    pub fn append(
        &mut self,
        payload: &[u8],
        keystore: &Keystore,
        access: &AccessController,
    ) -> Result<Entry> {
        let entry = self.draft(payload, keystore)?;
        if !access.can_append(&entry) {
            return Err(Error::AccessDenied(entry.identity().to_owned()));
        }
        self.insert(entry.clone());
        Ok(entry)
    }

    /// Inserts a verified entry, maintaining heads, the has-child index and
    /// the clock. Returns false when the entry was already present.
    ///
    /// Correct in any insertion order: a parent arriving after its child is
    /// already marked as having a child and never becomes a head.
    pub fn insert(&mut self, entry: Entry) -> bool {
        let hash = entry.hash().clone();
        if self.entries.contains_key(&hash) {
            return false;
        }
        for parent in entry.next() {
            self.nexts.insert(parent.clone());
            self.heads.remove(parent);
        }
        if !self.nexts.contains(&hash) {
            self.heads.insert(hash.clone());
        }
        self.clock.merge(entry.clock());
        self.entries.insert(hash, entry);
        true
    }

    /// Merges the sub-graphs rooted at `foreign_heads` into this log,
    /// fetching unknown entries from the object store.
    ///
    /// Entries failing integrity or access checks are dropped with a warning
    /// and not traversed through; the rest of the batch still lands. Returns
    /// the hashes actually inserted, which is empty when the merge was a
    /// no-op.
    pub fn merge(
        &mut self,
        foreign_heads: &[Cid],
        store: &dyn ContentStore,
        access: &AccessController,
    ) -> Result<Vec<Cid>> {
        let mut added = Vec::new();
        let mut queued: HashSet<Cid> = HashSet::new();
        let mut queue: VecDeque<Cid> = VecDeque::new();
        for head in foreign_heads {
            if !self.entries.contains_key(head) && queued.insert(head.clone()) {
                queue.push_back(head.clone());
            }
        }

        while let Some(hash) = queue.pop_front() {
            if self.entries.contains_key(&hash) {
                continue;
            }
            let bytes = match store.get(&hash) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(log = %self.id, %hash, %err, "failed to fetch entry, skipping branch");
                    continue;
                }
            };
            let entry = match Entry::decode(&bytes) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(log = %self.id, %hash, %err, "undecodable entry dropped");
                    continue;
                }
            };
            if entry.hash() != &hash {
                warn!(log = %self.id, %hash, got = %entry.hash(), "hash mismatch, entry dropped");
                continue;
            }
            if let Err(err) = entry.verify() {
                warn!(log = %self.id, %hash, %err, "entry failed verification, dropped");
                continue;
            }
            if !access.allows(entry.identity()) {
                warn!(log = %self.id, %hash, identity = %entry.identity(), "entry not permitted, dropped");
                continue;
            }
            for parent in entry.next() {
                if !self.entries.contains_key(parent) && queued.insert(parent.clone()) {
                    queue.push_back(parent.clone());
                }
            }
            self.insert(entry);
            added.push(hash);
        }

        if !added.is_empty() {
            debug!(log = %self.id, count = added.len(), "merged foreign entries");
        }
        Ok(added)
    }

    fn sort_key(entry: &Entry) -> (u64, String, Vec<u8>) {
        (
            entry.clock().time(),
            entry.clock().id().to_owned(),
            entry.hash().to_bytes(),
        )
    }

    /// All entries flattened to the deterministic linearization:
    /// `(clock.time, clock.id, hash)` ascending. Two replicas holding the
    /// same entry set produce the same sequence.
    fn linearized(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_cached_key(|e| Log::sort_key(e));
        entries
    }

    /// All entries oldest-first.
    pub fn values(&self) -> Vec<&Entry> {
        self.linearized()
    }

    /// Bounded, ordered traversal. Boundary hashes not present in the log
    /// leave the corresponding bound open.
    pub fn iter(&self, options: &IterOptions) -> Vec<&Entry> {
        let ordered = self.linearized();
        let position =
            |hash: &Cid| ordered.iter().position(|entry| entry.hash() == hash);

        let mut start = 0;
        let mut end = ordered.len();
        if let Some(hash) = &options.gte {
            if let Some(at) = position(hash) {
                start = start.max(at);
            }
        }
        if let Some(hash) = &options.gt {
            if let Some(at) = position(hash) {
                start = start.max(at + 1);
            }
        }
        if let Some(hash) = &options.lte {
            if let Some(at) = position(hash) {
                end = end.min(at + 1);
            }
        }
        if let Some(hash) = &options.lt {
            if let Some(at) = position(hash) {
                end = end.min(at);
            }
        }
        if start > end {
            start = end;
        }

        let mut result: Vec<&Entry> = ordered[start..end].to_vec();
        if options.reverse {
            result.reverse();
        }
        if options.limit >= 0 {
            result.truncate(options.limit as usize);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Capability;
    use crate::services::MemoryStore;
    use std::sync::Arc;

    struct Replica {
        log: Log,
        keystore: Arc<Keystore>,
        access: AccessController,
    }

    fn replica(name: &str, store_id: &str, keystore: Arc<Keystore>) -> Replica {
        let identity = keystore.identity(name).unwrap();
        let mut access = AccessController::new();
        access.add(Capability::Write, crate::access::ANY_WRITER);
        Replica {
            log: Log::new(store_id, identity),
            keystore,
            access,
        }
    }

    fn append(replica: &mut Replica, store: &MemoryStore, payload: &[u8]) -> Entry {
        let entry = replica
            .log
            .append(payload, &replica.keystore, &replica.access)
            .unwrap();
        store.put(&entry.encoded().unwrap()).unwrap();
        entry
    }

    fn payloads(entries: &[&Entry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| String::from_utf8(e.payload().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn append_advances_clock_and_heads() {
        let keystore = Arc::new(Keystore::new());
        let store = MemoryStore::new();
        let mut a = replica("a", "log-1", keystore);

        let first = append(&mut a, &store, b"one");
        assert_eq!(first.clock().time(), 1);
        assert!(first.next().is_empty());

        let second = append(&mut a, &store, b"two");
        assert_eq!(second.clock().time(), 2);
        assert_eq!(second.next(), &[first.hash().clone()]);

        assert_eq!(a.log.len(), 2);
        assert_eq!(a.log.head_hashes(), vec![second.hash().clone()]);
    }

    #[test]
    fn heads_are_entries_without_children() {
        let keystore = Arc::new(Keystore::new());
        let store = MemoryStore::new();
        let mut a = replica("a", "log-1", keystore.clone());
        let mut b = replica("b", "log-1", keystore);

        append(&mut a, &store, b"a1");
        append(&mut b, &store, b"b1");
        append(&mut b, &store, b"b2");

        // two divergent branches produce two heads
        a.log
            .merge(&b.log.head_hashes(), &store, &a.access)
            .unwrap();
        assert_eq!(a.log.len(), 3);
        assert_eq!(a.log.heads().len(), 2);

        // appending on top of both heads collapses the frontier
        let joined = append(&mut a, &store, b"a2");
        assert_eq!(joined.next().len(), 2);
        assert_eq!(a.log.head_hashes(), vec![joined.hash().clone()]);

        // invariant: an entry is a head iff nothing lists it in next
        for entry in a.log.values() {
            let referenced = a
                .log
                .values()
                .iter()
                .any(|e| e.next().contains(entry.hash()));
            let is_head = a.log.head_hashes().contains(entry.hash());
            assert_eq!(is_head, !referenced);
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let keystore = Arc::new(Keystore::new());
        let store = MemoryStore::new();
        let mut a = replica("a", "log-1", keystore.clone());
        let mut b = replica("b", "log-1", keystore);

        append(&mut b, &store, b"b1");
        append(&mut b, &store, b"b2");
        let heads = b.log.head_hashes();

        let added = a.log.merge(&heads, &store, &a.access).unwrap();
        assert_eq!(added.len(), 2);
        let again = a.log.merge(&heads, &store, &a.access).unwrap();
        assert!(again.is_empty());
        assert_eq!(a.log.len(), 2);
    }

    #[test]
    fn merge_is_commutative() {
        let keystore = Arc::new(Keystore::new());
        let store = MemoryStore::new();
        let mut a = replica("a", "log-1", keystore.clone());
        let mut b = replica("b", "log-1", keystore.clone());

        append(&mut a, &store, b"a1");
        append(&mut a, &store, b"a2");
        append(&mut b, &store, b"b1");
        let heads_a = a.log.head_hashes();
        let heads_b = b.log.head_hashes();

        let mut first = replica("c", "log-1", keystore.clone());
        first.log.merge(&heads_a, &store, &first.access).unwrap();
        first.log.merge(&heads_b, &store, &first.access).unwrap();

        let mut second = replica("d", "log-1", keystore);
        second.log.merge(&heads_b, &store, &second.access).unwrap();
        second.log.merge(&heads_a, &store, &second.access).unwrap();

        assert_eq!(
            payloads(&first.log.values()),
            payloads(&second.log.values())
        );
        assert_eq!(first.log.head_hashes(), second.log.head_hashes());
    }

    #[test]
    fn merge_fetches_ancestors() {
        let keystore = Arc::new(Keystore::new());
        let store = MemoryStore::new();
        let mut a = replica("a", "log-1", keystore.clone());
        for i in 0..10 {
            append(&mut a, &store, format!("entry{}", i).as_bytes());
        }

        let mut b = replica("b", "log-1", keystore);
        let added = b
            .log
            .merge(&a.log.head_hashes(), &store, &b.access)
            .unwrap();
        assert_eq!(added.len(), 10);
        assert_eq!(payloads(&b.log.values()), payloads(&a.log.values()));
    }

    #[test]
    fn merge_drops_unpermitted_entries() {
        let keystore = Arc::new(Keystore::new());
        let store = MemoryStore::new();
        let mut intruder = replica("intruder", "log-1", keystore.clone());
        append(&mut intruder, &store, b"forged");

        let victim_identity = keystore.identity("victim").unwrap();
        let mut access = AccessController::new();
        access.add(Capability::Write, victim_identity.pub_key());
        let mut log = Log::new("log-1", victim_identity);

        let added = log
            .merge(&intruder.log.head_hashes(), &store, &access)
            .unwrap();
        assert!(added.is_empty());
        assert!(log.is_empty());
    }

    #[test]
    fn append_respects_access_controller() {
        let keystore = Keystore::new();
        let outsider = keystore.identity("outsider").unwrap();
        let insider = keystore.identity("insider").unwrap();
        let mut access = AccessController::new();
        access.add(Capability::Write, insider.pub_key());

        let mut log = Log::new("log-1", outsider);
        let result = log.append(b"nope", &keystore, &access);
        assert!(matches!(result, Err(Error::AccessDenied(_))));
        assert!(log.is_empty());
    }

    #[test]
    fn iterator_orders_bounds_and_limits() {
        let keystore = Arc::new(Keystore::new());
        let store = MemoryStore::new();
        let mut a = replica("a", "log-1", keystore);
        let mut hashes = Vec::new();
        for i in 0..5 {
            hashes.push(append(&mut a, &store, format!("e{}", i).as_bytes()));
        }

        let all = a.log.iter(&IterOptions::default());
        assert_eq!(payloads(&all), vec!["e0", "e1", "e2", "e3", "e4"]);

        let reversed = a.log.iter(&IterOptions::new().reverse(true).limit(2));
        assert_eq!(payloads(&reversed), vec!["e4", "e3"]);

        let after = a.log.iter(&IterOptions::new().gt(hashes[1].hash().clone()));
        assert_eq!(payloads(&after), vec!["e2", "e3", "e4"]);

        let window = a.log.iter(
            &IterOptions::new()
                .gte(hashes[1].hash().clone())
                .lte(hashes[3].hash().clone()),
        );
        assert_eq!(payloads(&window), vec!["e1", "e2", "e3"]);

        let strict = a.log.iter(
            &IterOptions::new()
                .gt(hashes[1].hash().clone())
                .lt(hashes[3].hash().clone()),
        );
        assert_eq!(payloads(&strict), vec!["e2"]);

        let none = a.log.iter(&IterOptions::new().limit(0));
        assert!(none.is_empty());
    }

    #[test]
    fn iteration_is_identical_across_replicas() {
        let keystore = Arc::new(Keystore::new());
        let store = MemoryStore::new();
        let mut a = replica("a", "log-1", keystore.clone());
        let mut b = replica("b", "log-1", keystore);

        append(&mut a, &store, b"a1");
        append(&mut b, &store, b"b1");
        append(&mut a, &store, b"a2");
        append(&mut b, &store, b"b2");

        let heads_a = a.log.head_hashes();
        let heads_b = b.log.head_hashes();
        a.log.merge(&heads_b, &store, &a.access).unwrap();
        b.log.merge(&heads_a, &store, &b.access).unwrap();

        assert_eq!(payloads(&a.log.values()), payloads(&b.log.values()));
        let opts = IterOptions::new().reverse(true).limit(3);
        assert_eq!(payloads(&a.log.iter(&opts)), payloads(&b.log.iter(&opts)));
    }
}
