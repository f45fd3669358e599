//! A typed database over one operation log.
//!
//! All five database flavors share this type: the flavor decides how write
//! payloads are encoded and how reads project the log. Writes always go
//! through the log's append path; projections never mutate history.

use cid::Cid;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::warn;

use crate::access::AccessController;
use crate::address::Address;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::gcounter::GCounter;
use crate::identity::Identity;
use crate::keystore::Keystore;
use crate::log::{IterOptions, Log};
use crate::services::{Bucket, ContentStore, SLOT_HEADS, SLOT_LOCAL_HEADS};

/// The five database flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    EventLog,
    Feed,
    KeyValue,
    Counter,
    DocStore,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::EventLog => "eventlog",
            StoreKind::Feed => "feed",
            StoreKind::KeyValue => "keyvalue",
            StoreKind::Counter => "counter",
            StoreKind::DocStore => "docstore",
        }
    }

    pub fn all() -> &'static [StoreKind] {
        &[
            StoreKind::EventLog,
            StoreKind::Feed,
            StoreKind::KeyValue,
            StoreKind::Counter,
            StoreKind::DocStore,
        ]
    }
}

impl FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<StoreKind> {
        match s {
            "eventlog" => Ok(StoreKind::EventLog),
            "feed" => Ok(StoreKind::Feed),
            "keyvalue" => Ok(StoreKind::KeyValue),
            "counter" => Ok(StoreKind::Counter),
            "docstore" => Ok(StoreKind::DocStore),
            other => Err(Error::InvalidType(other.to_owned())),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications emitted by a store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// History has been loaded; the store is usable.
    Ready { address: String, heads: Vec<Cid> },
    /// A local append landed.
    Write {
        address: String,
        entry: Entry,
        heads: Vec<Cid>,
    },
    /// A remote merge added entries.
    Replicated { address: String, heads: Vec<Cid> },
    /// The store released its resources.
    Closed { address: String },
}

// Per-flavor write payloads, CBOR-encoded into entry payloads.

#[derive(Serialize, Deserialize)]
enum FeedOp {
    Add(ByteBuf),
    Del(String),
}

#[derive(Serialize, Deserialize)]
struct KvOp {
    key: String,
    value: Option<ByteBuf>,
}

#[derive(Serialize, Deserialize)]
enum DocOp {
    Put(serde_json::Value),
    Del(String),
}

#[derive(Serialize, Deserialize)]
struct CounterOp {
    value: u64,
}

/// A handle to one open database.
pub struct Store {
    address: Address,
    kind: StoreKind,
    identity: Identity,
    keystore: Arc<Keystore>,
    access: Arc<AccessController>,
    content: Arc<dyn ContentStore>,
    log: Mutex<Log>,
    bucket: Bucket,
    events: broadcast::Sender<StoreEvent>,
    heads_tx: watch::Sender<Vec<Cid>>,
    index_by: String,
    closed: AtomicBool,
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: Address,
        kind: StoreKind,
        identity: Identity,
        keystore: Arc<Keystore>,
        access: Arc<AccessController>,
        content: Arc<dyn ContentStore>,
        bucket: Bucket,
        index_by: &str,
    ) -> Store {
        let log = Log::new(&address.to_string(), identity.clone());
        let (events, _) = broadcast::channel(64);
        let (heads_tx, _) = watch::channel(Vec::new());
        Store {
            address,
            kind,
            identity,
            keystore,
            access,
            content,
            log: Mutex::new(log),
            bucket,
            events,
            heads_tx,
            index_by: index_by.to_owned(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn access(&self) -> &AccessController {
        &self.access
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// The latest-heads channel observed by the replication coordinator.
    /// Intermediate frontiers are coalesced away by the watch semantics.
    pub(crate) fn heads_watch(&self) -> watch::Receiver<Vec<Cid>> {
        self.heads_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }

    pub async fn heads(&self) -> Vec<Cid> {
        self.log.lock().await.head_hashes()
    }

    pub async fn entry(&self, hash: &Cid) -> Option<Entry> {
        self.log.lock().await.get(hash).cloned()
    }

    /// Bounded, ordered traversal of the raw log.
    pub async fn iter(&self, options: &IterOptions) -> Vec<Entry> {
        let log = self.log.lock().await;
        log.iter(options).into_iter().cloned().collect()
    }

    /// Replays history from the cached head set through the object store.
    /// Returns the number of entries recovered.
    pub async fn load(&self) -> Result<usize> {
        let cached = match self.bucket.get(SLOT_HEADS) {
            Some(bytes) => bytes,
            None => return Ok(0),
        };
        let heads = decode_heads(&cached)?;
        let mut log = self.log.lock().await;
        let added = log.merge(&heads, self.content.as_ref(), &self.access)?;
        let current = log.head_hashes();
        drop(log);
        self.heads_tx.send_replace(current);
        Ok(added.len())
    }

    pub(crate) async fn emit_ready(&self) {
        let heads = self.log.lock().await.head_hashes();
        let _ = self.events.send(StoreEvent::Ready {
            address: self.address.to_string(),
            heads,
        });
    }

    /// Appends an opaque payload. The flavor-specific writers below encode
    /// their operations and come through here.
    pub async fn append(&self, payload: &[u8]) -> Result<Entry> {
        let mut log = self.log.lock().await;
        let (entry, heads) = self.append_locked(&mut log, payload)?;
        drop(log);
        self.finish_append(&entry, heads);
        Ok(entry)
    }

    /// The append path proper: draft against current heads, gate on the
    /// access controller, persist to the object store, only then mutate the
    /// DAG. A failure anywhere leaves the log untouched.
    fn append_locked(&self, log: &mut Log, payload: &[u8]) -> Result<(Entry, Vec<Cid>)> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let entry = log.draft(payload, &self.keystore)?;
        if !self.access.can_append(&entry) {
            return Err(Error::AccessDenied(entry.identity().to_owned()));
        }
        let stored = self.content.put(&entry.encoded()?)?;
        if &stored != entry.hash() {
            return Err(Error::Integrity(format!(
                "object store addressed entry as {}",
                stored
            )));
        }
        log.insert(entry.clone());
        Ok((entry, log.head_hashes()))
    }

    fn finish_append(&self, entry: &Entry, heads: Vec<Cid>) {
        self.bucket.put(SLOT_HEADS, encode_heads(&heads));
        self.bucket
            .put(SLOT_LOCAL_HEADS, encode_heads(&[entry.hash().clone()]));
        let _ = self.events.send(StoreEvent::Write {
            address: self.address.to_string(),
            entry: entry.clone(),
            heads: heads.clone(),
        });
        self.heads_tx.send_replace(heads);
    }

    /// Merges a foreign head set announced over pub/sub. Emits `Replicated`
    /// when the merge actually added entries.
    pub(crate) async fn apply_remote_heads(&self, foreign: &[Cid]) -> Result<Vec<Cid>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut log = self.log.lock().await;
        let added = log.merge(foreign, self.content.as_ref(), &self.access)?;
        let heads = log.head_hashes();
        drop(log);
        if !added.is_empty() {
            self.bucket.put(SLOT_HEADS, encode_heads(&heads));
            let _ = self.events.send(StoreEvent::Replicated {
                address: self.address.to_string(),
                heads,
            });
        }
        Ok(added)
    }

    /// Emits `Closed` and refuses further writes. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(StoreEvent::Closed {
                address: self.address.to_string(),
            });
        }
    }

    fn expect_kind(&self, expected: &[StoreKind]) -> Result<()> {
        if expected.contains(&self.kind) {
            Ok(())
        } else {
            Err(Error::InvalidType(self.kind.as_str().to_owned()))
        }
    }

    // ---- eventlog / feed ----

    /// Appends a value to an eventlog or feed.
    pub async fn add(&self, data: &[u8]) -> Result<Cid> {
        self.expect_kind(&[StoreKind::EventLog, StoreKind::Feed])?;
        let entry = match self.kind {
            StoreKind::Feed => {
                let op = FeedOp::Add(ByteBuf::from(data.to_vec()));
                self.append(&serde_cbor::to_vec(&op)?).await?
            }
            _ => self.append(data).await?,
        };
        Ok(entry.hash().clone())
    }

    /// Tombstones a prior feed entry. The tombstone may precede its target
    /// on slow replicas; the projection tolerates either arrival order.
    pub async fn remove(&self, hash: &Cid) -> Result<Cid> {
        self.expect_kind(&[StoreKind::Feed])?;
        let op = FeedOp::Del(hash.to_string());
        let entry = self.append(&serde_cbor::to_vec(&op)?).await?;
        Ok(entry.hash().clone())
    }

    /// The visible values of an eventlog or feed, oldest first. For feeds,
    /// tombstoned entries and the tombstones themselves are filtered out.
    pub async fn entries(&self) -> Result<Vec<(Cid, Vec<u8>)>> {
        self.expect_kind(&[StoreKind::EventLog, StoreKind::Feed])?;
        let log = self.log.lock().await;
        let ordered = log.values();
        if self.kind == StoreKind::EventLog {
            return Ok(ordered
                .into_iter()
                .map(|e| (e.hash().clone(), e.payload().to_vec()))
                .collect());
        }

        let mut removed: HashSet<String> = HashSet::new();
        for entry in &ordered {
            if let Ok(FeedOp::Del(target)) = serde_cbor::from_slice(entry.payload()) {
                removed.insert(target);
            }
        }
        let mut visible = Vec::new();
        for entry in ordered {
            match serde_cbor::from_slice(entry.payload()) {
                Ok(FeedOp::Add(data)) => {
                    if !removed.contains(&entry.hash().to_string()) {
                        visible.push((entry.hash().clone(), data.into_vec()));
                    }
                }
                Ok(FeedOp::Del(_)) => {}
                Err(err) => {
                    warn!(store = %self.address, hash = %entry.hash(), %err, "undecodable feed op skipped");
                }
            }
        }
        Ok(visible)
    }

    // ---- keyvalue ----

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<Cid> {
        self.expect_kind(&[StoreKind::KeyValue])?;
        let op = KvOp {
            key: key.to_owned(),
            value: Some(ByteBuf::from(value.to_vec())),
        };
        let entry = self.append(&serde_cbor::to_vec(&op)?).await?;
        Ok(entry.hash().clone())
    }

    pub async fn del(&self, key: &str) -> Result<Cid> {
        self.expect_kind(&[StoreKind::KeyValue])?;
        let op = KvOp {
            key: key.to_owned(),
            value: None,
        };
        let entry = self.append(&serde_cbor::to_vec(&op)?).await?;
        Ok(entry.hash().clone())
    }

    /// The latest value written under `key`, if it has not been deleted
    /// since.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.all().await?.remove(key))
    }

    /// The full key/value projection: for every key, the payload of the
    /// greatest write targeting it in `(time, id, hash)` order.
    pub async fn all(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        self.expect_kind(&[StoreKind::KeyValue])?;
        let log = self.log.lock().await;
        let mut map = BTreeMap::new();
        for entry in log.values() {
            match serde_cbor::from_slice::<KvOp>(entry.payload()) {
                Ok(op) => match op.value {
                    Some(value) => {
                        map.insert(op.key, value.into_vec());
                    }
                    None => {
                        map.remove(&op.key);
                    }
                },
                Err(err) => {
                    warn!(store = %self.address, hash = %entry.hash(), %err, "undecodable kv op skipped");
                }
            }
        }
        Ok(map)
    }

    // ---- counter ----

    /// Adds `amount` to this peer's slot of the grow-only counter.
    pub async fn inc(&self, amount: u64) -> Result<Cid> {
        self.expect_kind(&[StoreKind::Counter])?;
        let mut log = self.log.lock().await;
        // the new slot value must be computed under the same lock that
        // orders the append, or concurrent increments would collide
        let own = Store::counter_state(&log, &self.address).get(self.identity.pub_key());
        let op = CounterOp { value: own + amount };
        let (entry, heads) = self.append_locked(&mut log, &serde_cbor::to_vec(&op)?)?;
        drop(log);
        self.finish_append(&entry, heads);
        Ok(entry.hash().clone())
    }

    /// The counter value: the sum of per-identity maxima over all increment
    /// entries.
    pub async fn value(&self) -> Result<u64> {
        self.expect_kind(&[StoreKind::Counter])?;
        let log = self.log.lock().await;
        Ok(Store::counter_state(&log, &self.address).value())
    }

    fn counter_state(log: &Log, address: &Address) -> GCounter {
        let mut counter = GCounter::new();
        for entry in log.values() {
            match serde_cbor::from_slice::<CounterOp>(entry.payload()) {
                // slots are keyed by the signed author, not by anything the
                // payload claims
                Ok(op) => counter.observe(entry.identity(), op.value),
                Err(err) => {
                    warn!(store = %address, hash = %entry.hash(), %err, "undecodable counter op skipped");
                }
            }
        }
        counter
    }

    // ---- docstore ----

    /// Upserts a document. The document id is taken from the configured
    /// index field.
    pub async fn put_doc(&self, document: &serde_json::Value) -> Result<Cid> {
        self.expect_kind(&[StoreKind::DocStore])?;
        self.doc_id(document)?;
        let op = DocOp::Put(document.clone());
        let entry = self.append(&serde_cbor::to_vec(&op)?).await?;
        Ok(entry.hash().clone())
    }

    pub async fn del_doc(&self, id: &str) -> Result<Cid> {
        self.expect_kind(&[StoreKind::DocStore])?;
        let op = DocOp::Del(id.to_owned());
        let entry = self.append(&serde_cbor::to_vec(&op)?).await?;
        Ok(entry.hash().clone())
    }

    pub async fn get_doc(&self, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.documents().await?.remove(id))
    }

    /// All documents whose latest write satisfies `predicate`.
    pub async fn query<F>(&self, predicate: F) -> Result<Vec<serde_json::Value>>
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        Ok(self
            .documents()
            .await?
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| predicate(doc))
            .collect())
    }

    async fn documents(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        self.expect_kind(&[StoreKind::DocStore])?;
        let log = self.log.lock().await;
        let mut docs = BTreeMap::new();
        for entry in log.values() {
            match serde_cbor::from_slice::<DocOp>(entry.payload()) {
                Ok(DocOp::Put(document)) => match self.doc_id(&document) {
                    Ok(id) => {
                        docs.insert(id, document);
                    }
                    Err(_) => {
                        warn!(store = %self.address, hash = %entry.hash(), "document without index field skipped");
                    }
                },
                Ok(DocOp::Del(id)) => {
                    docs.remove(&id);
                }
                Err(err) => {
                    warn!(store = %self.address, hash = %entry.hash(), %err, "undecodable doc op skipped");
                }
            }
        }
        Ok(docs)
    }

    fn doc_id(&self, document: &serde_json::Value) -> Result<String> {
        document
            .get(&self.index_by)
            .and_then(|value| value.as_str())
            .map(|id| id.to_owned())
            .ok_or_else(|| {
                Error::InvalidDocument(format!("missing string field {:?}", self.index_by))
            })
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("address", &self.address.to_string())
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn encode_heads(heads: &[Cid]) -> Vec<u8> {
    let strings: Vec<String> = heads.iter().map(|cid| cid.to_string()).collect();
    serde_json::to_vec(&strings).unwrap_or_default()
}

pub(crate) fn decode_heads(bytes: &[u8]) -> Result<Vec<Cid>> {
    use std::convert::TryFrom;
    let strings: Vec<String> = serde_json::from_slice(bytes)?;
    let mut heads = Vec::with_capacity(strings.len());
    for s in &strings {
        heads.push(Cid::try_from(s.as_str())?);
    }
    Ok(heads)
}
