//! Seams to the services the database layer runs on: a content-addressed
//! object store, a pub/sub bus and a local cache.
//!
//! The traits are what a real transport implements; the `Memory*` types are
//! reference implementations that make a whole multi-peer system runnable in
//! one process (managers sharing a `MemoryStore` and a `MemoryBus` form a
//! network).

use cid::Cid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::entry::cid_of;
use crate::error::{Error, Result};

/// Content-addressed object store: `put` returns the address of the bytes,
/// `get` resolves an address. The hash function must be stable across peers.
pub trait ContentStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<Cid>;
    fn get(&self, hash: &Cid) -> Result<Vec<u8>>;
}

/// A message delivered on a pub/sub channel.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub from: String,
    pub data: Vec<u8>,
}

/// Best-effort pub/sub bus. Duplicates and reordering are permitted;
/// receivers tolerate both because log merging is idempotent.
pub trait PubSub: Send + Sync {
    /// Subscribes `peer` to `channel` and returns the delivery stream.
    /// Subscribing a peer twice to the same channel replaces its stream.
    fn subscribe(&self, channel: &str, peer: &str) -> Result<mpsc::UnboundedReceiver<BusMessage>>;
    fn unsubscribe(&self, channel: &str, peer: &str);
    fn publish(&self, channel: &str, from: &str, data: Vec<u8>) -> Result<()>;
    fn peers(&self, channel: &str) -> Vec<String>;
}

/// Local key/value cache partitioned by `(manifest root, database name)`.
///
/// Reads of absent slots must not create state; a local-only open probes the
/// cache without leaving a trace.
pub trait CacheStore: Send + Sync {
    fn get(&self, root: &str, path: &str, slot: &str) -> Option<Vec<u8>>;
    fn put(&self, root: &str, path: &str, slot: &str, value: Vec<u8>);
    fn delete(&self, root: &str, path: &str, slot: &str);
}

/// Slot names used by stores within their cache partition.
pub const SLOT_MANIFEST: &str = "manifest";
pub const SLOT_HEADS: &str = "_heads";
pub const SLOT_LOCAL_HEADS: &str = "_localHeads";

/// A store's exclusive view onto its cache partition.
#[derive(Clone)]
pub struct Bucket {
    cache: Arc<dyn CacheStore>,
    root: String,
    path: String,
}

impl Bucket {
    pub fn new(cache: Arc<dyn CacheStore>, root: &str, path: &str) -> Bucket {
        Bucket {
            cache,
            root: root.to_owned(),
            path: path.to_owned(),
        }
    }

    pub fn get(&self, slot: &str) -> Option<Vec<u8>> {
        self.cache.get(&self.root, &self.path, slot)
    }

    pub fn put(&self, slot: &str, value: Vec<u8>) {
        self.cache.put(&self.root, &self.path, slot, value);
    }

    pub fn delete(&self, slot: &str) {
        self.cache.delete(&self.root, &self.path, slot);
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bucket({}/{})", self.root, self.path)
    }
}

/// In-memory content-addressed store.
#[derive(Default)]
pub struct MemoryStore {
    blocks: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().unwrap().is_empty()
    }
}

impl ContentStore for MemoryStore {
    fn put(&self, bytes: &[u8]) -> Result<Cid> {
        let hash = cid_of(bytes)?;
        self.blocks
            .lock()
            .unwrap()
            .entry(hash.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn get(&self, hash: &Cid) -> Result<Vec<u8>> {
        self.blocks
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("missing block {}", hash)))
    }
}

struct BusSubscriber {
    peer: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// In-process pub/sub bus delivering to every current subscriber of a
/// channel, the publisher included. Senders skip their own announcements on
/// the receiving side.
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, Vec<BusSubscriber>>>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }
}

impl PubSub for MemoryBus {
    fn subscribe(&self, channel: &str, peer: &str) -> Result<mpsc::UnboundedReceiver<BusMessage>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock().unwrap();
        let subscribers = channels.entry(channel.to_owned()).or_insert_with(Vec::new);
        subscribers.retain(|s| s.peer != peer);
        subscribers.push(BusSubscriber {
            peer: peer.to_owned(),
            sender,
        });
        Ok(receiver)
    }

    fn unsubscribe(&self, channel: &str, peer: &str) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|s| s.peer != peer);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    fn publish(&self, channel: &str, from: &str, data: Vec<u8>) -> Result<()> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(subscribers) = channels.get_mut(channel) {
            let message = BusMessage {
                channel: channel.to_owned(),
                from: from.to_owned(),
                data,
            };
            // closed receivers are pruned on the next publish
            subscribers.retain(|s| s.sender.send(message.clone()).is_ok());
        }
        Ok(())
    }

    fn peers(&self, channel: &str) -> Vec<String> {
        let channels = self.channels.lock().unwrap();
        channels
            .get(channel)
            .map(|subscribers| subscribers.iter().map(|s| s.peer.clone()).collect())
            .unwrap_or_default()
    }
}

/// In-memory cache keyed by `(root, path)` partition and slot name.
#[derive(Default)]
pub struct MemoryCache {
    buckets: Mutex<HashMap<(String, String), HashMap<String, Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }

    /// True when no partition has ever been written.
    pub fn is_empty(&self) -> bool {
        self.buckets.lock().unwrap().is_empty()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, root: &str, path: &str, slot: &str) -> Option<Vec<u8>> {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(&(root.to_owned(), path.to_owned()))
            .and_then(|bucket| bucket.get(slot).cloned())
    }

    fn put(&self, root: &str, path: &str, slot: &str, value: Vec<u8>) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry((root.to_owned(), path.to_owned()))
            .or_insert_with(HashMap::new)
            .insert(slot.to_owned(), value);
    }

    fn delete(&self, root: &str, path: &str, slot: &str) {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get_mut(&(root.to_owned(), path.to_owned())) {
            bucket.remove(slot);
        }
    }
}
