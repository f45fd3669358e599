//! Peer-to-peer, serverless databases over a content-addressed object store
//! and a pub/sub bus.
//!
//! Each database is a named, typed, replicated log whose entries are
//! immutable, signed, content-addressed records forming a DAG of causal
//! history. Peers append concurrently and converge by gossiping head sets
//! and merging. The five database flavors (event log, feed, key/value,
//! counter, document store) are read projections over the same log.
//!
//! The [`Manager`] is the entry point: it mints addresses, resolves
//! manifests and owns the open [`Store`]s. Managers sharing a
//! [`ContentStore`] and a [`PubSub`] bus form a network; the bundled
//! in-memory services make that network runnable inside a single process.

mod access;
mod address;
mod entry;
mod error;
mod gcounter;
mod identity;
mod keystore;
mod lamport_clock;
mod log;
mod manager;
mod manifest;
mod replicator;
mod services;
mod store;

pub use access::{AccessController, Capability, ANY_WRITER};
pub use address::{Address, SCHEME};
pub use entry::Entry;
pub use error::{Error, Result};
pub use gcounter::GCounter;
pub use identity::{Identity, Signatures};
pub use keystore::Keystore;
pub use lamport_clock::LamportClock;
pub use log::{IterOptions, Log};
pub use manager::{Manager, StoreOptions};
pub use manifest::Manifest;
pub use replicator::{Replicator, SubscriptionState, SETTLE_DELAY};
pub use services::{
    Bucket, BusMessage, CacheStore, ContentStore, MemoryBus, MemoryCache, MemoryStore, PubSub,
    SLOT_HEADS, SLOT_LOCAL_HEADS, SLOT_MANIFEST,
};
pub use store::{Store, StoreEvent, StoreKind};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn logs_join_across_replicas() {
        let keystore = Keystore::new();
        let store = MemoryStore::new();
        let mut wildcard = AccessController::new();
        wildcard.add(Capability::Write, ANY_WRITER);

        let mut x = Log::new("xyz", keystore.identity("x").unwrap());
        let mut y = Log::new("xyz", keystore.identity("y").unwrap());
        for payload in &["to", "set", "your", "global"] {
            let entry = x.append(payload.as_bytes(), &keystore, &wildcard).unwrap();
            store.put(&entry.encoded().unwrap()).unwrap();
        }
        for payload in &["fifth", "sixth"] {
            let entry = y.append(payload.as_bytes(), &keystore, &wildcard).unwrap();
            store.put(&entry.encoded().unwrap()).unwrap();
        }

        y.merge(&x.head_hashes(), &store, &wildcard).unwrap();
        assert_eq!(y.len(), 6);
        assert_eq!(y.heads().len(), 2);

        // joining the other way lands on the same state
        x.merge(&y.head_hashes(), &store, &wildcard).unwrap();
        assert_eq!(x.len(), 6);
        let x_payloads: Vec<&[u8]> = x.values().iter().map(|e| e.payload()).collect();
        let y_payloads: Vec<&[u8]> = y.values().iter().map(|e| e.payload()).collect();
        assert_eq!(x_payloads, y_payloads);
    }

    #[tokio::test]
    async fn database_smoke_test() {
        let manager = Manager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBus::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(Keystore::new()),
            "self",
        )
        .unwrap();

        let db = manager
            .eventlog("smoke", StoreOptions::new())
            .await
            .unwrap();
        db.add(b"it lives").await.unwrap();
        let entries = db.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"it lives".to_vec());
        manager.disconnect().await;
    }
}
