//! The database manager: mints addresses, resolves manifests, instantiates
//! typed stores and wires them to replication.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::access::{AccessController, Capability};
use crate::address::Address;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::keystore::Keystore;
use crate::manifest::Manifest;
use crate::replicator::Replicator;
use crate::services::{Bucket, CacheStore, ContentStore, PubSub, SLOT_MANIFEST};
use crate::store::{Store, StoreKind};

/// Options for [`Manager::create`] and [`Manager::open`], built by method
/// chaining off [`StoreOptions::new`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    kind: Option<StoreKind>,
    create: bool,
    overwrite: bool,
    replicate: bool,
    local_only: bool,
    write: Option<Vec<String>>,
    index_by: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            kind: None,
            create: false,
            overwrite: false,
            replicate: true,
            local_only: false,
            write: None,
            index_by: "_id".to_owned(),
        }
    }
}

impl StoreOptions {
    pub fn new() -> StoreOptions {
        StoreOptions::default()
    }

    /// The database type to create, or to insist on when opening.
    pub fn kind(mut self, kind: StoreKind) -> StoreOptions {
        self.kind = Some(kind);
        self
    }

    /// Allow `open` to create the database when given a bare name.
    pub fn create(mut self, create: bool) -> StoreOptions {
        self.create = create;
        self
    }

    /// Replace an existing cache manifest slot instead of failing.
    pub fn overwrite(mut self, overwrite: bool) -> StoreOptions {
        self.overwrite = overwrite;
        self
    }

    /// Subscribe the store on the pub/sub bus. On by default.
    pub fn replicate(mut self, replicate: bool) -> StoreOptions {
        self.replicate = replicate;
        self
    }

    /// Fail instead of touching the network when the database has never
    /// been seen locally.
    pub fn local_only(mut self, local_only: bool) -> StoreOptions {
        self.local_only = local_only;
        self
    }

    /// Public keys granted write access at creation. Defaults to the
    /// creator's own key.
    pub fn write(mut self, writers: Vec<String>) -> StoreOptions {
        self.write = Some(writers);
        self
    }

    /// Document field used as the docstore id. Defaults to `"_id"`.
    pub fn index_by(mut self, field: &str) -> StoreOptions {
        self.index_by = field.to_owned();
        self
    }
}

/// Top-level façade over one peer's databases.
///
/// Owns the active stores, shares one keystore and one cache across them,
/// and runs the replication coordinator. A process may host several
/// managers; managers sharing a content store and bus form a network.
pub struct Manager {
    content: Arc<dyn ContentStore>,
    bus: Arc<dyn PubSub>,
    cache: Arc<dyn CacheStore>,
    keystore: Arc<Keystore>,
    identity: Identity,
    replicator: Replicator,
    stores: Mutex<HashMap<String, Arc<Store>>>,
}

impl Manager {
    /// Builds a manager whose identity is the key named `key_name` in the
    /// keystore, creating the key on first use.
    pub fn new(
        content: Arc<dyn ContentStore>,
        bus: Arc<dyn PubSub>,
        cache: Arc<dyn CacheStore>,
        keystore: Arc<Keystore>,
        key_name: &str,
    ) -> Result<Manager> {
        let identity = keystore.identity(key_name)?;
        let replicator = Replicator::new(bus.clone(), identity.id());
        Ok(Manager {
            content,
            bus,
            cache,
            keystore,
            identity,
            replicator,
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn keystore(&self) -> &Arc<Keystore> {
        &self.keystore
    }

    /// Creates a new database: persists its access controller and manifest,
    /// derives the address, claims the cache slot and opens the store.
    ///
    /// Persisted objects surviving a failed create are harmless: identity
    /// is content-addressed, so retrying lands on the same address.
    pub async fn create(
        &self,
        name: &str,
        kind: StoreKind,
        options: StoreOptions,
    ) -> Result<Arc<Store>> {
        if Address::is_valid(name) {
            return Err(Error::NameIsAddress(name.to_owned()));
        }

        let mut access = AccessController::new();
        access.add(Capability::Admin, self.identity.pub_key());
        match &options.write {
            Some(writers) => {
                for writer in writers {
                    access.add(Capability::Write, writer);
                }
            }
            None => access.add(Capability::Write, self.identity.pub_key()),
        }
        let controller = access.save(self.content.as_ref())?;

        let manifest = Manifest::new(name, kind, controller);
        let root = manifest.save(self.content.as_ref())?;
        let address = Address::new(root, name);

        let root_string = address.root().to_string();
        if self.cache.get(&root_string, name, SLOT_MANIFEST).is_some() && !options.overwrite {
            return Err(Error::AlreadyExists(address.to_string()));
        }
        self.cache.put(
            &root_string,
            name,
            SLOT_MANIFEST,
            root_string.clone().into_bytes(),
        );

        debug!(%address, %kind, "created database");
        self.open_address(&address, options.kind(kind)).await
    }

    /// Opens a database by address. Given a bare name with `create` set and
    /// a kind supplied, falls through to [`Manager::create`].
    pub async fn open(&self, location: &str, options: StoreOptions) -> Result<Arc<Store>> {
        match Address::parse(location) {
            Ok(address) => self.open_address(&address, options).await,
            Err(_) if options.create => {
                let kind = match options.kind {
                    Some(kind) => kind,
                    None => return Err(Error::InvalidType("unspecified".to_owned())),
                };
                self.create(location, kind, options.overwrite(true)).await
            }
            Err(err) => Err(err),
        }
    }

    async fn open_address(&self, address: &Address, options: StoreOptions) -> Result<Arc<Store>> {
        let key = address.to_string();
        {
            let stores = self.stores.lock().await;
            if let Some(existing) = stores.get(&key) {
                if let Some(requested) = options.kind {
                    if requested != existing.kind() {
                        return Err(Error::TypeMismatch {
                            manifest: existing.kind().to_string(),
                            requested: requested.to_string(),
                        });
                    }
                }
                return Ok(existing.clone());
            }
        }

        let root = address.root().to_string();
        // probe before any fetch or cache write so a miss leaves no trace
        if options.local_only
            && self.cache.get(&root, address.path(), SLOT_MANIFEST).is_none()
        {
            return Err(Error::NotFound(key));
        }

        let manifest = Manifest::load(self.content.as_ref(), address.root())?;
        if let Some(requested) = options.kind {
            if requested != manifest.kind() {
                return Err(Error::TypeMismatch {
                    manifest: manifest.kind().to_string(),
                    requested: requested.to_string(),
                });
            }
        }
        let access = AccessController::load(self.content.as_ref(), manifest.access_controller())?;

        self.cache
            .put(&root, address.path(), SLOT_MANIFEST, root.clone().into_bytes());
        let bucket = Bucket::new(self.cache.clone(), &root, address.path());
        let store = Arc::new(Store::new(
            address.clone(),
            manifest.kind(),
            self.identity.clone(),
            self.keystore.clone(),
            Arc::new(access),
            self.content.clone(),
            bucket,
            &options.index_by,
        ));

        let recovered = store.load().await?;
        if recovered > 0 {
            debug!(%address, recovered, "recovered history from cache");
        }
        if options.replicate {
            self.replicator.subscribe(&store)?;
        }
        store.emit_ready().await;

        let mut stores = self.stores.lock().await;
        let registered = stores.entry(key).or_insert_with(|| store.clone());
        Ok(registered.clone())
    }

    /// Closes one database and forgets it. The address becomes openable
    /// again, resuming from the cached heads.
    pub async fn close(&self, location: &str) -> Result<()> {
        let key = Address::parse(location)?.to_string();
        let store = { self.stores.lock().await.remove(&key) };
        match store {
            Some(store) => {
                self.replicator.unsubscribe(&key);
                store.close();
                Ok(())
            }
            None => Err(Error::NotFound(key)),
        }
    }

    /// Closes every store and tears down all bus subscriptions.
    pub async fn disconnect(&self) {
        let stores: Vec<(String, Arc<Store>)> =
            { self.stores.lock().await.drain().collect() };
        for (channel, store) in stores {
            self.replicator.unsubscribe(&channel);
            store.close();
        }
        self.replicator.disconnect();
    }

    /// Polls the bus until `count` other peers subscribe to the database's
    /// channel, or fails with a timeout.
    pub async fn wait_for_peers(
        &self,
        address: &Address,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let channel = address.to_string();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let peers: Vec<String> = self
                .bus
                .peers(&channel)
                .into_iter()
                .filter(|peer| peer.as_str() != self.replicator.peer_id())
                .collect();
            if peers.len() >= count {
                return Ok(peers);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("{} peers on {}", count, channel)));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // Convenience factories: open-or-create with the kind pinned.

    pub async fn eventlog(&self, location: &str, options: StoreOptions) -> Result<Arc<Store>> {
        self.open(location, options.kind(StoreKind::EventLog).create(true))
            .await
    }

    pub async fn feed(&self, location: &str, options: StoreOptions) -> Result<Arc<Store>> {
        self.open(location, options.kind(StoreKind::Feed).create(true))
            .await
    }

    pub async fn keyvalue(&self, location: &str, options: StoreOptions) -> Result<Arc<Store>> {
        self.open(location, options.kind(StoreKind::KeyValue).create(true))
            .await
    }

    pub async fn counter(&self, location: &str, options: StoreOptions) -> Result<Arc<Store>> {
        self.open(location, options.kind(StoreKind::Counter).create(true))
            .await
    }

    pub async fn docstore(&self, location: &str, options: StoreOptions) -> Result<Arc<Store>> {
        self.open(location, options.kind(StoreKind::DocStore).create(true))
            .await
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Manager({})", self.identity.id())
    }
}
