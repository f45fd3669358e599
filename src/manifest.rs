use cid::Cid;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::str::FromStr;

use crate::error::Result;
use crate::services::ContentStore;
use crate::store::StoreKind;

/// Immutable database descriptor. Its content address is the database's
/// root identity: everything else about the database is reachable from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    name: String,
    kind: StoreKind,
    access_controller: Cid,
}

#[derive(Serialize, Deserialize)]
struct ManifestIo {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "accessController")]
    access_controller: String,
}

impl Manifest {
    pub fn new(name: &str, kind: StoreKind, access_controller: Cid) -> Manifest {
        Manifest {
            name: name.to_owned(),
            kind,
            access_controller,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn access_controller(&self) -> &Cid {
        &self.access_controller
    }

    /// Persists the canonical JSON encoding and returns its address.
    pub fn save(&self, store: &dyn ContentStore) -> Result<Cid> {
        let io = ManifestIo {
            name: self.name.clone(),
            kind: self.kind.as_str().to_owned(),
            access_controller: self.access_controller.to_string(),
        };
        store.put(&serde_json::to_vec(&io)?)
    }

    /// Fetches and decodes a manifest from the object store.
    pub fn load(store: &dyn ContentStore, hash: &Cid) -> Result<Manifest> {
        let bytes = store.get(hash)?;
        let io: ManifestIo = serde_json::from_slice(&bytes)?;
        Ok(Manifest {
            name: io.name,
            kind: StoreKind::from_str(&io.kind)?,
            access_controller: Cid::try_from(io.access_controller.as_str())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::cid_of;
    use crate::services::MemoryStore;

    #[test]
    fn save_load_round_trips() {
        let store = MemoryStore::new();
        let controller = cid_of(b"controller").unwrap();
        let manifest = Manifest::new("db-1", StoreKind::EventLog, controller);
        let hash = manifest.save(&store).unwrap();
        let loaded = Manifest::load(&store, &hash).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn identical_manifests_share_an_address() {
        let store = MemoryStore::new();
        let controller = cid_of(b"controller").unwrap();
        let first = Manifest::new("db-1", StoreKind::KeyValue, controller.clone())
            .save(&store)
            .unwrap();
        let second = Manifest::new("db-1", StoreKind::KeyValue, controller)
            .save(&store)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_kind_fails_to_load() {
        let store = MemoryStore::new();
        let bytes =
            br#"{"name":"db","type":"graph","accessController":"bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi"}"#;
        let hash = store.put(bytes).unwrap();
        assert!(Manifest::load(&store, &hash).is_err());
    }
}
