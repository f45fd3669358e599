//! Error types shared across the crate.

/// Convenience alias used by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by database creation, opening, appending and replication.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested database type is not one of the known store kinds.
    #[error("invalid database type: {0}")]
    InvalidType(String),
    /// A database address was required but the input did not parse as one.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// `create` was handed an address where a bare name was required.
    #[error("given database name is an address: {0}")]
    NameIsAddress(String),
    /// The local cache already holds a manifest for this database.
    #[error("database already exists: {0}")]
    AlreadyExists(String),
    /// A local-only open found no trace of the database in the cache.
    #[error("database not found locally: {0}")]
    NotFound(String),
    /// The manifest on record disagrees with the requested database type.
    #[error("type mismatch: manifest says {manifest}, requested {requested}")]
    TypeMismatch { manifest: String, requested: String },
    /// The entry author is not allowed to write to this database.
    #[error("access denied for identity {0}")]
    AccessDenied(String),
    /// An entry failed hash or signature verification.
    #[error("entry integrity failure: {0}")]
    Integrity(String),
    /// The object store or the pub/sub bus failed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// A document lacks the configured index field.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    /// A polled wait elapsed before its condition held.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// The store was closed while the operation was in flight.
    #[error("store is closed")]
    Closed,

    #[error("cbor encoding: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("json encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("content address: {0}")]
    Cid(#[from] cid::Error),
    #[error("multihash: {0}")]
    Multihash(#[from] multihash::Error),
    #[error("key: {0}")]
    Key(#[from] secp256k1::Error),
}
