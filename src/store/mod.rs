//! Generic document store interface.
//!
//! The engine only ever talks to a [`DocumentStore`]. Every store must give
//! single-document atomicity through versioned writes and
//! [`DocumentStore::conditional_update`]; multi-document
//! [`DocumentStore::transaction`] is optional and advertised through
//! [`DocumentStore::supports_transactions`].

mod local;

pub use local::LocalStore;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{EventDoc, LocationDoc, UserDoc};

/// Monotonic per-key write counter. Survives deletes so a re-created
/// document never reuses an old version.
pub type Version = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    Events,
    Locations,
    Users,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Events => "events",
            Collection::Locations => "locations",
            Collection::Users => "users",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: Collection,
    pub id: String,
}

impl DocKey {
    pub fn event(id: impl Into<String>) -> Self {
        Self { collection: Collection::Events, id: id.into() }
    }

    pub fn location(id: impl Into<String>) -> Self {
        Self { collection: Collection::Locations, id: id.into() }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self { collection: Collection::Users, id: id.into() }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Doc {
    Event(EventDoc),
    Location(LocationDoc),
    User(UserDoc),
}

impl Doc {
    pub fn key(&self) -> DocKey {
        match self {
            Doc::Event(e) => DocKey::event(&e.event_id),
            Doc::Location(l) => DocKey::location(&l.location_id),
            Doc::User(u) => DocKey::user(&u.user_id),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        let bytes = match self {
            Doc::Event(e) => serde_json::to_vec(e),
            Doc::Location(l) => serde_json::to_vec(l),
            Doc::User(u) => serde_json::to_vec(u),
        };
        bytes.map_err(|e| StoreError::Codec(e.to_string()))
    }

    pub fn from_json(collection: Collection, body: &[u8]) -> Result<Self, StoreError> {
        let doc = match collection {
            Collection::Events => serde_json::from_slice(body).map(Doc::Event),
            Collection::Locations => serde_json::from_slice(body).map(Doc::Location),
            Collection::Users => serde_json::from_slice(body).map(Doc::User),
        };
        doc.map_err(|e| StoreError::Codec(e.to_string()))
    }

    pub fn into_event(self) -> Option<EventDoc> {
        match self {
            Doc::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_location(self) -> Option<LocationDoc> {
        match self {
            Doc::Location(l) => Some(l),
            _ => None,
        }
    }

    pub fn into_user(self) -> Option<UserDoc> {
        match self {
            Doc::User(u) => Some(u),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub doc: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned { doc: f(self.doc), version: self.version }
    }
}

/// Precondition on the current state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    Absent,
    Version(Version),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put { doc: Doc, expect: Expect },
    Delete { key: DocKey, expect: Expect },
}

impl WriteOp {
    pub fn key(&self) -> DocKey {
        match self {
            WriteOp::Put { doc, .. } => doc.key(),
            WriteOp::Delete { key, .. } => key.clone(),
        }
    }

    pub fn expect(&self) -> Expect {
        match self {
            WriteOp::Put { expect, .. } | WriteOp::Delete { expect, .. } => *expect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A version/absence expectation did not hold. Safe to re-read and retry.
    Conflict(DocKey),
    /// `conditional_update` predicate returned false.
    PreconditionFailed(DocKey),
    NotFound(DocKey),
    TransactionsUnsupported,
    /// The request itself is malformed (e.g. the same key twice in one transaction).
    InvalidRequest(String),
    Codec(String),
    Wal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict(key) => write!(f, "concurrent modification of {key}"),
            StoreError::PreconditionFailed(key) => write!(f, "precondition failed on {key}"),
            StoreError::NotFound(key) => write!(f, "not found: {key}"),
            StoreError::TransactionsUnsupported => {
                write!(f, "store does not support multi-document transactions")
            }
            StoreError::InvalidRequest(e) => write!(f, "invalid store request: {e}"),
            StoreError::Codec(e) => write!(f, "codec error: {e}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type Predicate<'a> = &'a (dyn Fn(&Versioned<Doc>) -> bool + Send + Sync);
pub type Mutator<'a> = &'a (dyn Fn(&mut Doc) + Send + Sync);

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &DocKey) -> Result<Option<Versioned<Doc>>, StoreError>;

    /// Write a whole document if `expect` holds. Returns the new version.
    async fn put(&self, doc: Doc, expect: Expect) -> Result<Version, StoreError>;

    async fn delete(&self, key: &DocKey, expect: Expect) -> Result<(), StoreError>;

    /// Atomically evaluate `predicate` against the current document and, if it
    /// holds, apply `mutator` and bump the version. The mutator must not change
    /// the document's id.
    async fn conditional_update(
        &self,
        key: &DocKey,
        predicate: Predicate<'_>,
        mutator: Mutator<'_>,
    ) -> Result<Versioned<Doc>, StoreError>;

    fn supports_transactions(&self) -> bool;

    /// Apply every op or none. Fails with `Conflict` if any expectation fails.
    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    async fn scan(&self, collection: Collection) -> Result<Vec<Versioned<Doc>>, StoreError>;
}
