//! Domain identifiers (strongly-typed IDs).
//!
//! Every record the agent touches is addressed by a ULID wrapped in `Id<T>`,
//! where `T` is a zero-sized marker. A `TaskId` can therefore never be passed
//! where a `SessionId` is expected, and the wrapper costs nothing at runtime.
//!
//! Pod identity is different: pods are named by the cluster, not by us, so
//! `PodId` is a plain string newtype.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for id kinds; provides the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the thread-local ULID generator.
    pub fn random() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl IdMarker for Session {
    fn prefix() -> &'static str {
        "session-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Data {}

impl IdMarker for Data {
    fn prefix() -> &'static str {
        "data-"
    }
}

/// Identifier of a task record.
pub type TaskId = Id<Task>;

/// Identifier of a session.
pub type SessionId = Id<Session>;

/// Identifier of one delivery of a queue message.
pub type MessageId = Id<Message>;

/// Identifier of a payload or result blob in object storage.
pub type DataId = Id<Data>;

/// Identity of an agent pod, as assigned by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodId(String);

impl PodId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
