//! Object-store adapter seam
//!
//! Provides a trait-based abstraction over a distributed object store with
//! per-object compound operations, versioned conditional writes, and a
//! watch/notify channel (RADOS-style). The in-process backend in
//! [`memory`] implements the same contract for embedding and tests.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Version stamp carried by a conditionally-written object.
///
/// `ver` increments on every successful conditional write. `tag` is chosen
/// once when the object is created and never changes afterwards; a tag
/// mismatch means a different writer lineage replaced the object outright.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjVersion {
    pub ver: u64,
    pub tag: String,
}

impl ObjVersion {
    pub fn inc(&mut self) {
        self.ver += 1;
    }

    /// Whether this version satisfies a `>=` condition against `required`.
    ///
    /// A required `ver` of 0 means nothing has been observed yet and
    /// matches anything. Otherwise the tags must agree and this counter
    /// must not be behind. The store applies this in both directions: a
    /// read checks `stored.satisfies_ge(seen)` so a client never observes
    /// a snapshot older than one it already has, and a conditional write
    /// checks `expected.satisfies_ge(stored)` so it fails once another
    /// writer has advanced the object past the caller's view.
    pub fn satisfies_ge(&self, required: &ObjVersion) -> bool {
        required.ver == 0 || (self.tag == required.tag && self.ver >= required.ver)
    }
}

/// Result of a compound versioned read.
#[derive(Debug, Clone)]
pub struct VersionedRead {
    pub data: Bytes,
    pub version: ObjVersion,
}

/// A single notification delivered to a watcher.
#[derive(Debug, Clone)]
pub struct WatchNotify {
    pub notify_id: u64,
    pub cookie: u64,
    /// Instance id of the client that sent the notify. Notifies fan out to
    /// every watcher including the sender's own; receivers compare this
    /// against their own id to skip self-notifications.
    pub notifier_id: u64,
    pub payload: Bytes,
}

/// Events delivered on a watch channel.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Notify(WatchNotify),
    /// The watch was lost; the holder must re-register to keep observing.
    Error(String),
}

/// A registered watch: its cookie plus the event channel it feeds.
pub struct WatchHandle {
    pub cookie: u64,
    pub events: mpsc::Receiver<WatchEvent>,
}

/// Async object store with compound per-object operations.
///
/// Every method that names an oid acts on exactly one object, and each
/// compound executes atomically on the server side.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stable identifier of this client instance, stamped as
    /// `notifier_id` on notifications it sends.
    fn instance_id(&self) -> u64;

    /// Compound read: version-check (`>= min`), version-read, full read.
    ///
    /// An absent object is `NotFound`; a version check failure (the stored
    /// object is older than `min`) is `Cancelled`.
    async fn read_versioned(&self, oid: &str, min: &ObjVersion) -> Result<VersionedRead>;

    /// Compound conditional write: version-check, write-full, version-inc.
    ///
    /// Fails with `Cancelled` when another writer has advanced the object
    /// past `expected`.
    async fn write_versioned(&self, oid: &str, expected: &ObjVersion, payload: Bytes)
        -> Result<()>;

    /// Compound exclusive create: create, set-version, write-full.
    ///
    /// Fails with `Exists` when the object is already there.
    async fn create_exclusive(&self, oid: &str, version: &ObjVersion, payload: Bytes)
        -> Result<()>;

    /// Remove the object. An absent object is `NotFound`.
    async fn remove_object(&self, oid: &str) -> Result<()>;

    /// Clear the object in place: omap header and keys dropped, data
    /// truncated to zero length. The object itself and its xattrs survive.
    /// Creates the object when absent.
    async fn reset_object(&self, oid: &str) -> Result<()>;

    /// Register a watch on the object.
    async fn watch(&self, oid: &str) -> Result<WatchHandle>;

    /// Unregister a previously-registered watch.
    async fn unwatch(&self, cookie: u64) -> Result<()>;

    /// Deliver `payload` to every current watcher of the object and wait
    /// up to `timeout` for their acknowledgements. Returns the reply
    /// payloads collected from the acks.
    async fn notify(&self, oid: &str, payload: Bytes, timeout: Duration) -> Result<Vec<Bytes>>;

    /// Acknowledge a notification received on a watch.
    async fn notify_ack(&self, oid: &str, notify_id: u64, cookie: u64, payload: Bytes)
        -> Result<()>;
}
