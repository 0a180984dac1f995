use crate::error::{AmberLogError, Result};
use crate::store::{ObjVersion, ObjectStore, VersionedRead, WatchEvent, WatchHandle, WatchNotify};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};

const WATCH_CHANNEL_CAPACITY: usize = 64;

/// One stored object: data body, omap header/keys, xattrs, version stamp.
#[derive(Debug, Default, Clone)]
pub(crate) struct ObjectRecord {
    pub(crate) data: Vec<u8>,
    pub(crate) omap_header: Vec<u8>,
    pub(crate) omap: BTreeMap<String, Vec<u8>>,
    pub(crate) xattrs: BTreeMap<String, Vec<u8>>,
    pub(crate) version: ObjVersion,
}

struct WatcherRecord {
    cookie: u64,
    oid: String,
    tx: mpsc::Sender<WatchEvent>,
}

struct PendingNotify {
    remaining: HashSet<u64>,
    replies: Vec<Bytes>,
    done: Arc<Notify>,
}

/// Shared in-process object store backing any number of client handles.
///
/// Compound operations execute atomically under the object-table lock,
/// which is what the real store guarantees per object.
pub struct MemoryCluster {
    objects: Mutex<HashMap<String, ObjectRecord>>,
    watchers: Mutex<Vec<WatcherRecord>>,
    pending: Mutex<HashMap<u64, PendingNotify>>,
    next_instance: AtomicU64,
    next_cookie: AtomicU64,
    next_notify: AtomicU64,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_instance: AtomicU64::new(1),
            next_cookie: AtomicU64::new(1),
            next_notify: AtomicU64::new(1),
        })
    }

    /// Open a client handle with its own instance id.
    pub fn client(self: &Arc<Self>) -> MemoryStore {
        MemoryStore {
            cluster: Arc::clone(self),
            instance_id: self.next_instance.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Drop a watch from the server side and tell its holder, simulating a
    /// lost session. The holder is expected to re-register.
    pub async fn break_watch(&self, cookie: u64) {
        let record = {
            let mut watchers = self.watchers.lock().await;
            match watchers.iter().position(|w| w.cookie == cookie) {
                Some(index) => watchers.swap_remove(index),
                None => return,
            }
        };
        self.forget_acker(cookie).await;
        let _ = record
            .tx
            .send(WatchEvent::Error(format!(
                "watch {} disconnected: {}",
                cookie, record.oid
            )))
            .await;
    }

    /// Release `cookie` from every pending notify so senders do not wait
    /// out the timeout on a watcher that is gone.
    async fn forget_acker(&self, cookie: u64) {
        let mut pending = self.pending.lock().await;
        for entry in pending.values_mut() {
            if entry.remaining.remove(&cookie) && entry.remaining.is_empty() {
                entry.done.notify_one();
            }
        }
    }

    pub(crate) async fn with_object<R>(
        &self,
        oid: &str,
        f: impl FnOnce(Option<&ObjectRecord>) -> R,
    ) -> R {
        let objects = self.objects.lock().await;
        f(objects.get(oid))
    }

    pub(crate) async fn with_object_mut<R>(
        &self,
        oid: &str,
        f: impl FnOnce(&mut ObjectRecord) -> R,
    ) -> R {
        let mut objects = self.objects.lock().await;
        f(objects.entry(oid.to_string()).or_default())
    }
}

/// Per-client handle onto a [`MemoryCluster`].
#[derive(Clone)]
pub struct MemoryStore {
    cluster: Arc<MemoryCluster>,
    instance_id: u64,
}

impl MemoryStore {
    pub fn cluster(&self) -> &Arc<MemoryCluster> {
        &self.cluster
    }

    /// Set an xattr on the object, creating it when absent. Lock managers
    /// store their state this way, which is why `reset_object` must keep
    /// xattrs intact.
    pub async fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) {
        self.cluster
            .with_object_mut(oid, |object| {
                object.xattrs.insert(name.to_string(), value.to_vec());
            })
            .await;
    }

    pub async fn get_xattr(&self, oid: &str, name: &str) -> Option<Vec<u8>> {
        self.cluster
            .with_object(oid, |object| {
                object.and_then(|o| o.xattrs.get(name).cloned())
            })
            .await
    }

    /// Whether the object exists at all.
    pub async fn object_exists(&self, oid: &str) -> bool {
        self.cluster.with_object(oid, |object| object.is_some()).await
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    async fn read_versioned(&self, oid: &str, min: &ObjVersion) -> Result<VersionedRead> {
        let objects = self.cluster.objects.lock().await;
        let object = objects
            .get(oid)
            .ok_or_else(|| AmberLogError::NotFound(oid.to_string()))?;
        if !object.version.satisfies_ge(min) {
            return Err(AmberLogError::Cancelled(format!(
                "stored version {}:{} is behind {}:{} for {}",
                object.version.tag, object.version.ver, min.tag, min.ver, oid
            )));
        }
        Ok(VersionedRead {
            data: Bytes::from(object.data.clone()),
            version: object.version.clone(),
        })
    }

    async fn write_versioned(
        &self,
        oid: &str,
        expected: &ObjVersion,
        payload: Bytes,
    ) -> Result<()> {
        let mut objects = self.cluster.objects.lock().await;
        let object = objects
            .get_mut(oid)
            .ok_or_else(|| AmberLogError::NotFound(oid.to_string()))?;
        if object.version.ver != 0 && !expected.satisfies_ge(&object.version) {
            return Err(AmberLogError::Cancelled(format!(
                "stored version {}:{} has advanced past {}:{} for {}",
                object.version.tag, object.version.ver, expected.tag, expected.ver, oid
            )));
        }
        object.data = payload.to_vec();
        object.version.inc();
        Ok(())
    }

    async fn create_exclusive(&self, oid: &str, version: &ObjVersion, payload: Bytes) -> Result<()> {
        let mut objects = self.cluster.objects.lock().await;
        if objects.contains_key(oid) {
            return Err(AmberLogError::Exists(oid.to_string()));
        }
        objects.insert(
            oid.to_string(),
            ObjectRecord {
                data: payload.to_vec(),
                version: version.clone(),
                ..ObjectRecord::default()
            },
        );
        Ok(())
    }

    async fn remove_object(&self, oid: &str) -> Result<()> {
        let mut objects = self.cluster.objects.lock().await;
        objects
            .remove(oid)
            .map(|_| ())
            .ok_or_else(|| AmberLogError::NotFound(oid.to_string()))
    }

    async fn reset_object(&self, oid: &str) -> Result<()> {
        let mut objects = self.cluster.objects.lock().await;
        let object = objects.entry(oid.to_string()).or_default();
        object.data.clear();
        object.omap_header.clear();
        object.omap.clear();
        Ok(())
    }

    async fn watch(&self, oid: &str) -> Result<WatchHandle> {
        let cookie = self.cluster.next_cookie.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut watchers = self.cluster.watchers.lock().await;
        watchers.push(WatcherRecord {
            cookie,
            oid: oid.to_string(),
            tx,
        });
        Ok(WatchHandle { cookie, events: rx })
    }

    async fn unwatch(&self, cookie: u64) -> Result<()> {
        let removed = {
            let mut watchers = self.cluster.watchers.lock().await;
            match watchers.iter().position(|w| w.cookie == cookie) {
                Some(index) => {
                    watchers.swap_remove(index);
                    true
                }
                None => false,
            }
        };
        if !removed {
            return Err(AmberLogError::NotFound(format!("watch cookie {}", cookie)));
        }
        self.cluster.forget_acker(cookie).await;
        Ok(())
    }

    async fn notify(&self, oid: &str, payload: Bytes, timeout: Duration) -> Result<Vec<Bytes>> {
        let targets: Vec<(u64, mpsc::Sender<WatchEvent>)> = {
            let watchers = self.cluster.watchers.lock().await;
            watchers
                .iter()
                .filter(|w| w.oid == oid)
                .map(|w| (w.cookie, w.tx.clone()))
                .collect()
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let notify_id = self.cluster.next_notify.fetch_add(1, Ordering::SeqCst);
        let done = Arc::new(Notify::new());
        {
            let mut pending = self.cluster.pending.lock().await;
            pending.insert(
                notify_id,
                PendingNotify {
                    remaining: targets.iter().map(|(cookie, _)| *cookie).collect(),
                    replies: Vec::new(),
                    done: Arc::clone(&done),
                },
            );
        }

        for (cookie, tx) in targets {
            let event = WatchEvent::Notify(WatchNotify {
                notify_id,
                cookie,
                notifier_id: self.instance_id,
                payload: payload.clone(),
            });
            if tx.send(event).await.is_err() {
                // Receiver went away; count it as acknowledged.
                let mut pending = self.cluster.pending.lock().await;
                if let Some(entry) = pending.get_mut(&notify_id) {
                    if entry.remaining.remove(&cookie) && entry.remaining.is_empty() {
                        entry.done.notify_one();
                    }
                }
            }
        }

        let wait = async {
            loop {
                {
                    let pending = self.cluster.pending.lock().await;
                    match pending.get(&notify_id) {
                        Some(entry) if !entry.remaining.is_empty() => {}
                        _ => break,
                    }
                }
                done.notified().await;
            }
        };

        let timed_out = tokio::time::timeout(timeout, wait).await.is_err();
        let entry = {
            let mut pending = self.cluster.pending.lock().await;
            pending.remove(&notify_id)
        };
        if timed_out {
            return Err(AmberLogError::Io(format!(
                "notify timed out waiting for acks: {}",
                oid
            )));
        }
        Ok(entry.map(|e| e.replies).unwrap_or_default())
    }

    async fn notify_ack(&self, _oid: &str, notify_id: u64, cookie: u64, payload: Bytes) -> Result<()> {
        let mut pending = self.cluster.pending.lock().await;
        if let Some(entry) = pending.get_mut(&notify_id) {
            if entry.remaining.remove(&cookie) {
                entry.replies.push(payload);
                if entry.remaining.is_empty() {
                    entry.done.notify_one();
                }
            }
        }
        Ok(())
    }
}
