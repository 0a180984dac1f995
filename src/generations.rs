//! Generation registry
//!
//! A single versioned metadata object holds the map of log generations.
//! Any number of clients share it: every mutation is a read-modify-write
//! cycle guarded by a conditional write, and a notify on the metadata
//! object tells the other clients to re-read. Incoming notifications feed
//! a per-instance delivery task that merges the new map and surfaces the
//! observable changes through the caller's listener.

use crate::error::{AmberLogError, Result};
use crate::probe::log_backing_type;
use crate::remove::log_remove;
use crate::shard::{Fifo, LogType, OmapLog};
use crate::store::{ObjVersion, ObjectStore, WatchEvent, WatchHandle};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

const MAX_CAS_TRIES: u32 = 10;
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const VERSION_TAG_LEN: usize = 24;

/// One generation of a sharded log.
///
/// `log_type` is fixed at creation. `empty` is sticky: it only ever goes
/// from false to true, and only for generations below the head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationEntry {
    pub gen_id: u64,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub empty: bool,
}

/// The persisted map: generation id to entry, contiguous, never empty
/// once initialized.
pub type GenerationMap = BTreeMap<u64, GenerationEntry>;

fn lowest_nonempty(entries: &GenerationMap) -> Option<u64> {
    entries
        .iter()
        .find(|(_, entry)| !entry.empty)
        .map(|(gen_id, _)| *gen_id)
}

fn head_gen(entries: &GenerationMap) -> Option<u64> {
    entries.keys().next_back().copied()
}

/// Entries from the active tail upwards, the part of the map that still
/// holds (or can receive) data.
fn active_suffix(entries: &GenerationMap) -> GenerationMap {
    match lowest_nonempty(entries) {
        Some(tail) => entries
            .range(tail..)
            .map(|(gen_id, entry)| (*gen_id, entry.clone()))
            .collect(),
        None => GenerationMap::new(),
    }
}

fn random_tag(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Callbacks surfaced to the owner of a registry instance. Invoked with
/// the registry lock released; errors propagate to the operation that
/// triggered them without rolling back persisted state.
#[async_trait]
pub trait GenerationsListener: Send + Sync {
    /// Every generation at or above the active tail, delivered once after
    /// setup.
    async fn handle_init(&self, entries: GenerationMap) -> Result<()>;

    /// Generations that appeared above the previously-known head.
    async fn handle_new_gens(&self, entries: GenerationMap) -> Result<()>;

    /// The empty prefix advanced; `gen_id` is the highest generation now
    /// known to be empty.
    async fn handle_empty_to(&self, gen_id: u64) -> Result<()>;
}

/// Construction parameters for a registry instance.
#[derive(Debug, Clone)]
pub struct GenerationsConfig {
    /// Object holding the serialized generation map.
    pub meta_oid: String,
    /// Number of shards per generation.
    pub shards: u32,
    /// Backing type used when no generation exists yet.
    pub default_type: LogType,
}

type ShardOidFn = dyn Fn(u64, u32) -> String + Send + Sync;

struct GenState {
    entries: GenerationMap,
    version: ObjVersion,
}

struct WatchState {
    cookie: u64,
    task: Option<JoinHandle<()>>,
}

/// A client's view of the generation map for one log.
pub struct Generations {
    store: Arc<dyn ObjectStore>,
    omap: Arc<dyn OmapLog>,
    fifo: Arc<dyn Fifo>,
    oid: String,
    shards: u32,
    get_oid: Box<ShardOidFn>,
    listener: Arc<dyn GenerationsListener>,
    my_id: u64,
    state: Mutex<GenState>,
    watch: std::sync::Mutex<WatchState>,
}

impl Generations {
    /// Read the metadata object or create it, register the watch, and
    /// deliver the initial map to the listener.
    pub async fn setup(
        store: Arc<dyn ObjectStore>,
        omap: Arc<dyn OmapLog>,
        fifo: Arc<dyn Fifo>,
        config: GenerationsConfig,
        get_oid: impl Fn(u64, u32) -> String + Send + Sync + 'static,
        listener: Arc<dyn GenerationsListener>,
    ) -> Result<Arc<Self>> {
        let my_id = store.instance_id();
        let this = Arc::new(Self {
            store,
            omap,
            fifo,
            oid: config.meta_oid,
            shards: config.shards,
            get_oid: Box::new(get_oid),
            listener,
            my_id,
            state: Mutex::new(GenState {
                entries: GenerationMap::new(),
                version: ObjVersion::default(),
            }),
            watch: std::sync::Mutex::new(WatchState {
                cookie: 0,
                task: None,
            }),
        });
        this.init(config.default_type).await?;
        Ok(this)
    }

    async fn init(self: &Arc<Self>, default_type: LogType) -> Result<()> {
        match self.read().await {
            Ok((entries, version)) => {
                let mut state = self.state.lock().await;
                state.entries = entries;
                state.version = version;
            }
            Err(AmberLogError::NotFound(_)) => {
                // First client here: resolve the backing type across the
                // generation-0 shards and create the metadata object.
                let log_type = log_backing_type(
                    self.omap.as_ref(),
                    self.fifo.as_ref(),
                    default_type,
                    self.shards,
                    |shard| (self.get_oid)(0, shard),
                )
                .await?;

                let version = ObjVersion {
                    ver: 1,
                    tag: random_tag(VERSION_TAG_LEN),
                };
                let mut entries = GenerationMap::new();
                entries.insert(
                    0,
                    GenerationEntry {
                        gen_id: 0,
                        log_type,
                        empty: false,
                    },
                );
                let payload = Bytes::from(serde_json::to_vec(&entries)?);

                match self
                    .store
                    .create_exclusive(&self.oid, &version, payload)
                    .await
                {
                    Ok(()) => {
                        tracing::info!(
                            "created generation metadata: oid={}, type={}",
                            self.oid,
                            log_type
                        );
                        let mut state = self.state.lock().await;
                        state.entries = entries;
                        state.version = version;
                    }
                    Err(AmberLogError::Exists(_)) => {
                        // Someone raced us; take their map instead.
                        let (entries, version) = self.read().await?;
                        if entries.is_empty() {
                            return Err(AmberLogError::Io(format!(
                                "raced read returned empty generation map: {}",
                                self.oid
                            )));
                        }
                        let lowest = *entries.keys().next().expect("map checked non-empty");
                        if lowest != 0 {
                            // The winner created generation 0, advanced and
                            // reclaimed it before we got here. Clean up the
                            // residue our probe may have left.
                            log_remove(
                                self.store.as_ref(),
                                self.fifo.as_ref(),
                                self.shards,
                                |shard| (self.get_oid)(0, shard),
                                true,
                            )
                            .await?;
                        }
                        let mut state = self.state.lock().await;
                        state.entries = entries;
                        state.version = version;
                    }
                    Err(error) => {
                        tracing::error!(
                            "failed creating generation metadata: oid={}, error={}",
                            self.oid,
                            error
                        );
                        return Err(error);
                    }
                }
            }
            Err(error) => return Err(error),
        }

        if let Err(error) = self.establish_watch().await {
            tracing::error!(
                "failed to establish watch, instance may go stale: oid={}, error={}",
                self.oid,
                error
            );
        }

        let initial = {
            let state = self.state.lock().await;
            active_suffix(&state.entries)
        };
        self.listener.handle_init(initial).await
    }

    /// Snapshot of the current generation map.
    pub async fn entries(&self) -> GenerationMap {
        self.state.lock().await.entries.clone()
    }

    /// Version of the map this instance last observed.
    pub async fn version(&self) -> ObjVersion {
        self.state.lock().await.version.clone()
    }

    /// Compound read of the metadata object, guaranteed not to return a
    /// snapshot older than one this instance has already seen.
    async fn read(&self) -> Result<(GenerationMap, ObjVersion)> {
        let seen = { self.state.lock().await.version.clone() };
        let read = match self.store.read_versioned(&self.oid, &seen).await {
            Ok(read) => read,
            Err(AmberLogError::NotFound(_)) => {
                tracing::debug!("generation metadata not found: oid={}", self.oid);
                return Err(AmberLogError::NotFound(self.oid.clone()));
            }
            Err(error) => {
                tracing::error!(
                    "failed reading generation metadata: oid={}, error={}",
                    self.oid,
                    error
                );
                return Err(error);
            }
        };
        let entries: GenerationMap = serde_json::from_slice(&read.data)?;
        Ok((entries, read.version))
    }

    /// Conditional write of `entries`, entered holding the state guard.
    ///
    /// On success the in-memory map and version advance in place. On a
    /// version conflict the guard is released, the newer map is merged via
    /// `update`, and `Cancelled` tells the caller to retry against it.
    async fn write(&self, entries: GenerationMap, mut state: MutexGuard<'_, GenState>) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(&entries)?);
        match self
            .store
            .write_versioned(&self.oid, &state.version, payload)
            .await
        {
            Ok(()) => {
                state.entries = entries;
                state.version.inc();
                Ok(())
            }
            Err(AmberLogError::Cancelled(_)) => {
                drop(state);
                self.update().await?;
                Err(AmberLogError::Cancelled(self.oid.clone()))
            }
            Err(error) => {
                drop(state);
                tracing::error!(
                    "failed writing generation metadata: oid={}, error={}",
                    self.oid,
                    error
                );
                Err(error)
            }
        }
    }

    /// Re-read the metadata object and merge the result, surfacing the
    /// observable deltas through the listener.
    pub async fn update(&self) -> Result<()> {
        let (new_entries, new_version) = self.read().await?;

        let mut state = self.state.lock().await;
        if new_version == state.version {
            return Ok(());
        }

        if new_entries.is_empty() {
            tracing::error!("inconsistency: read an empty generation map: oid={}", self.oid);
            return Err(AmberLogError::Inconsistency(format!(
                "empty generation map: {}",
                self.oid
            )));
        }
        let cur_tail =
            lowest_nonempty(&state.entries).expect("generation map always has a non-empty head");
        let new_tail = match lowest_nonempty(&new_entries) {
            Some(tail) => tail,
            None => {
                tracing::error!(
                    "inconsistency: generation map has no active head: oid={}",
                    self.oid
                );
                return Err(AmberLogError::Inconsistency(format!(
                    "no active head: {}",
                    self.oid
                )));
            }
        };
        if new_tail < cur_tail {
            tracing::error!("inconsistency: active tail moved backwards: oid={}", self.oid);
            return Err(AmberLogError::Inconsistency(format!(
                "active tail regressed from {} to {}: {}",
                cur_tail, new_tail, self.oid
            )));
        }
        let cur_head =
            head_gen(&state.entries).expect("generation map always has a non-empty head");
        let new_head = head_gen(&new_entries).expect("map checked non-empty");
        if new_head < cur_head {
            tracing::error!("inconsistency: head moved backwards: oid={}", self.oid);
            return Err(AmberLogError::Inconsistency(format!(
                "head regressed from {} to {}: {}",
                cur_head, new_head, self.oid
            )));
        }

        // The largest generation that just became empty, if the tail moved
        // and its predecessor is still in the map.
        let highest_empty = if new_tail > cur_tail {
            new_entries
                .range(..new_tail)
                .next_back()
                .map(|(gen_id, _)| *gen_id)
        } else {
            None
        };
        let added: GenerationMap = new_entries
            .range(cur_head + 1..)
            .map(|(gen_id, entry)| (*gen_id, entry.clone()))
            .collect();

        state.entries = new_entries;
        state.version = new_version;
        drop(state);

        if let Some(gen_id) = highest_empty {
            self.listener.handle_empty_to(gen_id).await?;
        }
        if !added.is_empty() {
            self.listener.handle_new_gens(added).await?;
        }
        Ok(())
    }

    /// Append a generation with the given backing type. Idempotent when
    /// the head generation already has that type.
    pub async fn new_backing(&self, log_type: LogType) -> Result<()> {
        self.update().await?;
        let mut tries = 0;
        let appended = loop {
            let state = self.state.lock().await;
            let (head_id, head) = state
                .entries
                .iter()
                .next_back()
                .map(|(gen_id, entry)| (*gen_id, entry.clone()))
                .expect("generation map always has a non-empty head");
            if head.log_type == log_type {
                // Nothing to be done.
                return Ok(());
            }
            let entry = GenerationEntry {
                gen_id: head_id + 1,
                log_type,
                empty: false,
            };
            let mut next = state.entries.clone();
            next.insert(entry.gen_id, entry.clone());
            match self.write(next, state).await {
                Ok(()) => break entry,
                Err(error @ AmberLogError::Cancelled(_)) => {
                    tries += 1;
                    if tries >= MAX_CAS_TRIES {
                        tracing::error!("exhausted retry attempts: oid={}", self.oid);
                        return Err(error);
                    }
                }
                Err(error) => {
                    tracing::error!("write failed: oid={}, error={}", self.oid, error);
                    return Err(error);
                }
            }
        };

        self.notify_peers().await?;
        let mut added = GenerationMap::new();
        added.insert(appended.gen_id, appended);
        self.listener.handle_new_gens(added).await
    }

    /// Mark every generation up to and including `gen_id` empty. The head
    /// can never be emptied; a `gen_id` at or beyond it is refused.
    pub async fn empty_to(&self, gen_id: u64) -> Result<()> {
        self.update().await?;
        let mut tries = 0;
        let new_tail = loop {
            let state = self.state.lock().await;
            let head =
                head_gen(&state.entries).expect("generation map always has a non-empty head");
            if gen_id >= head {
                tracing::error!(
                    "attempt to empty at or beyond the head: gen_id={}, head={}, oid={}",
                    gen_id,
                    head,
                    self.oid
                );
                return Err(AmberLogError::InvalidArgument(format!(
                    "cannot empty generation {} at or beyond head {}",
                    gen_id, head
                )));
            }
            let mut next = state.entries.clone();
            let mut highest_marked = None;
            for (marked_id, entry) in next.range_mut(..=gen_id) {
                if !entry.empty {
                    entry.empty = true;
                    highest_marked = Some(*marked_id);
                }
            }
            let Some(highest) = highest_marked else {
                // Nothing at or below gen_id still holds data.
                return Ok(());
            };
            match self.write(next, state).await {
                Ok(()) => break highest,
                Err(error @ AmberLogError::Cancelled(_)) => {
                    tries += 1;
                    if tries >= MAX_CAS_TRIES {
                        tracing::error!("exhausted retry attempts: oid={}", self.oid);
                        return Err(error);
                    }
                }
                Err(error) => {
                    tracing::error!("write failed: oid={}, error={}", self.oid, error);
                    return Err(error);
                }
            }
        };

        self.notify_peers().await?;
        self.listener.handle_empty_to(new_tail).await
    }

    /// Reclaim every generation below the active tail: delete its shard
    /// objects and drop it from the map. Generation 0's shard 0 is cleared
    /// in place rather than removed.
    pub async fn remove_empty(&self) -> Result<()> {
        self.update().await?;
        let mut tries = 0;
        loop {
            let state = self.state.lock().await;
            debug_assert!(!state.entries.is_empty());
            let tail =
                lowest_nonempty(&state.entries).expect("generation map always has a non-empty head");
            let lowest = *state.entries.keys().next().expect("map is non-empty");
            if tail == lowest {
                // No fully-drained prefix to reclaim.
                return Ok(());
            }
            let doomed: GenerationMap = state
                .entries
                .range(..tail)
                .map(|(gen_id, entry)| (*gen_id, entry.clone()))
                .collect();
            drop(state);

            for (gen_id, entry) in &doomed {
                debug_assert!(entry.empty);
                log_remove(
                    self.store.as_ref(),
                    self.fifo.as_ref(),
                    self.shards,
                    |shard| (self.get_oid)(*gen_id, shard),
                    *gen_id == 0,
                )
                .await?;
            }

            let state = self.state.lock().await;
            let kept: GenerationMap = state
                .entries
                .range(tail..)
                .map(|(gen_id, entry)| (*gen_id, entry.clone()))
                .collect();
            match self.write(kept, state).await {
                Ok(()) => break,
                Err(error @ AmberLogError::Cancelled(_)) => {
                    // The map changed under us; re-derive what is still
                    // reclaimable from the merged view.
                    tries += 1;
                    if tries >= MAX_CAS_TRIES {
                        tracing::error!("exhausted retry attempts: oid={}", self.oid);
                        return Err(error);
                    }
                }
                Err(error) => {
                    tracing::error!("write failed: oid={}, error={}", self.oid, error);
                    return Err(error);
                }
            }
        }

        self.notify_peers().await
    }

    async fn notify_peers(&self) -> Result<()> {
        if let Err(error) = self
            .store
            .notify(&self.oid, Bytes::new(), NOTIFY_TIMEOUT)
            .await
        {
            tracing::error!("notify failed: oid={}, error={}", self.oid, error);
            return Err(error);
        }
        Ok(())
    }

    async fn establish_watch(self: &Arc<Self>) -> Result<()> {
        let WatchHandle { cookie, events } =
            self.store.watch(&self.oid).await.map_err(|error| {
                AmberLogError::Watch(format!(
                    "failed to register watch on {}: {}",
                    self.oid, error
                ))
            })?;
        let task = tokio::spawn(Self::deliver_events(Arc::downgrade(self), events));
        let mut watch = self.watch.lock().expect("watch state mutex poisoned");
        if let Some(old) = watch.task.take() {
            old.abort();
        }
        watch.cookie = cookie;
        watch.task = Some(task);
        Ok(())
    }

    /// Single consumer of watch events for this instance. Merges remote
    /// changes, acknowledges every notify, and re-registers the watch when
    /// the store reports it lost.
    async fn deliver_events(this: Weak<Self>, mut events: mpsc::Receiver<WatchEvent>) {
        while let Some(event) = events.recv().await {
            let Some(strong) = this.upgrade() else {
                return;
            };
            match event {
                WatchEvent::Notify(notify) => {
                    if notify.notifier_id != strong.my_id {
                        if let Err(error) = strong.update().await {
                            tracing::error!(
                                "update after notify failed, no one to report to and no safe way to continue: oid={}, error={}",
                                strong.oid,
                                error
                            );
                            std::process::abort();
                        }
                    }
                    let cookie = {
                        strong
                            .watch
                            .lock()
                            .expect("watch state mutex poisoned")
                            .cookie
                    };
                    if let Err(error) = strong
                        .store
                        .notify_ack(&strong.oid, notify.notify_id, cookie, Bytes::new())
                        .await
                    {
                        tracing::warn!(
                            "failed to acknowledge notify: oid={}, error={}",
                            strong.oid,
                            error
                        );
                    }
                }
                WatchEvent::Error(error) => {
                    tracing::warn!(
                        "watch lost, re-registering: oid={}, error={}",
                        strong.oid,
                        error
                    );
                    let cookie = {
                        strong
                            .watch
                            .lock()
                            .expect("watch state mutex poisoned")
                            .cookie
                    };
                    if let Err(error) = strong.store.unwatch(cookie).await {
                        tracing::warn!("failed unwatching: oid={}, error={}", strong.oid, error);
                    }
                    match strong.store.watch(&strong.oid).await {
                        Ok(handle) => {
                            {
                                let mut watch =
                                    strong.watch.lock().expect("watch state mutex poisoned");
                                watch.cookie = handle.cookie;
                            }
                            events = handle.events;
                        }
                        Err(error) => {
                            tracing::error!(
                                "failed to re-establish watch, instance may go stale: oid={}, error={}",
                                strong.oid,
                                error
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Stop watching and shut down event delivery. The metadata object is
    /// external state and needs no flushing.
    pub async fn shutdown(&self) {
        let (cookie, task) = {
            let mut watch = self.watch.lock().expect("watch state mutex poisoned");
            (std::mem::take(&mut watch.cookie), watch.task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        if cookie > 0 {
            if let Err(error) = self.store.unwatch(cookie).await {
                tracing::warn!("failed unwatching: oid={}, error={}", self.oid, error);
            }
        }
    }
}

impl Drop for Generations {
    fn drop(&mut self) {
        let mut watch = self.watch.lock().expect("watch state mutex poisoned");
        if let Some(task) = watch.task.take() {
            task.abort();
        }
    }
}
