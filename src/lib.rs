//! AmberLog - Generation management for sharded logs in object stores
//!
//! A coordination layer for logs that live as sharded objects in a
//! distributed object store:
//! - a versioned metadata object maps generation ids to backing types
//! - mutations are compare-and-swap writes with bounded retry
//! - watch/notify keeps every client's view current
//! - pluggable seams for the object store and the shard backends

pub mod cursor;
pub mod error;
pub mod generations;
pub mod probe;
pub mod remove;
pub mod shard;
pub mod store;

pub use cursor::{cursorgen, gencursor, shard_oid};
pub use error::{AmberLogError, Result};
pub use generations::{
    GenerationEntry, GenerationMap, Generations, GenerationsConfig, GenerationsListener,
};
pub use probe::log_backing_type;
pub use remove::log_remove;
pub use shard::memory::{MemoryFifo, MemoryOmapLog};
pub use shard::{
    Fifo, FifoInfo, FifoListing, LogType, OmapListing, OmapLog, OmapLogEntry, OmapLogHeader,
};
pub use store::memory::{MemoryCluster, MemoryStore};
pub use store::{ObjVersion, ObjectStore, VersionedRead, WatchEvent, WatchHandle, WatchNotify};
