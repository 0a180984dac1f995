//! Shard backend seam
//!
//! A log shard is a single named object whose physical format is either an
//! ordered-map log (entries in the object's omap) or a FIFO (a part chain
//! rooted at the shard object). The two traits here are what the prober,
//! the remover, and the generation registry consume; [`memory`] carries
//! in-process implementations layered on the memory object store.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backing type of a log generation. Immutable once a generation is
/// created; migrating to the other type means appending a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Omap,
    Fifo,
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogType::Omap => write!(f, "omap"),
            LogType::Fifo => write!(f, "fifo"),
        }
    }
}

/// Header maintained by the ordered-map log backend. A default header on
/// an existing object means no entry was ever written to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapLogHeader {
    pub max_marker: String,
    pub max_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmapLogEntry {
    pub marker: String,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OmapListing {
    pub entries: Vec<OmapLogEntry>,
    pub next_marker: Option<String>,
    pub truncated: bool,
}

/// Ordered-map log driver for one shard object.
#[async_trait]
pub trait OmapLog: Send + Sync {
    /// Read the log header. `NotFound` when the shard object is absent.
    async fn info(&self, oid: &str) -> Result<OmapLogHeader>;

    /// List up to `max` entries after `marker` (from the start when
    /// `None`).
    async fn list(&self, oid: &str, max: usize, marker: Option<String>) -> Result<OmapListing>;
}

/// FIFO head metadata: where the part chain starts and ends, and the
/// per-part overheads writers need for sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FifoInfo {
    pub id: String,
    pub head_part_num: i64,
    pub tail_part_num: i64,
    pub part_header_size: u32,
    pub part_entry_overhead: u32,
}

impl FifoInfo {
    pub fn new(id: impl Into<String>, part_header_size: u32, part_entry_overhead: u32) -> Self {
        Self {
            id: id.into(),
            head_part_num: -1,
            tail_part_num: 0,
            part_header_size,
            part_entry_overhead,
        }
    }

    /// Object name of part `n` in this FIFO's chain.
    pub fn part_oid(&self, n: i64) -> String {
        format!("{}.{}", self.id, n)
    }
}

#[derive(Debug, Clone)]
pub struct FifoListing {
    pub entries: Vec<Bytes>,
    pub more: bool,
}

/// Partitioned FIFO driver for one shard object.
#[async_trait]
pub trait Fifo: Send + Sync {
    /// Create a FIFO rooted at `oid`. `Exists` when one is already there.
    async fn create(&self, oid: &str) -> Result<()>;

    /// Open an existing FIFO. `NotFound` when the object is absent,
    /// `NoData` when the object exists without FIFO metadata.
    async fn open(&self, oid: &str) -> Result<FifoInfo>;

    /// List up to `max` entries from the tail of the chain.
    async fn list(&self, oid: &str, max: usize) -> Result<FifoListing>;

    /// Read the FIFO head metadata without opening a handle.
    async fn get_meta(&self, oid: &str) -> Result<FifoInfo>;
}
