use crate::error::{AmberLogError, Result};
use crate::shard::{
    Fifo, FifoInfo, FifoListing, OmapListing, OmapLog, OmapLogEntry, OmapLogHeader,
};
use crate::store::memory::MemoryStore;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

const PART_HEADER_SIZE: u32 = 96;
const PART_ENTRY_OVERHEAD: u32 = 32;
/// Entries per part before the chain grows a new head part.
const PART_ENTRY_LIMIT: usize = 16;

/// Ordered-map log over the memory store: entries live in the object's
/// omap keyed by a dense zero-padded marker, the header in the omap-header
/// attribute.
pub struct MemoryOmapLog {
    store: MemoryStore,
}

impl MemoryOmapLog {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    /// Append an entry, creating the shard object on first write.
    pub async fn add(&self, oid: &str, data: &[u8]) -> Result<()> {
        self.store
            .cluster()
            .with_object_mut(oid, |object| {
                let marker = format!("{:020}", object.omap.len() + 1);
                let entry = OmapLogEntry {
                    marker: marker.clone(),
                    timestamp: Utc::now(),
                    data: data.to_vec(),
                };
                let header = OmapLogHeader {
                    max_marker: marker.clone(),
                    max_time: Some(entry.timestamp),
                };
                object.omap.insert(marker, serde_json::to_vec(&entry)?);
                object.omap_header = serde_json::to_vec(&header)?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl OmapLog for MemoryOmapLog {
    async fn info(&self, oid: &str) -> Result<OmapLogHeader> {
        self.store
            .cluster()
            .with_object(oid, |object| {
                let object = object.ok_or_else(|| AmberLogError::NotFound(oid.to_string()))?;
                if object.omap_header.is_empty() {
                    return Ok(OmapLogHeader::default());
                }
                serde_json::from_slice(&object.omap_header).map_err(AmberLogError::from)
            })
            .await
    }

    async fn list(&self, oid: &str, max: usize, marker: Option<String>) -> Result<OmapListing> {
        self.store
            .cluster()
            .with_object(oid, |object| {
                let object = object.ok_or_else(|| AmberLogError::NotFound(oid.to_string()))?;
                let mut entries = Vec::new();
                let mut truncated = false;
                for (key, value) in &object.omap {
                    if let Some(after) = &marker {
                        if key <= after {
                            continue;
                        }
                    }
                    if entries.len() == max {
                        truncated = true;
                        break;
                    }
                    let entry: OmapLogEntry = serde_json::from_slice(value)?;
                    entries.push(entry);
                }
                let next_marker = entries.last().map(|e| e.marker.clone());
                Ok(OmapListing {
                    entries,
                    next_marker,
                    truncated,
                })
            })
            .await
    }
}

/// Partitioned FIFO over the memory store: head metadata as JSON in the
/// shard object's data, entries in numbered part objects.
pub struct MemoryFifo {
    store: MemoryStore,
}

impl MemoryFifo {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    /// Append an entry, growing the part chain when the head part fills.
    pub async fn push(&self, oid: &str, data: &[u8]) -> Result<()> {
        let mut info = self.get_meta(oid).await?;
        let mut part_num = info.head_part_num.max(0);

        let part_len = self.part_entries(&info.part_oid(part_num)).await?.len();
        if info.head_part_num >= 0 && part_len >= PART_ENTRY_LIMIT {
            part_num += 1;
        }

        let part_oid = info.part_oid(part_num);
        let payload = data.to_vec();
        self.store
            .cluster()
            .with_object_mut(&part_oid, |object| {
                let mut entries: Vec<Vec<u8>> = if object.data.is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_slice(&object.data)?
                };
                entries.push(payload);
                object.data = serde_json::to_vec(&entries)?;
                Ok::<_, AmberLogError>(())
            })
            .await?;

        if part_num != info.head_part_num {
            info.head_part_num = part_num;
            let encoded = serde_json::to_vec(&info)?;
            self.store
                .cluster()
                .with_object_mut(oid, |object| {
                    object.data = encoded;
                })
                .await;
        }
        Ok(())
    }

    async fn part_entries(&self, part_oid: &str) -> Result<Vec<Vec<u8>>> {
        self.store
            .cluster()
            .with_object(part_oid, |object| match object {
                None => Ok(Vec::new()),
                Some(object) if object.data.is_empty() => Ok(Vec::new()),
                Some(object) => serde_json::from_slice(&object.data).map_err(AmberLogError::from),
            })
            .await
    }

    fn decode_meta(oid: &str, data: &[u8]) -> Result<FifoInfo> {
        serde_json::from_slice(data)
            .map_err(|error| AmberLogError::Io(format!("invalid FIFO metadata: {}: {}", oid, error)))
    }
}

#[async_trait]
impl Fifo for MemoryFifo {
    async fn create(&self, oid: &str) -> Result<()> {
        let info = FifoInfo::new(oid, PART_HEADER_SIZE, PART_ENTRY_OVERHEAD);
        let encoded = serde_json::to_vec(&info)?;
        self.store
            .cluster()
            .with_object_mut(oid, |object| {
                if !object.data.is_empty() {
                    return Err(AmberLogError::Exists(oid.to_string()));
                }
                object.data = encoded;
                Ok(())
            })
            .await
    }

    async fn open(&self, oid: &str) -> Result<FifoInfo> {
        self.get_meta(oid).await
    }

    async fn list(&self, oid: &str, max: usize) -> Result<FifoListing> {
        let info = self.get_meta(oid).await?;
        if info.head_part_num < 0 {
            return Ok(FifoListing {
                entries: Vec::new(),
                more: false,
            });
        }

        let mut entries = Vec::new();
        let mut more = false;
        for part_num in info.tail_part_num..=info.head_part_num {
            for data in self.part_entries(&info.part_oid(part_num)).await? {
                if entries.len() == max {
                    more = true;
                    break;
                }
                entries.push(Bytes::from(data));
            }
            if more {
                break;
            }
        }
        Ok(FifoListing { entries, more })
    }

    async fn get_meta(&self, oid: &str) -> Result<FifoInfo> {
        self.store
            .cluster()
            .with_object(oid, |object| {
                let object = object.ok_or_else(|| AmberLogError::NotFound(oid.to_string()))?;
                if object.data.is_empty() {
                    return Err(AmberLogError::NoData(oid.to_string()));
                }
                Self::decode_meta(oid, &object.data)
            })
            .await
    }
}
