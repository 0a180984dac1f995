//! Shard probing and backing-type resolution
//!
//! A shard object may be omap-backed, FIFO-backed, absent, or in a state
//! that fits neither story. Probing classifies one shard; resolution folds
//! the verdicts of every shard of a log into a single backing type and
//! bootstraps the default backing when no shard exists yet.

use crate::error::{AmberLogError, Result};
use crate::shard::{Fifo, LogType, OmapLog, OmapLogHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardCheck {
    Dne,
    Omap,
    Fifo,
    Corrupt,
}

/// Classify one shard object and report whether it holds entries.
async fn probe_shard(omap: &dyn OmapLog, fifo: &dyn Fifo, oid: &str) -> (ShardCheck, bool) {
    let omap_present = match omap.info(oid).await {
        Ok(header) => header != OmapLogHeader::default(),
        Err(AmberLogError::NotFound(_)) => return (ShardCheck::Dne, false),
        Err(error) => {
            tracing::error!("error probing for omap log: oid={}, error={}", oid, error);
            return (ShardCheck::Corrupt, false);
        }
    };

    let fifo_present = match fifo.open(oid).await {
        Ok(_) => true,
        Err(AmberLogError::NotFound(_)) | Err(AmberLogError::NoData(_)) => false,
        Err(error) => {
            tracing::error!("error probing for fifo: oid={}, error={}", oid, error);
            return (ShardCheck::Corrupt, false);
        }
    };

    if fifo_present && omap_present {
        tracing::error!("fifo and omap log both present: oid={}", oid);
        return (ShardCheck::Corrupt, false);
    }
    if fifo_present {
        return match fifo.list(oid, 1).await {
            Ok(listing) => (ShardCheck::Fifo, !listing.entries.is_empty()),
            Err(error) => {
                tracing::error!("unable to list fifo entries: oid={}, error={}", oid, error);
                (ShardCheck::Corrupt, false)
            }
        };
    }
    if omap_present {
        return match omap.list(oid, 1, None).await {
            Ok(listing) => (ShardCheck::Omap, !listing.entries.is_empty()),
            Err(error) => {
                tracing::error!("unable to list omap entries: oid={}, error={}", oid, error);
                (ShardCheck::Corrupt, false)
            }
        };
    }

    // The object exists but has never seen FIFO metadata or log entries.
    // Likely just lock xattrs.
    (ShardCheck::Dne, false)
}

/// Materialize the default backing on shard 0 of a log that has no shards
/// yet. The omap log initializes itself on first write, so only a FIFO
/// default needs anything created up front.
async fn create_default_backing(fifo: &dyn Fifo, default_type: LogType, oid: &str) -> Result<LogType> {
    if default_type == LogType::Fifo {
        match fifo.create(oid).await {
            Ok(()) | Err(AmberLogError::Exists(_)) => {}
            Err(error) => {
                tracing::error!("error creating fifo: oid={}, error={}", oid, error);
                return Err(error);
            }
        }
    }
    Ok(default_type)
}

/// Resolve the backing type shared by all shards of a log.
///
/// Absent shards carry no vote. Any corrupt shard, or two shards voting
/// for different types, fails the resolution. When every shard is absent
/// the log is bootstrapped with `default_type`. Idempotent.
pub async fn log_backing_type(
    omap: &dyn OmapLog,
    fifo: &dyn Fifo,
    default_type: LogType,
    shards: u32,
    get_oid: impl Fn(u32) -> String,
) -> Result<LogType> {
    let mut agreed = ShardCheck::Dne;
    for shard in 0..shards {
        let oid = get_oid(shard);
        let (check, _nonempty) = probe_shard(omap, fifo, &oid).await;
        if check == ShardCheck::Corrupt {
            return Err(AmberLogError::Io(format!("corrupt shard object: {}", oid)));
        }
        if check == ShardCheck::Dne {
            continue;
        }
        if agreed == ShardCheck::Dne {
            agreed = check;
            continue;
        }
        if agreed != check {
            tracing::error!(
                "clashing shard types: agreed={:?}, found={:?}, oid={}",
                agreed,
                check,
                oid
            );
            return Err(AmberLogError::Io(format!(
                "shard backing types disagree: {}",
                oid
            )));
        }
    }

    match agreed {
        ShardCheck::Dne => create_default_backing(fifo, default_type, &get_oid(0)).await,
        ShardCheck::Omap => Ok(LogType::Omap),
        ShardCheck::Fifo => Ok(LogType::Fifo),
        ShardCheck::Corrupt => {
            tracing::error!("corrupt consensus should be unreachable");
            Err(AmberLogError::Io("corrupt shard consensus".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::shard_oid;
    use crate::shard::memory::{MemoryFifo, MemoryOmapLog};
    use crate::store::memory::MemoryCluster;
    use crate::store::ObjectStore;

    #[tokio::test]
    async fn test_consensus_across_mixed_presence() {
        let cluster = MemoryCluster::new();
        let store = cluster.client();
        let omap = MemoryOmapLog::new(store.clone());
        let fifo = MemoryFifo::new(store.clone());

        // Shards 0..=2 omap-backed with data, shard 3 absent.
        for shard in 0..3 {
            omap.add(&shard_oid("log", 0, shard), b"entry").await.unwrap();
        }

        let resolved = log_backing_type(&omap, &fifo, LogType::Fifo, 4, |shard| {
            shard_oid("log", 0, shard)
        })
        .await
        .unwrap();
        assert_eq!(resolved, LogType::Omap);
    }

    #[tokio::test]
    async fn test_clashing_types_fail() {
        let cluster = MemoryCluster::new();
        let store = cluster.client();
        let omap = MemoryOmapLog::new(store.clone());
        let fifo = MemoryFifo::new(store.clone());

        omap.add(&shard_oid("log", 0, 0), b"entry").await.unwrap();
        fifo.create(&shard_oid("log", 0, 1)).await.unwrap();

        let err = log_backing_type(&omap, &fifo, LogType::Fifo, 2, |shard| {
            shard_oid("log", 0, shard)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AmberLogError::Io(_)));
    }

    #[tokio::test]
    async fn test_ambiguous_shard_is_corrupt() {
        let cluster = MemoryCluster::new();
        let store = cluster.client();
        let omap = MemoryOmapLog::new(store.clone());
        let fifo = MemoryFifo::new(store.clone());

        // Omap entries first, then FIFO metadata lands on the same object.
        let oid = shard_oid("log", 0, 0);
        omap.add(&oid, b"entry").await.unwrap();
        fifo.create(&oid).await.unwrap();

        let err = log_backing_type(&omap, &fifo, LogType::Omap, 1, |shard| {
            shard_oid("log", 0, shard)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AmberLogError::Io(_)));
    }

    #[tokio::test]
    async fn test_absent_shards_bootstrap_fifo_default() {
        let cluster = MemoryCluster::new();
        let store = cluster.client();
        let omap = MemoryOmapLog::new(store.clone());
        let fifo = MemoryFifo::new(store.clone());

        let resolved = log_backing_type(&omap, &fifo, LogType::Fifo, 3, |shard| {
            shard_oid("log", 0, shard)
        })
        .await
        .unwrap();
        assert_eq!(resolved, LogType::Fifo);
        assert!(fifo.open(&shard_oid("log", 0, 0)).await.is_ok());

        // Running the resolution again lands on the freshly-created FIFO.
        let resolved = log_backing_type(&omap, &fifo, LogType::Fifo, 3, |shard| {
            shard_oid("log", 0, shard)
        })
        .await
        .unwrap();
        assert_eq!(resolved, LogType::Fifo);
    }

    #[tokio::test]
    async fn test_absent_shards_with_omap_default_create_nothing() {
        let cluster = MemoryCluster::new();
        let store = cluster.client();
        let omap = MemoryOmapLog::new(store.clone());
        let fifo = MemoryFifo::new(store.clone());

        let resolved = log_backing_type(&omap, &fifo, LogType::Omap, 2, |shard| {
            shard_oid("log", 0, shard)
        })
        .await
        .unwrap();
        assert_eq!(resolved, LogType::Omap);
        assert!(!store.object_exists(&shard_oid("log", 0, 0)).await);
    }

    #[tokio::test]
    async fn test_bare_object_counts_as_absent() {
        let cluster = MemoryCluster::new();
        let store = cluster.client();
        let omap = MemoryOmapLog::new(store.clone());
        let fifo = MemoryFifo::new(store.clone());

        // Generation-0 residue: the object survives with only xattrs.
        store.reset_object(&shard_oid("log", 0, 0)).await.unwrap();
        store
            .set_xattr(&shard_oid("log", 0, 0), "lock.sync", b"held")
            .await;

        let resolved = log_backing_type(&omap, &fifo, LogType::Omap, 1, |shard| {
            shard_oid("log", 0, shard)
        })
        .await
        .unwrap();
        assert_eq!(resolved, LogType::Omap);
    }
}
