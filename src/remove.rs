//! Bulk removal of a generation's shard objects
//!
//! Removal is type-aware: a FIFO shard drags a chain of part objects
//! behind its head, and all of them go. The first error is remembered but
//! the sweep keeps going so one bad shard does not strand the rest.

use crate::error::{AmberLogError, Result};
use crate::shard::Fifo;
use crate::store::ObjectStore;

/// Delete every shard object of one generation, including FIFO part
/// chains. With `leave_zero`, shard 0 is cleared in place instead of
/// removed: locks live in its xattrs and peers rendezvous there.
pub async fn log_remove(
    store: &dyn ObjectStore,
    fifo: &dyn Fifo,
    shards: u32,
    get_oid: impl Fn(u32) -> String,
    leave_zero: bool,
) -> Result<()> {
    let mut first_error: Option<AmberLogError> = None;

    for shard in 0..shards {
        let oid = get_oid(shard);
        match fifo.get_meta(&oid).await {
            Ok(info) if info.head_part_num > -1 => {
                for part_num in info.tail_part_num..=info.head_part_num {
                    let part_oid = info.part_oid(part_num);
                    match store.remove_object(&part_oid).await {
                        Ok(()) | Err(AmberLogError::NotFound(_)) => {}
                        Err(error) => {
                            tracing::error!(
                                "failed removing fifo part: part_oid={}, error={}",
                                part_oid,
                                error
                            );
                            first_error.get_or_insert(error);
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(AmberLogError::NotFound(_)) | Err(AmberLogError::NoData(_)) => {}
            Err(error) => {
                tracing::error!("failed checking fifo metadata: oid={}, error={}", oid, error);
                first_error.get_or_insert(error);
            }
        }

        let result = if shard == 0 && leave_zero {
            store.reset_object(&oid).await
        } else {
            store.remove_object(&oid).await
        };
        match result {
            Ok(()) | Err(AmberLogError::NotFound(_)) => {}
            Err(error) => {
                tracing::error!("failed removing shard: oid={}, error={}", oid, error);
                first_error.get_or_insert(error);
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
