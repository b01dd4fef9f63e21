use crate::error::{Error, Result};
use crate::pool::{JoinLimits, StageReport, WorkerPool};
use crate::registry::{ResourceRegistry, Slot};
use crate::store::{StoreClient, StoreConnector};
use std::collections::TryReserveError;
use tokio_util::sync::CancellationToken;

pub const MB_TO_BYTES: u64 = 1_048_576;
const FILL_BYTE: u8 = b'x';

/// Name of the key owned by worker `index` (zero based).
pub fn key_for(index: usize) -> String {
    format!("key_{}", index + 1)
}

/// Size in bytes of the value written by worker `index`, or `None` when it
/// does not fit in memory addressing.
pub fn value_size(initial_mb: u64, delta_mb: u64, index: usize) -> Option<usize> {
    let mb = u64::try_from(index)
        .ok()?
        .checked_mul(delta_mb)?
        .checked_add(initial_mb)?;
    usize::try_from(mb.checked_mul(MB_TO_BYTES)?).ok()
}

/// `size` filler bytes. Allocation failure is reported instead of aborting
/// the process.
pub fn build_value(size: usize) -> core::result::Result<Vec<u8>, TryReserveError> {
    let mut value = Vec::new();
    value.try_reserve_exact(size)?;
    value.resize(size, FILL_BYTE);
    Ok(value)
}

/// Builds the value on the blocking pool. Filling gigabytes on a runtime
/// thread would stall the timers that drive the join deadline.
async fn fill_value(key: &str, size: usize) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || build_value(size))
        .await
        .map_err(|e| Error::command(key, e))?
        .map_err(|e| Error::command(key, format!("cannot allocate {size} bytes: {e}")))
}

#[derive(Debug, Clone)]
pub struct PopulateParams {
    pub connection_count: usize,
    pub initial_size_mb: u64,
    pub delta_mb: u64,
    pub limits: JoinLimits,
}

/// Runs the population stage. Each worker reports the number of bytes it
/// wrote.
///
/// # Errors
///
/// Returns the first connection error hit while pre-creating connections.
/// No worker runs in that case, and connections already created are closed.
pub async fn populate<S: StoreConnector>(
    store: &S,
    params: &PopulateParams,
) -> Result<StageReport<usize>> {
    // Every worker gets its own store connection. They are all created
    // before fan-out, so a store that refuses connections fails the stage
    // before any multi-MiB value is built.
    let count = params.connection_count;
    let mut registry = ResourceRegistry::with_capacity(count);
    for _ in 0..count {
        match store.connect().await {
            Ok(client) => registry.register(client),
            Err(err) => {
                tracing::error!("Error in population stage: {err}");
                registry.release_all().await;
                return Err(err);
            }
        }
    }
    tracing::debug!("Opened {count} store connections");

    let mut pool = WorkerPool::new(count);
    for (index, slot) in registry.slots().into_iter().enumerate() {
        let key = key_for(index);
        let size = value_size(params.initial_size_mb, params.delta_mb, index);
        pool.submit(index, key.clone(), move |token| {
            set_value(slot, key, size, token)
        });
    }
    let report = pool.join(params.limits).await;

    registry.release_all().await;
    tracing::info!("All connections closed after populating data");
    Ok(report)
}

async fn set_value<C: StoreClient>(
    slot: Slot<C>,
    key: String,
    size: Option<usize>,
    token: CancellationToken,
) -> Result<usize> {
    let size = size.ok_or_else(|| Error::command(&key, "value size overflows"))?;
    let value = fill_value(&key, size).await?;

    let mut lease = slot.lease().await;
    let client = lease
        .as_mut()
        .ok_or_else(|| Error::command(&key, "connection already released"))?;

    tokio::select! {
        res = client.set(&key, value) => res?,
        () = token.cancelled() => return Err(Error::Interrupted { key: key.clone() }),
    }

    tracing::info!("Set key: {key} with size: {size} bytes");
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryStore;
    use core::time::Duration;
    use tokio::time::sleep;

    fn params(connection_count: usize, initial_size_mb: u64, delta_mb: u64) -> PopulateParams {
        PopulateParams {
            connection_count,
            initial_size_mb,
            delta_mb,
            limits: JoinLimits::default(),
        }
    }

    #[test]
    fn size_ramp() {
        for index in 0..8 {
            let expected = (3 + index as u64 * 2) * MB_TO_BYTES;
            assert_eq!(value_size(3, 2, index), Some(expected as usize));
        }
        assert_eq!(value_size(0, 0, 5), Some(0));
        assert_eq!(value_size(u64::MAX, 0, 0), None);
        assert_eq!(value_size(1, u64::MAX, 2), None);
    }

    #[test]
    fn value_length_is_exact() {
        for size in [0, 1, 4096, MB_TO_BYTES as usize + 7] {
            let value = build_value(size).unwrap();
            assert_eq!(value.len(), size);
            assert!(value.iter().all(|b| *b == b'x'));
        }
    }

    #[tokio::test]
    async fn filling_leaves_the_runtime_free() {
        // Single-threaded test runtime: the ticker only gets to run while
        // the fill is in progress if the fill happens elsewhere.
        let fill = fill_value("key_1", 256 * MB_TO_BYTES as usize);
        let ticker = async {
            for _ in 0..3 {
                sleep(Duration::from_millis(1)).await;
            }
        };
        let ticked_first = tokio::select! {
            biased;
            () = ticker => true,
            _ = fill => false,
        };
        assert!(ticked_first);

        let value = fill_value("key_2", 4096).await.unwrap();
        assert_eq!(value.len(), 4096);
    }

    #[tokio::test]
    async fn writes_the_ramp_and_closes_everything() {
        let store = MemoryStore::default();
        let report = populate(&store, &params(3, 1, 1)).await.unwrap();

        assert!(!report.timed_out);
        assert_eq!(report.succeeded(), 3);
        let sizes = store.sizes();
        assert_eq!(sizes.len(), 3);
        for (n, mb) in [(1, 1), (2, 2), (3, 3)] {
            let key = format!("key_{n}");
            assert_eq!(sizes[key.as_str()], mb * MB_TO_BYTES as usize);
            assert_eq!(
                *report.get(&key).unwrap().outcome.as_ref().unwrap(),
                mb * MB_TO_BYTES as usize
            );
        }
        assert!(store.value("key_1").unwrap().iter().all(|b| *b == b'x'));
        assert_eq!(store.opened(), 3);
        assert_eq!(store.closed(), 3);
    }

    #[tokio::test]
    async fn rejected_set_is_isolated() {
        let store = MemoryStore::default().rejecting("key_2");
        let report = populate(&store, &params(4, 0, 1)).await.unwrap();

        assert_eq!(report.succeeded(), 3);
        let failed = report.get("key_2").unwrap();
        assert_eq!(failed.index, 1);
        assert_eq!(failed.outcome.as_ref().unwrap_err().kind(), "command");
        let sizes = store.sizes();
        assert!(!sizes.contains_key("key_2"));
        assert!(sizes.contains_key("key_1"));
        assert!(sizes.contains_key("key_3"));
        assert!(sizes.contains_key("key_4"));
        assert_eq!(store.closed(), 4);
    }

    #[tokio::test]
    async fn oversized_value_is_isolated() {
        let store = MemoryStore::default();
        // Worker 0 writes an empty value, worker 1 asks for 2^59 bytes.
        let report = populate(&store, &params(2, 0, 1 << 39)).await.unwrap();

        assert!(report.get("key_1").unwrap().outcome.is_ok());
        let err = report.get("key_2").unwrap().outcome.as_ref().unwrap_err();
        assert_eq!(err.kind(), "command");
        assert_eq!(store.sizes().get("key_1"), Some(&0));
        assert_eq!(store.closed(), 2);
    }

    #[tokio::test]
    async fn connect_failure_aborts_fan_out_but_cleans_up() {
        let store = MemoryStore::default().failing_connect_after(2);
        let err = populate(&store, &params(5, 1, 1)).await.unwrap_err();

        assert_eq!(err.kind(), "connection");
        assert!(store.sizes().is_empty());
        assert_eq!(store.opened(), 2);
        assert_eq!(store.closed(), 2);
    }

    #[tokio::test]
    async fn zero_connections_is_a_no_op() {
        let store = MemoryStore::default();
        let report = populate(&store, &params(0, 1, 1)).await.unwrap();
        assert!(report.workers.is_empty());
        assert_eq!(store.opened(), 0);
    }
}
