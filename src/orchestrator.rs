use crate::error::Result;
use crate::fetch::{fetch_slowly, HeldOpen};
use crate::pool::StageReport;
use crate::populate::populate;
use crate::settings::RunConfig;
use crate::store::{StoreClient, StoreConnector};

/// What happened during a run. `flush` is `None` when flushing was skipped.
#[derive(Debug)]
pub struct RunSummary {
    pub flush: Option<Result<()>>,
    pub population: Result<StageReport<usize>>,
    pub fetch: Result<StageReport<HeldOpen>>,
}

/// Runs one invocation: optional flush, population, then slow fetch.
pub async fn run<S: StoreConnector>(config: &RunConfig, store: &S) -> RunSummary {
    // A failed flush only means stale keys may survive, so the stages still
    // run. The same goes for a stage that fails during setup.
    let flush = if config.noflush {
        None
    } else {
        let flushed = flush_all(store).await;
        match &flushed {
            Ok(()) => tracing::info!("Flushed all databases"),
            Err(err) => tracing::error!("Flush failed, continuing without it: {err}"),
        }
        Some(flushed)
    };

    tracing::info!("Starting population stage...");
    let population = populate(store, &config.populate_params()).await;
    if let Ok(report) = &population {
        tracing::info!("Population stage finished: {}", report.summary());
    }

    // Population has been joined and its connections closed by now, so the
    // fetch stage never races the writes it reads back.
    tracing::info!("Starting fetch stage...");
    let fetch = fetch_slowly(&config.fetch_params()).await;
    if let Ok(report) = &fetch {
        tracing::info!("Fetch stage finished: {}", report.summary());
    }

    RunSummary {
        flush,
        population,
        fetch,
    }
}

/// Wipes the whole store over a dedicated connection that is closed before
/// returning.
async fn flush_all<S: StoreConnector>(store: &S) -> Result<()> {
    let mut client = store.connect().await?;
    let flushed = client.flush_all().await;
    if let Err(err) = client.close().await {
        tracing::warn!("{err}");
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::populate::MB_TO_BYTES;
    use crate::resp::encode;
    use crate::settings::Settings;
    use crate::store::testing::MemoryStore;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    async fn raw_server(connections: usize) -> (u16, JoinHandle<Vec<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut streams = Vec::with_capacity(connections);
            for _ in 0..connections {
                streams.push(listener.accept().await.unwrap().0);
            }
            let mut received = Vec::with_capacity(connections);
            for mut stream in streams {
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await.unwrap();
                received.push(buf);
            }
            received.sort();
            received
        });
        (port, handle)
    }

    fn config(port: u16, connection_count: usize, noflush: bool) -> RunConfig {
        RunConfig {
            host: "127.0.0.1".into(),
            port,
            connection_count,
            initial_size_mb: 1,
            delta_mb: 1,
            stall_seconds: 0,
            noflush,
            secure: false,
            settings: Settings::default(),
        }
    }

    #[tokio::test]
    async fn end_to_end() {
        let (port, server) = raw_server(3).await;
        let store = MemoryStore::default();
        store.insert("stale", b"old");

        let summary = run(&config(port, 3, false), &store).await;

        assert_eq!(summary.flush, Some(Ok(())));
        assert_eq!(store.flushes(), 1);
        assert!(store.value("stale").is_none());

        let population = summary.population.unwrap();
        assert_eq!(population.succeeded(), 3);
        let sizes = store.sizes();
        assert_eq!(sizes["key_1"], MB_TO_BYTES as usize);
        assert_eq!(sizes["key_2"], 2 * MB_TO_BYTES as usize);
        assert_eq!(sizes["key_3"], 3 * MB_TO_BYTES as usize);
        // Flush connection plus one per worker, all released.
        assert_eq!(store.opened(), 4);
        assert_eq!(store.closed(), 4);

        let fetch = summary.fetch.unwrap();
        assert!(!fetch.timed_out);
        assert_eq!(fetch.succeeded(), 3);
        assert!(fetch
            .workers
            .iter()
            .all(|w| w.outcome.as_ref().unwrap().ticks == 0));

        let expected: Vec<_> = ["key_1", "key_2", "key_3"]
            .iter()
            .map(|key| encode(["GET", *key]).to_vec())
            .collect();
        assert_eq!(server.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn noflush_keeps_existing_data() {
        let (port, server) = raw_server(1).await;
        let store = MemoryStore::default();
        store.insert("stale", b"old");

        let summary = run(&config(port, 1, true), &store).await;

        assert!(summary.flush.is_none());
        assert_eq!(store.flushes(), 0);
        assert_eq!(store.value("stale").unwrap(), b"old");
        assert!(summary.population.is_ok());
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_flush_still_runs_both_stages() {
        let (port, server) = raw_server(2).await;
        let store = MemoryStore::default().failing_flush();

        let summary = run(&config(port, 2, false), &store).await;

        assert_eq!(summary.flush.unwrap().unwrap_err().kind(), "command");
        assert_eq!(summary.population.unwrap().succeeded(), 2);
        assert_eq!(summary.fetch.unwrap().succeeded(), 2);
        // The flush connection was released too.
        assert_eq!(store.opened(), store.closed());
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn population_setup_failure_does_not_skip_fetch() {
        let (port, server) = raw_server(2).await;
        let store = MemoryStore::default().failing_connect_after(1);

        let summary = run(&config(port, 2, true), &store).await;

        assert_eq!(summary.population.unwrap_err().kind(), "connection");
        assert_eq!(summary.fetch.unwrap().succeeded(), 2);
        assert_eq!(server.await.unwrap().len(), 2);
    }
}
