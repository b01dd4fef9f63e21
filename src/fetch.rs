//! Slow-fetch stage: request a key, then refuse to read the answer.

use crate::error::{Error, Result};
use crate::pool::{JoinLimits, StageReport, WorkerPool};
use crate::populate::key_for;
use crate::resp::{Command, RespEncoder};
use crate::transport::TransportFactory;
use core::time::Duration;
use futures::SinkExt;
use tokio::time::{sleep, Instant};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

/// Progress ticks per second of stall.
pub const TICKS_PER_SECOND: u64 = 10;

#[derive(Debug, Clone)]
pub struct FetchParams {
    pub host: String,
    pub port: u16,
    pub connection_count: usize,
    pub stall_seconds: u64,
    pub secure: bool,
    /// Length of one progress tick, nominally 1/10 s.
    pub stall_tick: Duration,
    pub limits: JoinLimits,
}

/// What a worker did with its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldOpen {
    /// Bytes of the request frame that were written and flushed.
    pub request_bytes: usize,
    /// Progress ticks emitted while stalling.
    pub ticks: u64,
    /// Time between the flushed request and the close.
    pub held_for: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Stall {
    ticks: u64,
    tick: Duration,
}

/// Runs the slow-fetch stage.
///
/// # Errors
///
/// Returns [`Error::Setup`] when the shared transport configuration cannot
/// be built. No worker is spawned in that case.
pub async fn fetch_slowly(params: &FetchParams) -> Result<StageReport<HeldOpen>> {
    let factory = TransportFactory::new(&params.host, params.port, params.secure)
        .inspect_err(|err| tracing::error!("Error creating transport: {err}"))?;
    let stall = Stall {
        ticks: params.stall_seconds.saturating_mul(TICKS_PER_SECOND),
        tick: params.stall_tick,
    };
    tracing::debug!(
        "Opening {} {} connections to {}",
        params.connection_count,
        if factory.is_secure() { "TLS" } else { "plain" },
        factory.target()
    );

    let mut pool = WorkerPool::new(params.connection_count);
    for index in 0..params.connection_count {
        let key = key_for(index);
        let factory = factory.clone();
        pool.submit(index, key.clone(), move |token| {
            hold_open(factory, key, stall, token)
        });
    }
    Ok(pool.join(params.limits).await)
}

async fn hold_open(
    factory: TransportFactory,
    key: String,
    stall: Stall,
    token: CancellationToken,
) -> Result<HeldOpen> {
    let transport = tokio::select! {
        res = factory.connect() => res?,
        () = token.cancelled() => return Err(Error::Interrupted { key }),
    };

    let mut sink = FramedWrite::new(transport, RespEncoder);
    let request = Command::new(["GET", key.as_str()]);
    let request_bytes = request.encoded_len();
    // `send` flushes the frame before resolving, so the whole request is on
    // the wire before the stall starts.
    sink.send(request)
        .await
        .map_err(|e| Error::command(&key, e))?;

    // The stall never touches the read half. Whatever the server answers
    // piles up in the socket buffers until the close below discards it. A
    // server that does not bound its output buffers for this client keeps
    // the whole value in memory for as long as we sleep.
    let opened = Instant::now();
    let mut ticks = 0;
    let interrupted = loop {
        if ticks == stall.ticks {
            break false;
        }
        tokio::select! {
            () = sleep(stall.tick) => {
                ticks += 1;
                tracing::info!("Sleeping for {key}");
            }
            () = token.cancelled() => break true,
        }
    };
    let held_for = opened.elapsed();

    if let Err(e) = sink.close().await {
        tracing::warn!("{}", Error::close(&key, e));
    }
    drop(sink);

    if interrupted {
        return Err(Error::Interrupted { key });
    }
    let held = HeldOpen {
        request_bytes,
        ticks,
        held_for,
    };
    tracing::info!(
        "Sent GET command for: {key} ({} bytes) but did not read the response for {:?} ({} ticks)",
        held.request_bytes,
        held.held_for,
        held.ticks
    );
    Ok(held)
}
