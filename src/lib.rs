use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

pub mod api;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod storage;

pub use crate::config::Settings;
pub use crate::error::{Error, Result};

use crate::api::http::WriteRequest;
use crate::clock::LogicalClock;
use crate::storage::{SnapshotFile, StationRecord, StationStore};

/// Shared server state. Every store mutation, and the snapshot that follows
/// it, happens while holding `store`.
pub struct AppState {
    pub settings: Settings,
    pub clock: Arc<LogicalClock>,
    store: Mutex<StationStore>,
    snapshots: SnapshotFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub created: bool,
    pub stamp: u64,
    pub evicted: Option<String>,
}

impl AppState {
    /// Build the state and restore the last snapshot, if any. Restored
    /// records are not checked against the TTL here; the next sweep does it.
    pub async fn open(settings: Settings) -> Result<Self> {
        let clock = Arc::new(LogicalClock::new());
        let snapshots = SnapshotFile::new(settings.persistence.path.clone());
        let mut store = StationStore::new(clock.clone(), settings.store.max_entries);

        let records = snapshots.load().await?;
        let found = records.len();
        for record in records {
            clock.restore(record.logical_stamp);
            store.insert(record);
            if let Some(evicted) = store.enforce_capacity() {
                tracing::warn!(station = %evicted, "snapshot exceeds capacity, dropping");
            }
        }
        tracing::info!(
            path = %snapshots.path().display(),
            found,
            restored = store.len(),
            clock = clock.read(),
            "loaded snapshot"
        );

        Ok(Self {
            settings,
            clock,
            store: Mutex::new(store),
            snapshots,
        })
    }

    /// Apply one write: observe the writer's clock, stamp and upsert, enforce
    /// capacity, then persist. The change is staged on a copy and only becomes
    /// visible once the snapshot is on disk; if saving fails nothing changes.
    pub async fn write(&self, req: WriteRequest) -> Result<WriteOutcome> {
        let mut store = self.store.lock().await;
        if let Some(remote) = req.remote_stamp {
            self.clock.observe(remote);
        }

        let mut staged = store.clone();
        let upsert = staged.upsert(&req.id, req.payload);
        let evicted = staged.enforce_capacity();
        self.snapshots.save(&staged).await?;
        *store = staged;

        if let Some(evicted) = &evicted {
            tracing::info!(station = %evicted, "evicted oldest station");
        }
        tracing::info!(
            station = %req.id,
            stamp = upsert.stamp,
            created = upsert.created,
            "accepted reading"
        );
        Ok(WriteOutcome {
            created: upsert.created,
            stamp: upsert.stamp,
            evicted,
        })
    }

    pub async fn read(&self, id: &str) -> Option<Arc<StationRecord>> {
        self.store.lock().await.read(id)
    }

    pub async fn read_all(&self) -> Vec<(String, Arc<StationRecord>)> {
        self.store.lock().await.read_all()
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    /// Expire stale stations and persist the result if anything went. A failed
    /// save is logged; the in-memory store stays authoritative.
    pub async fn sweep(&self, now: SystemTime) -> Vec<String> {
        let mut store = self.store.lock().await;
        let removed = store.prune_expired(now, self.settings.store.ttl());
        if !removed.is_empty() {
            if let Err(e) = self.snapshots.save(&store).await {
                tracing::error!(error = %e, "failed to persist snapshot after sweep");
            }
        }
        removed
    }
}

/// Periodic TTL sweep, stopped by the shutdown broadcast.
pub fn spawn_sweeper(state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    let period = state.settings.store.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let removed = state.sweep(SystemTime::now()).await;
                    if !removed.is_empty() {
                        tracing::info!(count = removed.len(), "sweep expired stations");
                    }
                }
            }
        }
    })
}

pub async fn run_server(settings: Settings) -> anyhow::Result<()> {
    let state = Arc::new(AppState::open(settings).await?);
    let listener = TcpListener::bind(state.settings.server.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "aggregation server listening");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sweeper = spawn_sweeper(state.clone(), shutdown_tx.subscribe());
    let server = tokio::spawn(api::http::serve(listener, state, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(());
    server.await??;
    sweeper.await?;
    Ok(())
}
