use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use ledger_gateway::LedgerReader;
use shared::{
    domain::{BucketId, Catalog},
    error::TransientReadError,
    protocol::{Bounds, BucketView, SnapshotView},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Complete, ranked view of every catalog bucket at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionSnapshot {
    generation: u64,
    ranked: Vec<BucketView>,
    bounds: Option<Bounds>,
    stale: bool,
    captured_at: Option<DateTime<Utc>>,
    failed_reads: Vec<BucketId>,
}

impl ContributionSnapshot {
    /// All-zero snapshot published before the first refresh completes.
    fn placeholder(catalog: &Catalog) -> Self {
        let reads = catalog.buckets().iter().map(|_| Ok(U256::ZERO)).collect();
        let mut snapshot = Self::build(0, catalog, reads, None);
        snapshot.stale = true;
        snapshot
    }

    /// `reads` is in catalog order.
    fn build(
        generation: u64,
        catalog: &Catalog,
        reads: Vec<Result<U256, TransientReadError>>,
        captured_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut failed_reads = Vec::new();
        let mut ranked = catalog
            .buckets()
            .iter()
            .zip(reads)
            .map(|(bucket, read)| {
                let amount = read.unwrap_or_else(|_| {
                    failed_reads.push(bucket.id.clone());
                    U256::ZERO
                });
                BucketView {
                    id: bucket.id.clone(),
                    name: bucket.name.clone(),
                    amount,
                    rank: 0,
                }
            })
            .collect::<Vec<_>>();

        // Stable: ties keep catalog order.
        ranked.sort_by(|a, b| b.amount.cmp(&a.amount));
        for (rank, view) in ranked.iter_mut().enumerate() {
            view.rank = rank;
        }
        let bounds = Bounds::over(ranked.iter().map(|view| view.amount));

        Self {
            generation,
            ranked,
            bounds,
            stale: false,
            captured_at,
            failed_reads,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ranked(&self) -> &[BucketView] {
        &self.ranked
    }

    pub fn amount(&self, id: &BucketId) -> Option<U256> {
        self.ranked
            .iter()
            .find(|view| &view.id == id)
            .map(|view| view.amount)
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.captured_at
    }

    /// Buckets whose read failed in this refresh and are shown as zero.
    pub fn failed_reads(&self) -> &[BucketId] {
        &self.failed_reads
    }

    pub fn view(&self) -> SnapshotView {
        SnapshotView {
            buckets: self.ranked.clone(),
            bounds: self.bounds,
            stale: self.stale,
            captured_at: self.captured_at,
        }
    }
}

/// Fetches every bucket concurrently and publishes ranked snapshots.
///
/// Publication is a single swap of an `Arc`; readers hold whichever
/// snapshot they loaded and never see a partially built one. When refreshes
/// overlap, only the most recently started one may publish.
pub struct ContributionAggregator {
    catalog: Arc<Catalog>,
    reader: Arc<dyn LedgerReader>,
    published: watch::Sender<Arc<ContributionSnapshot>>,
    latest_started: AtomicU64,
}

impl ContributionAggregator {
    pub fn new(catalog: Arc<Catalog>, reader: Arc<dyn LedgerReader>) -> Self {
        let (published, _) = watch::channel(Arc::new(ContributionSnapshot::placeholder(&catalog)));
        Self {
            catalog,
            reader,
            published,
            latest_started: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn snapshot(&self) -> Arc<ContributionSnapshot> {
        Arc::clone(&self.published.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ContributionSnapshot>> {
        self.published.subscribe()
    }

    /// Flags the current snapshot as stale, e.g. while a contribution that
    /// will change it is in flight.
    pub fn mark_stale(&self) {
        self.published.send_if_modified(|current| {
            if current.stale {
                return false;
            }
            let mut stale = ContributionSnapshot::clone(current);
            stale.stale = true;
            *current = Arc::new(stale);
            true
        });
    }

    /// Reads every bucket and publishes the result. Never fails: a bucket
    /// whose read fails is reported as zero. Returns the published snapshot;
    /// a call superseded by a newer refresh returns that refresh's snapshot
    /// once it is published.
    pub async fn refresh(&self) -> Arc<ContributionSnapshot> {
        let generation = self.latest_started.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = &self.reader;

        let reads = join_all(self.catalog.buckets().iter().map(|bucket| async move {
            reader.read(&bucket.id).await.map_err(|err| {
                warn!(bucket = %bucket.id, error = %err, "aggregator: bucket read failed");
                TransientReadError::new(bucket.id.as_str(), err.to_string())
            })
        }))
        .await;

        let snapshot = Arc::new(ContributionSnapshot::build(
            generation,
            &self.catalog,
            reads,
            Some(Utc::now()),
        ));

        let published = self.published.send_if_modified(|current| {
            let is_latest = self.latest_started.load(Ordering::SeqCst) == generation;
            if !is_latest || current.generation >= generation {
                return false;
            }
            *current = Arc::clone(&snapshot);
            true
        });

        if published {
            info!(
                generation,
                buckets = snapshot.ranked.len(),
                failed_reads = snapshot.failed_reads.len(),
                "aggregator: snapshot published"
            );
            snapshot
        } else {
            debug!(generation, "aggregator: refresh superseded, waiting for the newer result");
            self.wait_for_latest().await
        }
    }

    /// Resolves once the most recently started refresh has published.
    async fn wait_for_latest(&self) -> Arc<ContributionSnapshot> {
        let mut updates = self.published.subscribe();
        let latest = updates
            .wait_for(|current| {
                current.generation >= self.latest_started.load(Ordering::SeqCst)
            })
            .await
            .map(|current| Arc::clone(&current));
        // The sender lives in `self`, so the channel cannot close here.
        latest.unwrap_or_else(|_| self.snapshot())
    }
}

#[cfg(test)]
#[path = "tests/aggregator_tests.rs"]
mod tests;
