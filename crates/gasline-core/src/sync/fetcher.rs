//! Snapshot fetching with a monotonic request-sequence guard.
//!
//! Fetches run in spawned tasks and report back over a channel, so several
//! can be in flight at once. Each request gets the next sequence number for
//! its collection; only a completion carrying the latest number is applied.
//! Anything older is a response the user has already moved past.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::api::ApiError;
use crate::models::{Agency, EntityKind, Product};

/// Where full snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_agencies(&self) -> Result<Vec<Agency>, ApiError>;

    async fn fetch_products(&self, agency_id: &str) -> Result<Vec<Product>, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotTarget {
    Agencies,
    Products { agency_id: String },
}

impl SnapshotTarget {
    pub fn kind(&self) -> EntityKind {
        match self {
            SnapshotTarget::Agencies => EntityKind::Agency,
            SnapshotTarget::Products { .. } => EntityKind::Product,
        }
    }
}

/// Identity of one issued snapshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub seq: u64,
    pub target: SnapshotTarget,
}

#[derive(Debug)]
pub enum SnapshotPayload {
    Agencies(Vec<Agency>),
    Products(Vec<Product>),
}

/// A finished fetch, delivered back to the synchronizer.
#[derive(Debug)]
pub struct SnapshotCompletion {
    pub request: SnapshotRequest,
    pub result: Result<SnapshotPayload, ApiError>,
}

/// Latest issued sequence number per collection.
#[derive(Debug, Default)]
pub struct RequestSequencer {
    next: u64,
    latest_agencies: Option<u64>,
    latest_products: Option<u64>,
}

impl RequestSequencer {
    /// Issue a new number for `kind`, superseding every earlier one.
    pub fn issue(&mut self, kind: EntityKind) -> u64 {
        self.next += 1;
        let seq = self.next;
        *self.slot(kind) = Some(seq);
        seq
    }

    pub fn is_latest(&self, kind: EntityKind, seq: u64) -> bool {
        let latest = match kind {
            EntityKind::Agency => self.latest_agencies,
            EntityKind::Product => self.latest_products,
        };
        latest == Some(seq)
    }

    /// Supersede whatever is in flight for `kind` without issuing a request.
    pub fn invalidate(&mut self, kind: EntityKind) {
        self.next += 1;
        *self.slot(kind) = None;
    }

    fn slot(&mut self, kind: EntityKind) -> &mut Option<u64> {
        match kind {
            EntityKind::Agency => &mut self.latest_agencies,
            EntityKind::Product => &mut self.latest_products,
        }
    }
}

/// Issues snapshot requests and decides which completions still count.
pub struct SnapshotFetcher {
    source: Arc<dyn SnapshotSource>,
    sequencer: RequestSequencer,
    in_flight_agencies: bool,
    in_flight_products: bool,
    completions: mpsc::Sender<SnapshotCompletion>,
}

impl SnapshotFetcher {
    pub fn new(source: Arc<dyn SnapshotSource>, completions: mpsc::Sender<SnapshotCompletion>) -> Self {
        Self {
            source,
            sequencer: RequestSequencer::default(),
            in_flight_agencies: false,
            in_flight_products: false,
            completions,
        }
    }

    /// Start a fetch for `target`. The completion arrives on the channel
    /// given to [`SnapshotFetcher::new`].
    pub fn fetch_all(&mut self, target: SnapshotTarget) -> SnapshotRequest {
        let kind = target.kind();
        let request = SnapshotRequest {
            seq: self.sequencer.issue(kind),
            target,
        };
        self.set_in_flight(kind, true);
        debug!(seq = request.seq, target = ?request.target, "Snapshot fetch issued");

        let source = Arc::clone(&self.source);
        let tx = self.completions.clone();
        let issued = request.clone();
        tokio::spawn(async move {
            let result = match &issued.target {
                SnapshotTarget::Agencies => source.fetch_agencies().await.map(SnapshotPayload::Agencies),
                SnapshotTarget::Products { agency_id } => source
                    .fetch_products(agency_id)
                    .await
                    .map(SnapshotPayload::Products),
            };
            if let Err(e) = tx.send(SnapshotCompletion { request: issued, result }).await {
                error!(error = %e, "Failed to deliver snapshot - synchronizer gone");
            }
        });

        request
    }

    /// Whether `request` is still the latest for its collection. Marks the
    /// collection idle when it is.
    pub fn accept(&mut self, request: &SnapshotRequest) -> bool {
        let kind = request.target.kind();
        if !self.sequencer.is_latest(kind, request.seq) {
            return false;
        }
        self.set_in_flight(kind, false);
        true
    }

    /// Make every outstanding fetch for `kind` stale.
    pub fn invalidate(&mut self, kind: EntityKind) {
        self.sequencer.invalidate(kind);
        self.set_in_flight(kind, false);
    }

    pub fn is_in_flight(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Agency => self.in_flight_agencies,
            EntityKind::Product => self.in_flight_products,
        }
    }

    fn set_in_flight(&mut self, kind: EntityKind, value: bool) {
        match kind {
            EntityKind::Agency => self.in_flight_agencies = value,
            EntityKind::Product => self.in_flight_products = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;

    #[async_trait]
    impl SnapshotSource for FixedSource {
        async fn fetch_agencies(&self) -> Result<Vec<Agency>, ApiError> {
            Ok(vec![Agency::new("a1", "Anand Gas")])
        }

        async fn fetch_products(&self, agency_id: &str) -> Result<Vec<Product>, ApiError> {
            if agency_id == "down" {
                return Err(ApiError::ServerError("maintenance".to_string()));
            }
            let mut product = Product::new("p1", "14.2 kg");
            product.agency_id = Some(agency_id.to_string());
            Ok(vec![product])
        }
    }

    #[test]
    fn test_sequencer_latest_wins() {
        let mut seq = RequestSequencer::default();
        let a = seq.issue(EntityKind::Product);
        let b = seq.issue(EntityKind::Product);
        assert!(!seq.is_latest(EntityKind::Product, a));
        assert!(seq.is_latest(EntityKind::Product, b));
    }

    #[test]
    fn test_sequencer_collections_are_independent() {
        let mut seq = RequestSequencer::default();
        let agencies = seq.issue(EntityKind::Agency);
        let products = seq.issue(EntityKind::Product);
        assert!(seq.is_latest(EntityKind::Agency, agencies));
        assert!(seq.is_latest(EntityKind::Product, products));
        assert!(!seq.is_latest(EntityKind::Agency, products));
    }

    #[test]
    fn test_invalidate_supersedes_in_flight() {
        let mut seq = RequestSequencer::default();
        let a = seq.issue(EntityKind::Product);
        seq.invalidate(EntityKind::Product);
        assert!(!seq.is_latest(EntityKind::Product, a));
    }

    #[tokio::test]
    async fn test_fetch_all_delivers_completion() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut fetcher = SnapshotFetcher::new(Arc::new(FixedSource), tx);

        let request = fetcher.fetch_all(SnapshotTarget::Products {
            agency_id: "a1".to_string(),
        });
        assert!(fetcher.is_in_flight(EntityKind::Product));

        let done = rx.recv().await.expect("completion");
        assert_eq!(done.request, request);
        assert!(fetcher.accept(&done.request));
        assert!(!fetcher.is_in_flight(EntityKind::Product));
        match done.result {
            Ok(SnapshotPayload::Products(products)) => {
                assert_eq!(products[0].agency_id.as_deref(), Some("a1"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_superseded_completion_is_rejected() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut fetcher = SnapshotFetcher::new(Arc::new(FixedSource), tx);

        fetcher.fetch_all(SnapshotTarget::Agencies);
        let latest = fetcher.fetch_all(SnapshotTarget::Agencies);

        let mut accepted = Vec::new();
        for _ in 0..2 {
            let done = rx.recv().await.expect("completion");
            if fetcher.accept(&done.request) {
                accepted.push(done.request.seq);
            }
        }
        assert_eq!(accepted, vec![latest.seq]);
    }

    #[tokio::test]
    async fn test_errors_are_delivered_not_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut fetcher = SnapshotFetcher::new(Arc::new(FixedSource), tx);

        fetcher.fetch_all(SnapshotTarget::Products {
            agency_id: "down".to_string(),
        });
        let done = rx.recv().await.expect("completion");
        assert!(matches!(done.result, Err(ApiError::ServerError(_))));
    }
}
