//! The synchronizer task.
//!
//! A single task owns the cache, the deduplicator, the fetcher and the push
//! transport, and is the only place any of them is mutated. Commands, fetch
//! completions and push events are multiplexed with `tokio::select!`, so
//! every mutation runs to completion before the next one starts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::dedup::{EventDeduplicator, DEFAULT_CAPACITY, DEFAULT_RETENTION};
use super::fetcher::{SnapshotCompletion, SnapshotFetcher, SnapshotPayload, SnapshotSource, SnapshotTarget};
use super::handle::{
    CacheChanged, CatalogView, ChangeReason, Command, SyncHandle, SyncNotice, SyncStatus,
};
use super::reconciler::{self, Reconciliation, RefreshPlan, Trigger};
use super::scope::ScopeStore;
use crate::api::ApiError;
use crate::cache::EntityCache;
use crate::config::Config;
use crate::models::{ChangeEvent, EntityKind, EventError};
use crate::transport::{Backoff, Connector, PushTransport, TransportEvent};

const COMPLETION_BUFFER_SIZE: usize = 32;
const CHANGE_BUFFER_SIZE: usize = 64;
const NOTICE_BUFFER_SIZE: usize = 16;

/// Tuning knobs for a synchronizer.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub dedup_retention: Duration,
    pub ledger_capacity: usize,
    pub backoff: Backoff,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            dedup_retention: DEFAULT_RETENTION,
            ledger_capacity: DEFAULT_CAPACITY,
            backoff: Backoff::default(),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dedup_retention: config.dedup_retention(),
            ledger_capacity: config.ledger_capacity,
            backoff: config.reconnect_backoff(),
        }
    }
}

/// Everything a synchronizer talks to.
pub struct SyncDeps {
    pub source: Arc<dyn SnapshotSource>,
    pub connector: Arc<dyn Connector>,
    pub scope_store: Arc<dyn ScopeStore>,
    pub settings: SyncSettings,
}

/// Start the synchronizer. It restores the persisted selection, connects the
/// push channel and issues the mount snapshots right away.
pub fn spawn(deps: SyncDeps) -> SyncHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_BUFFER_SIZE);
    let (view_tx, view_rx) = watch::channel(Arc::new(CatalogView::default()));
    let (changes_tx, _) = broadcast::channel(CHANGE_BUFFER_SIZE);
    let (notices_tx, _) = broadcast::channel(NOTICE_BUFFER_SIZE);

    let (transport, transport_rx) = PushTransport::connect(deps.connector, deps.settings.backoff);

    let engine = SyncEngine {
        cache: EntityCache::new(),
        dedup: EventDeduplicator::new(deps.settings.dedup_retention, deps.settings.ledger_capacity),
        fetcher: SnapshotFetcher::new(deps.source, completion_tx),
        transport,
        scope_store: deps.scope_store,
        agencies_failure: None,
        products_failure: None,
        signed_out: false,
        connected: false,
        view: view_tx,
        changes: changes_tx.clone(),
        notices: notices_tx.clone(),
    };
    tokio::spawn(engine.run(command_rx, completion_rx, transport_rx));

    SyncHandle {
        commands: command_tx,
        view: view_rx,
        changes: changes_tx,
        notices: notices_tx,
    }
}

/// Why the last snapshot of a collection was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchFailure {
    /// Rejected with 401. Only a successful fetch of the same collection, or
    /// logout, clears it.
    Unauthorized,
    Failed(String),
}

struct SyncEngine {
    cache: EntityCache,
    dedup: EventDeduplicator,
    fetcher: SnapshotFetcher,
    transport: PushTransport,
    scope_store: Arc<dyn ScopeStore>,
    agencies_failure: Option<FetchFailure>,
    products_failure: Option<FetchFailure>,
    /// Set by logout until the next snapshot is issued.
    signed_out: bool,
    connected: bool,
    view: watch::Sender<Arc<CatalogView>>,
    changes: broadcast::Sender<CacheChanged>,
    notices: broadcast::Sender<SyncNotice>,
}

impl SyncEngine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::Receiver<SnapshotCompletion>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
    ) {
        self.start();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                Some(event) = transport_events.recv() => self.handle_transport(event),
            }
        }

        self.transport.close();
        info!("Synchronizer stopped");
    }

    fn start(&mut self) {
        match self.scope_store.load() {
            Ok(Some(agency_id)) => {
                info!(agency = %agency_id, "Restoring selected agency");
                self.transport.join_scope(&agency_id);
                self.cache.selection.select(agency_id);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not load selected agency"),
        }
        self.run_trigger(Trigger::Mount);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectScope(agency_id) => self.switch_scope(agency_id),
            Command::Refresh(None) => self.run_trigger(Trigger::PullToRefresh),
            Command::Refresh(Some(scope)) => {
                if self.cache.selection.matches(&scope) {
                    self.run_trigger(Trigger::PullToRefresh);
                } else {
                    debug!(scope = %scope, "Refresh requested for unselected agency, ignoring");
                }
            }
            Command::Lifecycle(trigger) => self.run_trigger(trigger),
            Command::Logout => self.logout(),
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn run_trigger(&mut self, trigger: Trigger) {
        debug!(?trigger, "Lifecycle trigger");
        let plan = reconciler::plan_for_trigger(trigger, &self.cache);
        self.execute(plan);
    }

    fn execute(&mut self, plan: RefreshPlan) {
        if plan.is_empty() {
            return;
        }
        self.signed_out = false;
        if plan.agencies {
            self.fetcher.fetch_all(SnapshotTarget::Agencies);
        }
        if let Some(agency_id) = plan.products {
            self.fetcher.fetch_all(SnapshotTarget::Products { agency_id });
        }
        self.publish_view();
    }

    fn switch_scope(&mut self, agency_id: String) {
        let previous = match self.cache.selection.select(agency_id.clone()) {
            Some(previous) => previous,
            None => {
                debug!(agency = %agency_id, "Agency already selected");
                return;
            }
        };
        info!(from = ?previous, to = %agency_id, "Switching agency");

        if let Some(previous) = previous.as_deref() {
            self.transport.leave_scope(previous);
        }
        self.fetcher.invalidate(EntityKind::Product);
        self.cache.products.clear();
        self.clear_recoverable_failure(EntityKind::Product);
        self.transport.join_scope(&agency_id);
        self.persist_scope();

        self.run_trigger(Trigger::ScopeSwitch);
        self.publish(EntityKind::Product, ChangeReason::SelectionChanged);
    }

    /// Drop the selection after the selected agency disappeared. Products
    /// have already been cleared.
    fn selection_lost(&mut self, agency_id: String) {
        info!(agency = %agency_id, "Selected agency is no longer active");
        self.transport.leave_scope(&agency_id);
        self.fetcher.invalidate(EntityKind::Product);
        self.clear_recoverable_failure(EntityKind::Product);
        self.persist_scope();
        let _ = self.notices.send(SyncNotice::SelectionCleared { agency_id });
        self.publish(EntityKind::Product, ChangeReason::SelectionChanged);
    }

    fn logout(&mut self) {
        info!("Clearing catalog on logout");
        self.cache.clear();
        self.fetcher.invalidate(EntityKind::Agency);
        self.fetcher.invalidate(EntityKind::Product);
        self.dedup.clear();
        for room in self.transport.joined_scopes() {
            self.transport.leave_scope(&room);
        }
        self.agencies_failure = None;
        self.products_failure = None;
        self.signed_out = true;
        self.persist_scope();

        self.publish(EntityKind::Agency, ChangeReason::Cleared);
        let _ = self.changes.send(CacheChanged {
            kind: EntityKind::Product,
            reason: ChangeReason::Cleared,
        });
    }

    fn persist_scope(&self) {
        if let Err(e) = self.scope_store.save(self.cache.selected_agency()) {
            warn!(error = %e, "Could not persist selected agency");
        }
    }

    fn handle_completion(&mut self, completion: SnapshotCompletion) {
        let SnapshotCompletion { request, result } = completion;
        let kind = request.target.kind();

        if !self.fetcher.accept(&request) {
            debug!(seq = request.seq, %kind, "Discarding superseded snapshot");
            return;
        }
        if let SnapshotTarget::Products { agency_id } = &request.target {
            if !self.cache.selection.matches(agency_id) {
                debug!(agency = %agency_id, "Discarding snapshot for unselected agency");
                self.publish_view();
                return;
            }
        }

        match result {
            Ok(SnapshotPayload::Agencies(agencies)) => {
                debug!(count = agencies.len(), "Agency snapshot applied");
                self.cache.agencies.replace_all(agencies);
                self.cache.agencies.clear_refresh_flag();
                self.agencies_failure = None;
                self.publish(EntityKind::Agency, ChangeReason::Snapshot);

                let orphaned = self
                    .cache
                    .selected_agency()
                    .filter(|id| !self.cache.agencies.contains(id))
                    .map(str::to_string);
                if let Some(agency_id) = orphaned {
                    self.cache.products.clear();
                    self.cache.selection.clear();
                    self.selection_lost(agency_id);
                }
            }
            Ok(SnapshotPayload::Products(products)) => {
                debug!(count = products.len(), "Product snapshot applied");
                self.cache.products.replace_all(products);
                self.cache.products.clear_refresh_flag();
                self.products_failure = None;
                self.publish(EntityKind::Product, ChangeReason::Snapshot);
            }
            Err(e) => self.fetch_failed(kind, e),
        }
    }

    fn fetch_failed(&mut self, kind: EntityKind, error: ApiError) {
        if error.is_auth() {
            warn!(%kind, "Snapshot rejected, session expired");
            let already_expired = self.auth_required();
            *self.failure_slot(kind) = Some(FetchFailure::Unauthorized);
            if !already_expired {
                let _ = self.notices.send(SyncNotice::SessionExpired);
            }
        } else {
            warn!(%kind, error = %error, "Snapshot fetch failed, keeping cached data");
            let slot = self.failure_slot(kind);
            // A plain failure does not mask a pending 401.
            if *slot != Some(FetchFailure::Unauthorized) {
                *slot = Some(FetchFailure::Failed(error.to_string()));
            }
        }
        self.publish_view();
    }

    fn failure_slot(&mut self, kind: EntityKind) -> &mut Option<FetchFailure> {
        match kind {
            EntityKind::Agency => &mut self.agencies_failure,
            EntityKind::Product => &mut self.products_failure,
        }
    }

    /// Forget a stale-data error for `kind`, keeping any 401.
    fn clear_recoverable_failure(&mut self, kind: EntityKind) {
        let slot = self.failure_slot(kind);
        if matches!(slot, Some(FetchFailure::Failed(_))) {
            *slot = None;
        }
    }

    fn auth_required(&self) -> bool {
        self.agencies_failure == Some(FetchFailure::Unauthorized)
            || self.products_failure == Some(FetchFailure::Unauthorized)
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready { rooms, reconnect } => {
                self.connected = true;
                debug!(rooms = ?rooms, reconnect, "Push channel ready");
                if reconnect {
                    // Events sent while disconnected are gone for good.
                    self.run_trigger(Trigger::Reconnected);
                }
                self.publish_view();
            }
            TransportEvent::Disconnected => {
                self.connected = false;
                self.publish_view();
            }
            TransportEvent::Message { name, payload } => self.handle_message(&name, &payload),
        }
    }

    fn handle_message(&mut self, name: &str, payload: &serde_json::Value) {
        let event = match ChangeEvent::from_wire(name, payload) {
            Ok(event) => event,
            Err(EventError::UnknownEvent(name)) => {
                trace!(event = %name, "Ignoring unrelated push event");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Rejected malformed push event");
                return;
            }
        };

        if !event.applies_to_scope(self.cache.selected_agency()) {
            debug!(event = event.name(), entity = event.entity_id(), "Event for another agency");
            return;
        }
        if !self.dedup.should_process(&event) {
            trace!(event = event.name(), entity = event.entity_id(), "Duplicate event dropped");
            return;
        }

        match reconciler::apply_event(&mut self.cache, &event) {
            Reconciliation::Ignored(reason) => {
                debug!(event = event.name(), entity = event.entity_id(), ?reason, "Event ignored");
            }
            Reconciliation::Removed {
                kind,
                key,
                cleared_selection,
            } => {
                debug!(%kind, key = %key, "Entity removed");
                self.publish(kind, ChangeReason::Event);
                if let Some(agency_id) = cleared_selection {
                    self.selection_lost(agency_id);
                }
            }
            Reconciliation::Patched { kind, key } | Reconciliation::Inserted { kind, key } => {
                debug!(%kind, key = %key, "Entity updated");
                self.publish(kind, ChangeReason::Event);
            }
            Reconciliation::NeedsRefresh(kind) => {
                debug!(%kind, "Refresh flag set");
                let plan = reconciler::plan_for_flags(&self.cache);
                self.execute(plan);
            }
        }
    }

    /// Publish the new view, then notify subscribers of `kind`.
    fn publish(&mut self, kind: EntityKind, reason: ChangeReason) {
        self.publish_view();
        // No subscribers is fine.
        let _ = self.changes.send(CacheChanged { kind, reason });
    }

    fn publish_view(&self) {
        let view = CatalogView {
            agencies: self.cache.agencies.to_vec(),
            products: self.cache.products.to_vec(),
            selected_agency: self.cache.selected_agency().map(str::to_string),
            status: self.status(),
            refreshing: self.fetcher.is_in_flight(EntityKind::Agency)
                || self.fetcher.is_in_flight(EntityKind::Product),
            connected: self.connected,
            agencies_updated_at: self.cache.agencies.updated_at(),
            products_updated_at: self.cache.products.updated_at(),
        };
        self.view.send_replace(Arc::new(view));
    }

    fn status(&self) -> SyncStatus {
        if self.auth_required() {
            return SyncStatus::AuthRequired;
        }
        let stale = [&self.agencies_failure, &self.products_failure]
            .into_iter()
            .find_map(|failure| match failure {
                Some(FetchFailure::Failed(error)) => Some(error.clone()),
                _ => None,
            });
        if let Some(error) = stale {
            return SyncStatus::Stale {
                error,
                last_updated: self.cache.last_updated(),
            };
        }
        if self.signed_out {
            return SyncStatus::SignedOut;
        }
        let loading = |kind: EntityKind| self.fetcher.is_in_flight(kind) && self.cache.updated_at(kind).is_none();
        if loading(EntityKind::Agency) || loading(EntityKind::Product) {
            SyncStatus::Loading
        } else {
            SyncStatus::Fresh
        }
    }
}
