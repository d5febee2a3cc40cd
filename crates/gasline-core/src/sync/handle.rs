//! The outward surface of the synchronizer: commands in, views and change
//! notifications out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

use super::reconciler::Trigger;
use crate::cache::age_display;
use crate::models::{Agency, EntityKind, Product};

/// Health of the published data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing loaded yet; the first snapshot is in flight.
    #[default]
    Loading,
    Fresh,
    /// The last snapshot failed. Cached data is still shown.
    Stale {
        error: String,
        last_updated: Option<DateTime<Utc>>,
    },
    /// The session token was rejected; the auth layer has to act.
    AuthRequired,
    /// Cleared by logout. Nothing is loaded until the next trigger.
    SignedOut,
}

/// Immutable snapshot of the catalog as the UI should render it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct CatalogView {
    pub agencies: Vec<Agency>,
    pub products: Vec<Product>,
    pub selected_agency: Option<String>,
    pub status: SyncStatus,
    pub refreshing: bool,
    pub connected: bool,
    pub agencies_updated_at: Option<DateTime<Utc>>,
    pub products_updated_at: Option<DateTime<Utc>>,
}

impl CatalogView {
    pub fn agency(&self, id: &str) -> Option<&Agency> {
        self.agencies.iter().find(|a| a.id == id)
    }

    pub fn product(&self, id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn selected(&self) -> Option<&Agency> {
        self.selected_agency.as_deref().and_then(|id| self.agency(id))
    }

    /// "Last updated" text for whichever collection was refreshed last.
    pub fn last_updated_display(&self) -> String {
        age_display(self.agencies_updated_at.max(self.products_updated_at))
    }
}

/// Why a collection changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Snapshot,
    Event,
    SelectionChanged,
    Cleared,
    /// The subscriber fell behind and missed notifications.
    Lagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheChanged {
    pub kind: EntityKind,
    pub reason: ChangeReason,
}

/// Out-of-band signals for collaborators outside the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// A snapshot came back 401. The auth layer should log out.
    SessionExpired,
    /// The selected agency went away and the selection was dropped.
    SelectionCleared { agency_id: String },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Synchronizer has shut down")]
pub struct EngineStopped;

#[derive(Debug)]
pub(crate) enum Command {
    SelectScope(String),
    Refresh(Option<String>),
    Lifecycle(Trigger),
    Logout,
    Shutdown,
}

/// Change notifications for one collection. Dropping it unsubscribes.
pub struct Subscription {
    kind: EntityKind,
    rx: broadcast::Receiver<CacheChanged>,
    engine: EngineAlive,
}

impl Subscription {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Wait for the next change to this collection. `None` once the
    /// synchronizer is gone.
    pub async fn changed(&mut self) -> Option<CacheChanged> {
        loop {
            let received = tokio::select! {
                biased;
                received = self.rx.recv() => received,
                _ = self.engine.stopped() => return None,
            };
            match received {
                Ok(change) if change.kind == self.kind => return Some(change),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => {
                    return Some(CacheChanged {
                        kind: self.kind,
                        reason: ChangeReason::Lagged,
                    })
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Stream of [`SyncNotice`]s. Ends when the synchronizer stops.
pub struct Notices {
    rx: broadcast::Receiver<SyncNotice>,
    engine: EngineAlive,
}

impl Notices {
    /// Next notice, or `None` once the synchronizer is gone. Notices missed
    /// while lagging are skipped.
    pub async fn recv(&mut self) -> Option<SyncNotice> {
        loop {
            let received = tokio::select! {
                biased;
                received = self.rx.recv() => received,
                _ = self.engine.stopped() => return None,
            };
            match received {
                Ok(notice) => return Some(notice),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Tracks whether the engine task still runs. The engine owns the only view
/// sender, so the watch channel closes exactly when the task ends.
struct EngineAlive(watch::Receiver<Arc<CatalogView>>);

impl EngineAlive {
    async fn stopped(&mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

/// Cloneable handle to a running synchronizer.
#[derive(Clone)]
pub struct SyncHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) view: watch::Receiver<Arc<CatalogView>>,
    pub(crate) changes: broadcast::Sender<CacheChanged>,
    pub(crate) notices: broadcast::Sender<SyncNotice>,
}

impl SyncHandle {
    /// Switch the selected agency. Products are cleared and refetched.
    pub fn select_scope(&self, agency_id: impl Into<String>) -> Result<(), EngineStopped> {
        self.send(Command::SelectScope(agency_id.into()))
    }

    /// Force a resync. `Some(scope)` only acts when it is the selected agency.
    pub fn refresh(&self, scope: Option<&str>) -> Result<(), EngineStopped> {
        self.send(Command::Refresh(scope.map(str::to_string)))
    }

    pub fn lifecycle(&self, trigger: Trigger) -> Result<(), EngineStopped> {
        self.send(Command::Lifecycle(trigger))
    }

    /// Drop all cached data, the selection and every room.
    pub fn logout(&self) -> Result<(), EngineStopped> {
        self.send(Command::Logout)
    }

    pub fn shutdown(&self) -> Result<(), EngineStopped> {
        self.send(Command::Shutdown)
    }

    /// The latest published view.
    pub fn view(&self) -> Arc<CatalogView> {
        Arc::clone(&self.view.borrow())
    }

    pub fn watch_view(&self) -> watch::Receiver<Arc<CatalogView>> {
        self.view.clone()
    }

    pub fn on_cache_changed(&self, kind: EntityKind) -> Subscription {
        Subscription {
            kind,
            rx: self.changes.subscribe(),
            engine: EngineAlive(self.view.clone()),
        }
    }

    pub fn notices(&self) -> Notices {
        Notices {
            rx: self.notices.subscribe(),
            engine: EngineAlive(self.view.clone()),
        }
    }

    fn send(&self, command: Command) -> Result<(), EngineStopped> {
        self.commands.send(command).map_err(|_| EngineStopped)
    }
}
