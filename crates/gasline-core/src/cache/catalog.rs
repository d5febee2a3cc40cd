use chrono::{DateTime, Utc};

use super::EntityCollection;
use crate::models::{Agency, EntityKind, Product};

/// The agency whose products are currently relevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSelection {
    agency_id: Option<String>,
}

impl ScopeSelection {
    pub fn current(&self) -> Option<&str> {
        self.agency_id.as_deref()
    }

    pub fn matches(&self, agency_id: &str) -> bool {
        self.current() == Some(agency_id)
    }

    /// Returns the previous selection if it differed.
    pub fn select(&mut self, agency_id: impl Into<String>) -> Option<Option<String>> {
        let agency_id = agency_id.into();
        if self.matches(&agency_id) {
            return None;
        }
        Some(self.agency_id.replace(agency_id))
    }

    pub fn clear(&mut self) -> Option<String> {
        self.agency_id.take()
    }
}

/// Agencies and products for the current session.
#[derive(Debug, Clone, Default)]
pub struct EntityCache {
    pub agencies: EntityCollection<Agency>,
    pub products: EntityCollection<Product>,
    pub selection: ScopeSelection,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected_agency(&self) -> Option<&str> {
        self.selection.current()
    }

    pub fn needs_refresh(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Agency => self.agencies.needs_refresh(),
            EntityKind::Product => self.products.needs_refresh(),
        }
    }

    pub fn mark_needs_refresh(&mut self, kind: EntityKind) {
        match kind {
            EntityKind::Agency => self.agencies.mark_needs_refresh(),
            EntityKind::Product => self.products.mark_needs_refresh(),
        }
    }

    pub fn clear_refresh_flag(&mut self, kind: EntityKind) {
        match kind {
            EntityKind::Agency => self.agencies.clear_refresh_flag(),
            EntityKind::Product => self.products.clear_refresh_flag(),
        }
    }

    pub fn updated_at(&self, kind: EntityKind) -> Option<DateTime<Utc>> {
        match kind {
            EntityKind::Agency => self.agencies.updated_at(),
            EntityKind::Product => self.products.updated_at(),
        }
    }

    /// Most recent snapshot time across both collections.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.agencies.updated_at().max(self.products.updated_at())
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Agency => self.agencies.len(),
            EntityKind::Product => self.products.len(),
        }
    }

    /// Forget everything, including the selection. Used on logout.
    pub fn clear(&mut self) {
        self.agencies.clear();
        self.products.clear();
        self.selection.clear();
    }
}
