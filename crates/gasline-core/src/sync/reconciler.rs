//! Decision layer between push events and the cache.
//!
//! Per entity the cache is either Present or Absent:
//!
//! | Current | Event    | Action                                   |
//! |---------|----------|------------------------------------------|
//! | Absent  | inactive | nothing                                  |
//! | Absent  | active   | insert if the patch is a full record, else flag a refresh |
//! | Present | inactive | remove; clear the selection if it was selected |
//! | Present | active   | shallow-merge the patch                  |
//!
//! Lifecycle triggers bypass this table entirely and always resync.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::{EntityCache, EntityCollection};
use crate::models::{ChangeEvent, Entity, EntityKind, EntityStatus, Product};

/// What applying one event did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The event was dropped without touching the cache.
    Ignored(IgnoreReason),
    /// The entity was removed. `cleared_selection` holds the agency id when
    /// the removed agency was the selected one.
    Removed {
        kind: EntityKind,
        key: String,
        cleared_selection: Option<String>,
    },
    Patched { kind: EntityKind, key: String },
    Inserted { kind: EntityKind, key: String },
    /// The cache cannot materialize the change; the collection is flagged and
    /// needs a full snapshot.
    NeedsRefresh(EntityKind),
}

impl Reconciliation {
    /// Whether the cache contents changed.
    pub fn mutated(&self) -> bool {
        matches!(
            self,
            Reconciliation::Removed { .. }
                | Reconciliation::Patched { .. }
                | Reconciliation::Inserted { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event names a scope other than the selected agency.
    OtherScope,
    /// Deactivation of an entity the cache does not hold.
    AlreadyAbsent,
}

/// Events that force a full resync regardless of incremental state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// First load after start-up or login.
    Mount,
    /// A screen showing catalog data gained focus.
    Focus,
    /// The app returned to the foreground.
    Foreground,
    /// Explicit pull-to-refresh or a retry after a failed fetch.
    PullToRefresh,
    /// The selected agency changed.
    ScopeSwitch,
    /// The push channel came back after a drop; missed events are not replayed.
    Reconnected,
}

/// Which snapshots to request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshPlan {
    pub agencies: bool,
    pub products: Option<String>,
}

impl RefreshPlan {
    pub fn is_empty(&self) -> bool {
        !self.agencies && self.products.is_none()
    }
}

/// Snapshots a lifecycle trigger requires. A scope switch only invalidates
/// products; every other trigger resyncs both collections.
pub fn plan_for_trigger(trigger: Trigger, cache: &EntityCache) -> RefreshPlan {
    RefreshPlan {
        agencies: trigger != Trigger::ScopeSwitch,
        products: cache.selected_agency().map(str::to_string),
    }
}

/// Snapshots needed to clear the refresh flags currently set.
pub fn plan_for_flags(cache: &EntityCache) -> RefreshPlan {
    RefreshPlan {
        agencies: cache.needs_refresh(EntityKind::Agency),
        products: if cache.needs_refresh(EntityKind::Product) {
            cache.selected_agency().map(str::to_string)
        } else {
            None
        },
    }
}

/// Apply one deduplicated event to the cache.
pub fn apply_event(cache: &mut EntityCache, event: &ChangeEvent) -> Reconciliation {
    if !event.applies_to_scope(cache.selected_agency()) {
        debug!(
            event = event.name(),
            entity = event.entity_id(),
            selected = ?cache.selected_agency(),
            "Ignoring event for another scope"
        );
        return Reconciliation::Ignored(IgnoreReason::OtherScope);
    }

    let key = event.entity_id();
    match event.kind() {
        EntityKind::Agency => {
            let outcome = apply_to(&mut cache.agencies, key, event.new_status(), event.patch(), |agencies, agency| {
                agencies.insert_sorted_by(agency, |a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
            });
            match outcome {
                Reconciliation::Removed { kind, key, .. } => {
                    let cleared_selection = if cache.selection.matches(&key) {
                        // Products belonged to the agency that just went away.
                        cache.products.clear();
                        cache.selection.clear()
                    } else {
                        None
                    };
                    Reconciliation::Removed {
                        kind,
                        key,
                        cleared_selection,
                    }
                }
                Reconciliation::NeedsRefresh(kind) => {
                    cache.agencies.mark_needs_refresh();
                    Reconciliation::NeedsRefresh(kind)
                }
                other => other,
            }
        }
        EntityKind::Product => {
            let scope = cache.selected_agency().map(str::to_string);
            let outcome = apply_to(&mut cache.products, key, event.new_status(), event.patch(), |products, mut product: Product| {
                if product.agency_id.is_none() {
                    product.agency_id = scope;
                }
                products.upsert(product);
            });
            if let Reconciliation::NeedsRefresh(_) = outcome {
                cache.products.mark_needs_refresh();
            }
            outcome
        }
    }
}

/// Table-driven transition for one collection. `insert` places entities
/// materialized from a full-record patch.
fn apply_to<T, F>(
    collection: &mut EntityCollection<T>,
    key: &str,
    status: EntityStatus,
    patch: Option<&Map<String, Value>>,
    insert: F,
) -> Reconciliation
where
    T: Entity,
    F: FnOnce(&mut EntityCollection<T>, T),
{
    let kind = T::KIND;
    let present = collection.contains(key);

    match (present, status) {
        (false, EntityStatus::Inactive) => Reconciliation::Ignored(IgnoreReason::AlreadyAbsent),
        (true, EntityStatus::Inactive) => {
            collection.remove(key);
            Reconciliation::Removed {
                kind,
                key: key.to_string(),
                cleared_selection: None,
            }
        }
        (true, EntityStatus::Active) => {
            if let Some(patch) = patch {
                if let Err(e) = collection.patch(key, patch) {
                    warn!(%kind, key, error = %e, "Patch does not fit cached entity");
                    return Reconciliation::NeedsRefresh(kind);
                }
            }
            if let Some(entity) = collection.get_mut(key) {
                entity.set_status(EntityStatus::Active);
            }
            Reconciliation::Patched {
                kind,
                key: key.to_string(),
            }
        }
        (false, EntityStatus::Active) => match materialize::<T>(key, patch) {
            Some(entity) => {
                insert(collection, entity);
                Reconciliation::Inserted {
                    kind,
                    key: key.to_string(),
                }
            }
            None => {
                debug!(%kind, key, "Activated entity not cached, full refresh required");
                Reconciliation::NeedsRefresh(kind)
            }
        },
    }
}

/// Build a whole entity from a patch that carries a complete record.
/// A status-only event, or a patch without a name, is not enough.
fn materialize<T: Entity>(key: &str, patch: Option<&Map<String, Value>>) -> Option<T> {
    let patch = patch?;
    let has_name = patch
        .get("name")
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if !has_name {
        return None;
    }
    let mut record = patch.clone();
    record.insert("id".to_string(), Value::String(key.to_string()));
    record.remove("_id");
    let mut entity: T = serde_json::from_value(Value::Object(record)).ok()?;
    entity.set_status(EntityStatus::Active);
    Some(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Agency, AGENCY_STATUS_CHANGED, PRODUCT_AVAILABILITY_CHANGED, PRODUCT_GLOBAL_STATUS_CHANGED,
    };
    use serde_json::json;

    fn event(name: &str, payload: serde_json::Value) -> ChangeEvent {
        ChangeEvent::from_wire(name, &payload).expect("decode")
    }

    fn product_event(id: &str, agency: &str, status: &str) -> ChangeEvent {
        event(
            PRODUCT_AVAILABILITY_CHANGED,
            json!({"entityId": id, "scopeId": agency, "newStatus": status}),
        )
    }

    fn agency_event(id: &str, status: &str) -> ChangeEvent {
        event(AGENCY_STATUS_CHANGED, json!({"entityId": id, "newStatus": status}))
    }

    fn cache_with_products(agency: &str, ids: &[&str]) -> EntityCache {
        let mut cache = EntityCache::new();
        cache.selection.select(agency);
        cache
            .products
            .replace_all(ids.iter().map(|id| Product::new(*id, format!("Product {}", id))));
        cache
    }

    #[test]
    fn test_present_inactive_removes() {
        let mut cache = cache_with_products("a1", &["p1"]);

        let outcome = apply_event(&mut cache, &product_event("p1", "a1", "inactive"));

        assert!(matches!(outcome, Reconciliation::Removed { .. }));
        assert!(cache.products.is_empty());
    }

    #[test]
    fn test_absent_inactive_is_noop() {
        let mut cache = cache_with_products("a1", &["p1"]);

        let outcome = apply_event(&mut cache, &product_event("p9", "a1", "inactive"));

        assert_eq!(outcome, Reconciliation::Ignored(IgnoreReason::AlreadyAbsent));
        assert_eq!(cache.products.len(), 1);
        assert!(!cache.needs_refresh(EntityKind::Product));
    }

    #[test]
    fn test_absent_active_flags_refresh() {
        let mut cache = cache_with_products("a1", &[]);

        let outcome = apply_event(&mut cache, &product_event("p7", "a1", "active"));

        assert_eq!(outcome, Reconciliation::NeedsRefresh(EntityKind::Product));
        assert!(cache.needs_refresh(EntityKind::Product));
        assert!(cache.products.is_empty());
        assert_eq!(
            plan_for_flags(&cache),
            RefreshPlan {
                agencies: false,
                products: Some("a1".to_string())
            }
        );
    }

    #[test]
    fn test_present_active_merges_patch() {
        let mut cache = cache_with_products("a1", &["p1", "p2"]);
        if let Some(p) = cache.products.get_mut("p1") {
            p.price = Some(903.0);
        }

        let outcome = apply_event(
            &mut cache,
            &event(
                PRODUCT_AVAILABILITY_CHANGED,
                json!({"entityId": "p1", "scopeId": "a1", "newStatus": "active", "patch": {"stock": 0}}),
            ),
        );

        assert!(matches!(outcome, Reconciliation::Patched { .. }));
        let p1 = cache.products.get("p1").expect("p1 cached");
        assert_eq!(p1.stock, Some(0));
        assert_eq!(p1.price, Some(903.0));
        assert_eq!(cache.products.keys().collect::<Vec<_>>(), vec!["p1", "p2"]);
    }

    #[test]
    fn test_ill_typed_patch_falls_back_to_refresh() {
        let mut cache = cache_with_products("a1", &["p1"]);

        let outcome = apply_event(
            &mut cache,
            &event(
                PRODUCT_AVAILABILITY_CHANGED,
                json!({"entityId": "p1", "scopeId": "a1", "newStatus": "active", "patch": {"price": "free"}}),
            ),
        );

        assert_eq!(outcome, Reconciliation::NeedsRefresh(EntityKind::Product));
        assert!(cache.needs_refresh(EntityKind::Product));
        assert!(cache.products.contains("p1"));
    }

    #[test]
    fn test_other_scope_never_mutates() {
        let mut cache = cache_with_products("a1", &["p1"]);

        for status in ["active", "inactive"] {
            let outcome = apply_event(&mut cache, &product_event("p1", "a2", status));
            assert_eq!(outcome, Reconciliation::Ignored(IgnoreReason::OtherScope));
        }
        assert!(cache.products.contains("p1"));
        assert!(!cache.needs_refresh(EntityKind::Product));
    }

    #[test]
    fn test_product_event_without_selection_is_ignored() {
        let mut cache = EntityCache::new();
        let outcome = apply_event(&mut cache, &product_event("p1", "a1", "active"));
        assert_eq!(outcome, Reconciliation::Ignored(IgnoreReason::OtherScope));
    }

    #[test]
    fn test_no_ghost_entities() {
        let sequences: [&[&str]; 4] = [
            &["inactive"],
            &["active", "inactive"],
            &["inactive", "active", "inactive"],
            &["active", "active", "inactive", "inactive"],
        ];
        for sequence in sequences {
            let mut cache = cache_with_products("a1", &["p1"]);
            for status in sequence {
                apply_event(&mut cache, &product_event("p1", "a1", status));
            }
            assert!(!cache.products.contains("p1"), "ghost after {:?}", sequence);
        }
    }

    #[test]
    fn test_selected_agency_deactivation_clears_selection() {
        let mut cache = cache_with_products("a1", &["p1", "p2"]);
        cache
            .agencies
            .replace_all(vec![Agency::new("a1", "Anand Gas"), Agency::new("a2", "Bharat Gas")]);

        let outcome = apply_event(&mut cache, &agency_event("a1", "inactive"));

        assert_eq!(
            outcome,
            Reconciliation::Removed {
                kind: EntityKind::Agency,
                key: "a1".to_string(),
                cleared_selection: Some("a1".to_string()),
            }
        );
        assert_eq!(cache.selected_agency(), None);
        assert!(cache.products.is_empty());
        assert!(cache.agencies.get("a1").is_none());
    }

    #[test]
    fn test_other_agency_deactivation_keeps_selection() {
        let mut cache = cache_with_products("a1", &["p1"]);
        cache
            .agencies
            .replace_all(vec![Agency::new("a1", "Anand Gas"), Agency::new("a2", "Bharat Gas")]);

        let outcome = apply_event(&mut cache, &agency_event("a2", "inactive"));

        assert!(matches!(
            outcome,
            Reconciliation::Removed {
                cleared_selection: None,
                ..
            }
        ));
        assert_eq!(cache.selected_agency(), Some("a1"));
        assert_eq!(cache.products.len(), 1);
    }

    #[test]
    fn test_reactivated_agency_with_full_record_is_inserted_alphabetically() {
        let mut cache = EntityCache::new();
        cache
            .agencies
            .replace_all(vec![Agency::new("a1", "Anand Gas"), Agency::new("a3", "Krishna Gas")]);

        let outcome = apply_event(
            &mut cache,
            &event(
                AGENCY_STATUS_CHANGED,
                json!({"entityId": "a2", "newStatus": "active", "patch": {"name": "Bharat Gas", "phone": "123"}}),
            ),
        );

        assert!(matches!(outcome, Reconciliation::Inserted { .. }));
        assert_eq!(cache.agencies.keys().collect::<Vec<_>>(), vec!["a1", "a2", "a3"]);
        assert_eq!(
            cache.agencies.get("a2").and_then(|a| a.phone.as_deref()),
            Some("123")
        );
    }

    #[test]
    fn test_status_only_agency_activation_flags_refresh() {
        let mut cache = EntityCache::new();
        let outcome = apply_event(&mut cache, &agency_event("a5", "active"));
        assert_eq!(outcome, Reconciliation::NeedsRefresh(EntityKind::Agency));
        assert!(plan_for_flags(&cache).agencies);
    }

    #[test]
    fn test_global_product_event_respects_affected_scopes() {
        let mut cache = cache_with_products("a1", &["p1"]);

        let elsewhere = event(
            PRODUCT_GLOBAL_STATUS_CHANGED,
            json!({"entityId": "p1", "affectedScopes": ["a2", "a3"], "newStatus": "inactive"}),
        );
        assert_eq!(
            apply_event(&mut cache, &elsewhere),
            Reconciliation::Ignored(IgnoreReason::OtherScope)
        );

        let here = event(
            PRODUCT_GLOBAL_STATUS_CHANGED,
            json!({"entityId": "p1", "affectedScopes": ["a1", "a2"], "newStatus": "inactive"}),
        );
        assert!(apply_event(&mut cache, &here).mutated());
        assert!(cache.products.is_empty());
    }

    #[test]
    fn test_materialized_product_is_appended_with_scope() {
        let mut cache = cache_with_products("a1", &["p1"]);

        apply_event(
            &mut cache,
            &event(
                PRODUCT_AVAILABILITY_CHANGED,
                json!({"entityId": "p2", "scopeId": "a1", "newStatus": "active",
                       "patch": {"name": "5 kg FTL", "price": 420.0}}),
            ),
        );

        assert_eq!(cache.products.keys().collect::<Vec<_>>(), vec!["p1", "p2"]);
        let p2 = cache.products.get("p2").expect("p2 cached");
        assert_eq!(p2.agency_id.as_deref(), Some("a1"));
        assert_eq!(p2.price, Some(420.0));
    }

    #[test]
    fn test_trigger_plans() {
        let mut cache = EntityCache::new();
        assert_eq!(
            plan_for_trigger(Trigger::Focus, &cache),
            RefreshPlan {
                agencies: true,
                products: None
            }
        );

        cache.selection.select("a1");
        assert_eq!(
            plan_for_trigger(Trigger::Foreground, &cache),
            RefreshPlan {
                agencies: true,
                products: Some("a1".to_string())
            }
        );
        assert_eq!(
            plan_for_trigger(Trigger::ScopeSwitch, &cache),
            RefreshPlan {
                agencies: false,
                products: Some("a1".to_string())
            }
        );
        assert!(plan_for_flags(&cache).is_empty());
    }
}
