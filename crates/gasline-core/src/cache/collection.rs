use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::models::Entity;

/// Result of writing one entity into a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Merged,
}

/// Ordered keyed collection of one entity type.
///
/// Keys are unique. Iteration follows insertion order, except for entities
/// placed with [`EntityCollection::insert_sorted_by`].
#[derive(Debug, Clone)]
pub struct EntityCollection<T> {
    order: Vec<String>,
    entries: HashMap<String, T>,
    needs_refresh: bool,
    updated_at: Option<DateTime<Utc>>,
}

impl<T> Default for EntityCollection<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
            needs_refresh: false,
            updated_at: None,
        }
    }
}

impl<T: Entity> EntityCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard everything and adopt `items` in their given order.
    ///
    /// A key repeated in `items` keeps its first position and its last value.
    pub fn replace_all(&mut self, items: impl IntoIterator<Item = T>) {
        self.order.clear();
        self.entries.clear();
        for item in items {
            let key = item.key().to_string();
            if self.entries.insert(key.clone(), item).is_none() {
                self.order.push(key);
            }
        }
        self.updated_at = Some(Utc::now());
    }

    /// Insert at the end, or shallow-merge into the existing entry in place.
    pub fn upsert(&mut self, entity: T) -> Upsert {
        let key = entity.key().to_string();
        match self.entries.get_mut(&key) {
            Some(existing) => {
                *existing = match existing.merged_with_entity(&entity) {
                    Ok(merged) => merged,
                    Err(e) => {
                        warn!(kind = %T::KIND, key = %key, error = %e, "Merge failed, replacing entry");
                        entity
                    }
                };
                Upsert::Merged
            }
            None => {
                self.order.push(key.clone());
                self.entries.insert(key, entity);
                Upsert::Inserted
            }
        }
    }

    /// Insert before the first entry that sorts after `entity`, or merge in
    /// place if the key is already present.
    pub fn insert_sorted_by<F>(&mut self, entity: T, mut compare: F) -> Upsert
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        if self.entries.contains_key(entity.key()) {
            return self.upsert(entity);
        }
        let position = self
            .order
            .iter()
            .position(|k| {
                self.entries
                    .get(k)
                    .map(|existing| compare(existing, &entity) == Ordering::Greater)
                    .unwrap_or(false)
            })
            .unwrap_or(self.order.len());
        let key = entity.key().to_string();
        self.order.insert(position, key.clone());
        self.entries.insert(key, entity);
        Upsert::Inserted
    }

    /// Apply a raw JSON patch to an existing entry.
    ///
    /// Returns `Ok(false)` if the key is absent. On a patch that does not fit
    /// the entity's shape the entry is left unchanged and the error returned.
    pub fn patch(&mut self, key: &str, patch: &Map<String, Value>) -> Result<bool, serde_json::Error> {
        let Some(existing) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        *existing = existing.merged_with(patch)?;
        Ok(true)
    }

    /// Remove an entry. Absent keys are a no-op.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }

    /// Snapshot of the entries in display order.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Drop every entry and forget the last snapshot time.
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
        self.needs_refresh = false;
        self.updated_at = None;
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    pub fn mark_needs_refresh(&mut self) {
        self.needs_refresh = true;
    }

    pub fn clear_refresh_flag(&mut self) {
        self.needs_refresh = false;
    }

    /// Time of the last successful `replace_all`.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Agency, Product};
    use serde_json::json;

    fn product(id: &str, name: &str) -> Product {
        Product::new(id, name)
    }

    fn keys<T: Entity>(collection: &EntityCollection<T>) -> Vec<&str> {
        collection.keys().collect()
    }

    #[test]
    fn test_replace_all_adopts_input_order() {
        let mut c = EntityCollection::new();
        c.upsert(product("old", "Old"));
        c.replace_all(vec![product("p2", "B"), product("p1", "A"), product("p3", "C")]);

        assert_eq!(keys(&c), vec!["p2", "p1", "p3"]);
        assert!(!c.contains("old"));
        assert!(c.updated_at().is_some());
    }

    #[test]
    fn test_replace_all_collapses_duplicate_keys() {
        let mut c = EntityCollection::new();
        c.replace_all(vec![product("p1", "First"), product("p2", "B"), product("p1", "Second")]);

        assert_eq!(keys(&c), vec!["p1", "p2"]);
        assert_eq!(c.get("p1").map(|p| p.name.as_str()), Some("Second"));
    }

    #[test]
    fn test_upsert_appends_then_merges_in_place() {
        let mut c = EntityCollection::new();
        assert_eq!(c.upsert(product("p1", "A")), Upsert::Inserted);
        assert_eq!(c.upsert(product("p2", "B")), Upsert::Inserted);

        let mut update = product("p1", "A2");
        update.stock = Some(5);
        assert_eq!(c.upsert(update), Upsert::Merged);

        assert_eq!(keys(&c), vec!["p1", "p2"]);
        let p1 = c.get("p1").expect("p1 present");
        assert_eq!(p1.name, "A2");
        assert_eq!(p1.stock, Some(5));
    }

    #[test]
    fn test_patch_absent_key_is_noop() {
        let mut c: EntityCollection<Product> = EntityCollection::new();
        let patched = c
            .patch("ghost", json!({"stock": 1}).as_object().expect("object"))
            .expect("patch");
        assert!(!patched);
        assert!(c.is_empty());
    }

    #[test]
    fn test_bad_patch_leaves_entry_untouched() {
        let mut c = EntityCollection::new();
        let mut p = product("p1", "A");
        p.stock = Some(2);
        c.upsert(p);

        let result = c.patch("p1", json!({"stock": "lots"}).as_object().expect("object"));
        assert!(result.is_err());
        assert_eq!(c.get("p1").and_then(|p| p.stock), Some(2));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut c = EntityCollection::new();
        c.upsert(product("p1", "A"));
        assert!(c.remove("nope").is_none());
        assert!(c.remove("p1").is_some());
        assert!(c.remove("p1").is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn test_insert_sorted_by_name() {
        let mut c = EntityCollection::new();
        c.replace_all(vec![
            Agency::new("a1", "Anand Gas"),
            Agency::new("a3", "Krishna Gas"),
            Agency::new("a4", "Zenith Gas"),
        ]);

        c.insert_sorted_by(Agency::new("a2", "bharat gas"), |a, b| {
            a.name.to_lowercase().cmp(&b.name.to_lowercase())
        });

        assert_eq!(keys(&c), vec!["a1", "a2", "a3", "a4"]);
    }

    #[test]
    fn test_refresh_flag_lifecycle() {
        let mut c: EntityCollection<Product> = EntityCollection::new();
        assert!(!c.needs_refresh());
        c.mark_needs_refresh();
        assert!(c.needs_refresh());
        c.clear_refresh_flag();
        assert!(!c.needs_refresh());

        c.mark_needs_refresh();
        c.clear();
        assert!(!c.needs_refresh());
        assert!(c.updated_at().is_none());
    }
}
