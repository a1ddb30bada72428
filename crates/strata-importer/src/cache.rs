//! In-process read-through caches over the dimension tables.
//!
//! The cache is a convenience only. Uniqueness is owned by the store's
//! natural-key constraints, so two processes with cold caches still converge
//! on one row per key: each misses, both call get-or-create, and the store
//! hands the loser the winner's row.

use std::{
  collections::HashMap,
  fmt::Debug,
  future::Future,
  hash::Hash,
  sync::{PoisonError, RwLock},
};

use strata_core::{
  dimension::{LocationKey, NewLocation, SubjectMeta},
  store::StatStore,
};
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

// ─── Generic cache ───────────────────────────────────────────────────────────

/// Natural key → persisted id.
pub struct DimensionCache<K, V> {
  kind:    &'static str,
  entries: RwLock<HashMap<K, V>>,
}

impl<K, V> DimensionCache<K, V>
where
  K: Eq + Hash + Clone + Debug,
  V: Clone,
{
  pub fn new(kind: &'static str) -> Self { Self { kind, entries: RwLock::new(HashMap::new()) } }

  pub fn get(&self, key: &K) -> Option<V> {
    let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
    entries.get(key).cloned()
  }

  /// Return the cached value, or run `create` (a store get-or-insert) and
  /// remember what it returns. The lock is not held across `create`.
  pub async fn get_or_create_and_cache<F, Fut, E>(&self, key: K, create: F) -> Result<V, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
  {
    if let Some(hit) = self.get(&key) {
      debug!(kind = self.kind, ?key, "dimension cache hit");
      return Ok(hit);
    }
    let value = create().await?;
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    Ok(entries.entry(key).or_insert(value).clone())
  }

  /// Seed the cache; returns how many entries were added. Keys already
  /// present keep their value.
  pub fn warm(&self, pairs: impl IntoIterator<Item = (K, V)>) -> usize {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    let before = entries.len();
    for (key, value) in pairs {
      entries.entry(key).or_insert(value);
    }
    entries.len() - before
  }

  pub fn len(&self) -> usize { self.entries.read().unwrap_or_else(PoisonError::into_inner).len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

// ─── Typed caches ────────────────────────────────────────────────────────────

/// One cache per dimension table, keyed the way the store's unique
/// constraints are.
pub struct Dimensions {
  pub locations:     DimensionCache<LocationKey, Uuid>,
  /// `(subject_id, filter name)`
  pub filters:       DimensionCache<(Uuid, String), Uuid>,
  /// `(filter_id, group label)`
  pub filter_groups: DimensionCache<(Uuid, String), Uuid>,
  /// `(filter_group_id, item label)`
  pub filter_items:  DimensionCache<(Uuid, String), Uuid>,
  /// `(subject_id, indicator name)`
  pub indicators:    DimensionCache<(Uuid, String), Uuid>,
}

impl Default for Dimensions {
  fn default() -> Self {
    Self {
      locations:     DimensionCache::new("location"),
      filters:       DimensionCache::new("filter"),
      filter_groups: DimensionCache::new("filter_group"),
      filter_items:  DimensionCache::new("filter_item"),
      indicators:    DimensionCache::new("indicator"),
    }
  }
}

impl Dimensions {
  /// Pre-load every location. Subject-scoped tables are warmed per subject
  /// by [`Dimensions::warm_subject`].
  pub async fn warm<S: StatStore>(&self, store: &S) -> Result<usize> {
    let locations = store.list_locations().await.map_err(Error::store)?;
    Ok(
      self
        .locations
        .warm(locations.into_iter().map(|l| ((l.level, l.code), l.location_id))),
    )
  }

  pub fn warm_subject(&self, meta: &SubjectMeta) -> usize {
    let subject_id = meta.subject.subject_id;
    let mut added = self.filters.warm(
      meta
        .filters
        .iter()
        .map(|f| ((subject_id, f.filter.name.clone()), f.filter.filter_id)),
    );
    for f in &meta.filters {
      added += self.filter_groups.warm(
        f.groups
          .iter()
          .map(|g| ((f.filter.filter_id, g.group.label.clone()), g.group.filter_group_id)),
      );
      added += self.filter_items.warm(f.groups.iter().flat_map(|g| {
        g.items
          .iter()
          .map(|i| ((g.group.filter_group_id, i.label.clone()), i.filter_item_id))
      }));
    }
    added += self.indicators.warm(
      meta
        .indicators
        .iter()
        .map(|i| ((subject_id, i.name.clone()), i.indicator_id)),
    );
    added
  }

  pub async fn location<S: StatStore>(&self, store: &S, location: NewLocation) -> Result<Uuid> {
    self
      .locations
      .get_or_create_and_cache(location.key(), || async move {
        store
          .get_or_create_location(location)
          .await
          .map(|l| l.location_id)
          .map_err(Error::store)
      })
      .await
  }

  pub async fn filter_group<S: StatStore>(&self, store: &S, filter_id: Uuid, label: &str) -> Result<Uuid> {
    self
      .filter_groups
      .get_or_create_and_cache((filter_id, label.to_owned()), || async move {
        store
          .get_or_create_filter_group(filter_id, label.to_owned())
          .await
          .map(|g| g.filter_group_id)
          .map_err(Error::store)
      })
      .await
  }

  pub async fn filter_item<S: StatStore>(&self, store: &S, group_id: Uuid, label: &str) -> Result<Uuid> {
    self
      .filter_items
      .get_or_create_and_cache((group_id, label.to_owned()), || async move {
        store
          .get_or_create_filter_item(group_id, label.to_owned())
          .await
          .map(|i| i.filter_item_id)
          .map_err(Error::store)
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  #[tokio::test]
  async fn create_runs_once_per_key() {
    let cache: DimensionCache<String, u32> = DimensionCache::new("test");
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
      let v = cache
        .get_or_create_and_cache("E92000001".to_owned(), || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok::<_, std::convert::Infallible>(7)
        })
        .await
        .unwrap();
      assert_eq!(v, 7);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&"E92000001".to_owned()), Some(7));
  }

  #[tokio::test]
  async fn failed_create_is_not_cached() {
    let cache: DimensionCache<u8, u8> = DimensionCache::new("test");
    let err = cache
      .get_or_create_and_cache(1, || async { Err::<u8, _>("conflict") })
      .await;
    assert_eq!(err, Err("conflict"));
    assert!(cache.get(&1).is_none());
  }

  #[tokio::test]
  async fn warm_keeps_existing_entries() {
    let cache: DimensionCache<u8, u8> = DimensionCache::new("test");
    cache.warm([(1, 10)]);
    let v = cache
      .get_or_create_and_cache(2, || async { Ok::<_, ()>(20) })
      .await
      .unwrap();
    assert_eq!(v, 20);
    assert_eq!(cache.warm([(1, 99), (3, 30)]), 1);
    assert_eq!(cache.get(&1), Some(10));
    assert_eq!(cache.len(), 3);
  }
}
