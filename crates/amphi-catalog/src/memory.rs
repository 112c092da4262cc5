// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-local catalog backend.

use crate::{Catalog, CatalogError, ListFilter, Page};
use amphi_core::{Entry, Lesson};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// In-memory catalog used by tests and the end-to-end scenarios.
///
/// Implements the same transition semantics as the Datastore backend,
/// including the admission ordering and the flag invariant check.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, as the external crawler would.
    pub fn insert(&self, key: impl Into<String>, entry: Entry) {
        self.entries
            .lock()
            .expect("entries lock poisoned")
            .insert(key.into(), entry);
    }

    /// Snapshot of one record, for assertions.
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.entries
            .lock()
            .expect("entries lock poisoned")
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get_scheduled(&self) -> Result<BTreeMap<String, Lesson>, CatalogError> {
        let entries = self.entries.lock().expect("entries lock poisoned");
        let mut scheduled = BTreeMap::new();
        for (key, entry) in entries.iter() {
            entry.state(key)?;
            if entry.scheduled && !entry.converted {
                scheduled.insert(key.clone(), entry.lesson.clone());
            }
        }
        Ok(scheduled)
    }

    async fn schedule_random(&self, max_duration: Duration) -> Result<Duration, CatalogError> {
        let mut entries = self.entries.lock().expect("entries lock poisoned");
        let picked = entries
            .iter()
            .filter(|(_, e)| {
                !e.converted
                    && !e.scheduled
                    && Duration::from_secs(e.lesson.duration_secs) < max_duration
            })
            .min_by_key(|(_, e)| (e.lesson.duration_secs, e.hash.clone()))
            .map(|(k, _)| k.clone());
        let Some(key) = picked else {
            return Ok(Duration::ZERO);
        };
        let entry = entries.get_mut(&key).expect("picked key present");
        entry.scheduled = true;
        entry.scheduled_at = Some(Utc::now());
        Ok(Duration::from_secs(entry.lesson.duration_secs))
    }

    async fn mark_converted(&self, key: &str, full_text: &str) -> Result<(), CatalogError> {
        let mut entries = self.entries.lock().expect("entries lock poisoned");
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| CatalogError::MissingEntry(key.to_string()))?;
        entry.converted = true;
        entry.scheduled = false;
        entry.transcript = Some(full_text.to_string());
        Ok(())
    }

    async fn list_for_display(
        &self,
        cursor: Option<&str>,
        filter: ListFilter,
        page_size: usize,
    ) -> Result<Page, CatalogError> {
        let entries = self.entries.lock().expect("entries lock poisoned");
        let mut all: Vec<(String, Entry)> = entries
            .iter()
            .filter(|(_, e)| match filter {
                ListFilter::None => true,
                ListFilter::OnlyConverted => e.converted,
            })
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        // Freshest first; key as a deterministic tie-break.
        all.sort_by(|(ka, a), (kb, b)| {
            b.lesson
                .scraped
                .cmp(&a.lesson.scraped)
                .then_with(|| ka.cmp(kb))
        });

        let offset: usize = cursor.map(|c| c.parse().unwrap_or(0)).unwrap_or(0);
        let page: Vec<(String, Entry)> =
            all.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + page.len();
        let next_cursor = (next < all.len()).then(|| next.to_string());
        Ok(Page {
            entries: page,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(source: &str, duration_secs: u64) -> Entry {
        Entry::new(Lesson {
            source_url: source.to_string(),
            audio_url: format!("{source}.mp3"),
            duration_secs,
            ..Lesson::default()
        })
    }

    #[tokio::test]
    async fn schedule_random_prefers_shortest() {
        let catalog = MemoryCatalog::new();
        catalog.insert("long", entry("http://a/long", 900));
        catalog.insert("short", entry("http://a/short", 300));
        let picked = catalog
            .schedule_random(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(picked, Duration::from_secs(300));
        assert!(catalog.get("short").unwrap().scheduled);
        assert!(catalog.get("short").unwrap().scheduled_at.is_some());
        assert!(!catalog.get("long").unwrap().scheduled);
    }

    #[tokio::test]
    async fn schedule_random_breaks_duration_ties_by_hash() {
        let catalog = MemoryCatalog::new();
        let a = entry("http://a/x", 600);
        let b = entry("http://a/y", 600);
        let winner_key = if a.hash < b.hash { "a" } else { "b" };
        catalog.insert("a", a);
        catalog.insert("b", b);
        catalog
            .schedule_random(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(catalog.get(winner_key).unwrap().scheduled);
    }

    #[tokio::test]
    async fn record_at_exactly_max_duration_is_not_eligible() {
        let catalog = MemoryCatalog::new();
        catalog.insert("e", entry("http://a/e", 600));
        let picked = catalog
            .schedule_random(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(picked, Duration::ZERO);
        assert!(!catalog.get("e").unwrap().scheduled);
    }

    #[tokio::test]
    async fn scheduled_and_converted_records_are_not_rescheduled() {
        let catalog = MemoryCatalog::new();
        let mut done = entry("http://a/done", 100);
        done.converted = true;
        let mut inflight = entry("http://a/inflight", 100);
        inflight.scheduled = true;
        catalog.insert("done", done);
        catalog.insert("inflight", inflight);
        let picked = catalog
            .schedule_random(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(picked, Duration::ZERO);
    }

    #[tokio::test]
    async fn get_scheduled_returns_only_in_flight_records() {
        let catalog = MemoryCatalog::new();
        let mut inflight = entry("http://a/x", 600);
        inflight.scheduled = true;
        catalog.insert("x", inflight);
        catalog.insert("pending", entry("http://a/p", 600));
        let scheduled = catalog.get_scheduled().await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert!(scheduled.contains_key("x"));
    }

    #[tokio::test]
    async fn get_scheduled_surfaces_flag_invariant_violations() {
        let catalog = MemoryCatalog::new();
        let mut corrupt = entry("http://a/x", 600);
        corrupt.scheduled = true;
        corrupt.converted = true;
        catalog.insert("x", corrupt);
        let err = catalog.get_scheduled().await.unwrap_err();
        assert!(matches!(err, CatalogError::Invariant(_)));
    }

    #[tokio::test]
    async fn mark_converted_transitions_to_done() {
        let catalog = MemoryCatalog::new();
        let mut inflight = entry("http://a/x", 600);
        inflight.scheduled = true;
        catalog.insert("x", inflight);
        catalog.mark_converted("x", "line 1 line 2").await.unwrap();
        let done = catalog.get("x").unwrap();
        assert!(done.converted);
        assert!(!done.scheduled);
        assert_eq!(done.transcript.as_deref(), Some("line 1 line 2"));
    }

    #[tokio::test]
    async fn mark_converted_fails_for_missing_key() {
        let catalog = MemoryCatalog::new();
        let err = catalog.mark_converted("gone", "text").await.unwrap_err();
        assert!(matches!(err, CatalogError::MissingEntry(k) if k == "gone"));
    }

    #[tokio::test]
    async fn list_for_display_pages_in_freshness_order() {
        let catalog = MemoryCatalog::new();
        for i in 0..5u64 {
            let mut e = entry(&format!("http://a/{i}"), 60);
            e.lesson.scraped = Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap();
            catalog.insert(format!("k{i}"), e);
        }
        let first = catalog
            .list_for_display(None, ListFilter::None, 2)
            .await
            .unwrap();
        assert_eq!(first.entries[0].0, "k4");
        assert_eq!(first.entries[1].0, "k3");
        let cursor = first.next_cursor.expect("more pages");
        let second = catalog
            .list_for_display(Some(&cursor), ListFilter::None, 2)
            .await
            .unwrap();
        assert_eq!(second.entries[0].0, "k2");
        let cursor = second.next_cursor.expect("more pages");
        let last = catalog
            .list_for_display(Some(&cursor), ListFilter::None, 2)
            .await
            .unwrap();
        assert_eq!(last.entries.len(), 1);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_for_display_filters_converted() {
        let catalog = MemoryCatalog::new();
        let mut done = entry("http://a/done", 60);
        done.converted = true;
        done.transcript = Some("text".to_string());
        catalog.insert("done", done);
        catalog.insert("pending", entry("http://a/pending", 60));
        let page = catalog
            .list_for_display(None, ListFilter::OnlyConverted, 10)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].0, "done");
    }
}
