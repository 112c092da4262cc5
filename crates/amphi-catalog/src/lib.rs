// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable catalog of lecture records.
//!
//! The [`Catalog`] capability owns every mutation of record workflow flags:
//! admission (`schedule_random`), completion (`mark_converted`) and the
//! read paths used by the worker and the external display API. Two backends
//! are provided: a process-local [`MemoryCatalog`] for tests and the
//! Datastore-backed [`DatastoreCatalog`] used in production.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod datastore;
mod memory;

pub use datastore::DatastoreCatalog;
pub use memory::MemoryCatalog;

use amphi_core::{Entry, InvariantViolation, Lesson};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Errors surfaced by catalog backends.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The durable store failed; retryable at the next iteration.
    #[error("catalog store: {0}")]
    Store(#[from] amphi_datastore::DatastoreError),
    /// `mark_converted` was asked to finish a record that no longer exists.
    #[error("no catalog entry at key {0}")]
    MissingEntry(String),
    /// A record was observed in an impossible flag combination. Fatal.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Filter for the display listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ListFilter {
    /// Every record.
    #[default]
    None,
    /// Only records whose transcript is available.
    OnlyConverted,
}

/// One page of the display listing.
#[derive(Clone, Debug)]
pub struct Page {
    /// Records in freshness order (most recently scraped first).
    pub entries: Vec<(String, Entry)>,
    /// Cursor for the next page, absent on the last page.
    pub next_cursor: Option<String>,
}

/// Capability contract for the record catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// All in-flight records (`scheduled` set, `converted` clear), keyed by
    /// their opaque catalog key. Order is unspecified; the in-flight set is
    /// bounded by admission so no pagination is needed.
    async fn get_scheduled(&self) -> Result<BTreeMap<String, Lesson>, CatalogError>;

    /// Atomically admit at most one pending record whose duration is
    /// strictly below `max_duration`, preferring shorter records and
    /// breaking ties by hash. Returns the admitted record's duration, or
    /// [`Duration::ZERO`] when nothing fits.
    async fn schedule_random(&self, max_duration: Duration) -> Result<Duration, CatalogError>;

    /// Atomically complete the record at `key`: set `converted`, clear
    /// `scheduled`, store the transcript.
    async fn mark_converted(&self, key: &str, full_text: &str) -> Result<(), CatalogError>;

    /// Read-only paginated listing for the external display API, most
    /// recently scraped first.
    async fn list_for_display(
        &self,
        cursor: Option<&str>,
        filter: ListFilter,
        page_size: usize,
    ) -> Result<Page, CatalogError>;
}
