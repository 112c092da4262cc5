// SPDX-License-Identifier: MIT OR Apache-2.0
//! Datastore-backed catalog.
//!
//! Records are entities of kind `Entry` keyed by an opaque name chosen by
//! the crawler. Workflow mutations run inside transactions; the two read
//! queries are plain indexed queries.

use crate::{Catalog, CatalogError, ListFilter, Page};
use amphi_core::{Entry, Lesson};
use amphi_datastore::{
    DatastoreClient, DatastoreError, Direction, Entity, Key, Mutation, Op, Query, Value,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Entity kind of catalog records.
const ENTRY_KIND: &str = "Entry";

/// Catalog backed by Google Datastore.
#[derive(Clone, Debug)]
pub struct DatastoreCatalog {
    client: DatastoreClient,
}

impl DatastoreCatalog {
    /// Catalog over an existing client.
    pub fn new(client: DatastoreClient) -> Self {
        Self { client }
    }
}

fn entity_key_name(entity: &Entity) -> Result<String, CatalogError> {
    entity
        .key
        .leaf_name()
        .map(str::to_string)
        .ok_or_else(|| CatalogError::Store(DatastoreError::Property("__key__".to_string())))
}

fn entity_to_entry(key: &str, entity: &Entity) -> Result<Entry, CatalogError> {
    let lesson = Lesson {
        title: entity.get_string_or_default("Title"),
        lecturer: entity.get_string_or_default("Lecturer"),
        function: entity.get_string_or_default("Function"),
        date: entity.get_timestamp("Date").unwrap_or_default(),
        lesson_type: entity.get_string_or_default("LessonType"),
        type_title: entity.get_string_or_default("TypeTitle"),
        video_url: entity.get_string_or_default("VideoLink"),
        audio_url: entity.get_string_or_default("AudioLink"),
        chaire: entity.get_string_or_default("Chaire"),
        language: entity.get_string_or_default("Language"),
        source_url: entity.get_string_or_default("Source"),
        duration_secs: entity.get_i64("DurationSec").unwrap_or(0).max(0) as u64,
        scraped: entity.get_timestamp("Scraped").unwrap_or_default(),
    };
    let entry = Entry {
        lesson,
        converted: entity.get_bool("Converted").unwrap_or(false),
        scheduled: entity.get_bool("Scheduled").unwrap_or(false),
        scheduled_at: entity.get_timestamp("ScheduledTime"),
        hash: entity.get_string_or_default("Hash"),
        transcript: entity
            .properties
            .get("Transcript")
            .and_then(|v| v.string_value.clone()),
    };
    entry.state(key)?;
    Ok(entry)
}

fn entry_to_entity(key: &str, entry: &Entry) -> Entity {
    let mut e = Entity::new(Key::named(ENTRY_KIND, key));
    let l = &entry.lesson;
    e.set("Title", Value::string(&l.title).unindexed());
    e.set("Lecturer", Value::string(&l.lecturer).unindexed());
    e.set("Function", Value::string(&l.function).unindexed());
    e.set("Date", Value::timestamp(l.date));
    e.set("LessonType", Value::string(&l.lesson_type).unindexed());
    e.set("TypeTitle", Value::string(&l.type_title).unindexed());
    e.set("VideoLink", Value::string(&l.video_url).unindexed());
    e.set("AudioLink", Value::string(&l.audio_url).unindexed());
    e.set("Chaire", Value::string(&l.chaire).unindexed());
    e.set("Language", Value::string(&l.language).unindexed());
    e.set("Source", Value::string(&l.source_url).unindexed());
    e.set("DurationSec", Value::integer(l.duration_secs as i64));
    e.set("Scraped", Value::timestamp(l.scraped));
    e.set("Converted", Value::boolean(entry.converted));
    e.set("Scheduled", Value::boolean(entry.scheduled));
    match entry.scheduled_at {
        Some(t) => e.set("ScheduledTime", Value::timestamp(t)),
        None => e.set("ScheduledTime", Value::null()),
    }
    e.set("Hash", Value::string(&entry.hash));
    match &entry.transcript {
        Some(t) => e.set("Transcript", Value::string(t).unindexed()),
        None => e.set("Transcript", Value::null().unindexed()),
    }
    e
}

#[async_trait]
impl Catalog for DatastoreCatalog {
    async fn get_scheduled(&self) -> Result<BTreeMap<String, Lesson>, CatalogError> {
        let query = Query::kind(ENTRY_KIND)
            .filter("Scheduled", Op::Equal, Value::boolean(true))
            .filter("Converted", Op::Equal, Value::boolean(false));
        let results = self.client.run_query(query).await?;
        let mut scheduled = BTreeMap::new();
        for entity in &results.entities {
            let key = entity_key_name(entity)?;
            let entry = entity_to_entry(&key, entity)?;
            scheduled.insert(key, entry.lesson);
        }
        Ok(scheduled)
    }

    async fn schedule_random(&self, max_duration: Duration) -> Result<Duration, CatalogError> {
        if max_duration.is_zero() {
            return Ok(Duration::ZERO);
        }
        let query = Query::kind(ENTRY_KIND)
            .filter("Converted", Op::Equal, Value::boolean(false))
            .filter("Scheduled", Op::Equal, Value::boolean(false))
            .filter(
                "DurationSec",
                Op::LessThan,
                Value::integer(max_duration.as_secs() as i64),
            )
            .order_by("DurationSec", Direction::Ascending)
            .order_by("Hash", Direction::Ascending)
            .limit(1);
        let results = self.client.run_query(query).await?;
        let Some(candidate) = results.entities.into_iter().next() else {
            return Ok(Duration::ZERO);
        };
        let key = entity_key_name(&candidate)?;

        // Re-read inside a transaction so a concurrent admission cannot
        // double-schedule the same record.
        let tx = self.client.begin_transaction().await?;
        let Some(mut entity) = self.client.lookup(&candidate.key, Some(&tx)).await? else {
            return Ok(Duration::ZERO);
        };
        let entry = entity_to_entry(&key, &entity)?;
        if entry.scheduled || entry.converted {
            debug!(target: "amphi.catalog", key = %key, "candidate no longer pending, skipping");
            return Ok(Duration::ZERO);
        }
        entity.set("Scheduled", Value::boolean(true));
        entity.set("ScheduledTime", Value::timestamp(Utc::now()));
        self.client.commit(tx, vec![Mutation::Update(entity)]).await?;
        debug!(target: "amphi.catalog", key = %key, duration_secs = entry.lesson.duration_secs, "admitted record");
        Ok(Duration::from_secs(entry.lesson.duration_secs))
    }

    async fn mark_converted(&self, key: &str, full_text: &str) -> Result<(), CatalogError> {
        let entity_key = Key::named(ENTRY_KIND, key);
        let tx = self.client.begin_transaction().await?;
        let Some(mut entity) = self.client.lookup(&entity_key, Some(&tx)).await? else {
            return Err(CatalogError::MissingEntry(key.to_string()));
        };
        entity.set("Converted", Value::boolean(true));
        entity.set("Scheduled", Value::boolean(false));
        entity.set("Transcript", Value::string(full_text).unindexed());
        self.client.commit(tx, vec![Mutation::Update(entity)]).await?;
        Ok(())
    }

    async fn list_for_display(
        &self,
        cursor: Option<&str>,
        filter: ListFilter,
        page_size: usize,
    ) -> Result<Page, CatalogError> {
        let mut query = Query::kind(ENTRY_KIND)
            .order_by("Scraped", Direction::Descending)
            .limit(page_size as i32);
        if filter == ListFilter::OnlyConverted {
            query = query.filter("Converted", Op::Equal, Value::boolean(true));
        }
        if let Some(cursor) = cursor {
            query = query.start_cursor(cursor);
        }
        let results = self.client.run_query(query).await?;
        let mut entries = Vec::with_capacity(results.entities.len());
        for entity in &results.entities {
            let key = entity_key_name(entity)?;
            let entry = entity_to_entry(&key, entity)?;
            entries.push((key, entry));
        }
        let next_cursor = (entries.len() == page_size)
            .then_some(results.end_cursor)
            .flatten();
        Ok(Page {
            entries,
            next_cursor,
        })
    }
}
