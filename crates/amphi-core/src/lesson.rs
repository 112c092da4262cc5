// SPDX-License-Identifier: MIT OR Apache-2.0
//! The descriptive payload of one recorded lecture.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hints at or above this length are dropped before reaching the recognizer,
/// which rejects context phrases of 100 characters or more.
pub const MAX_HINT_LEN: usize = 100;

/// One lecture, colloquium or symposium session as crawled from upstream.
///
/// Serialized form matches the search-index document layout: optional fields
/// are omitted when empty, and crawl-internal fields (`video_url`,
/// `scraped`) never reach the index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    /// Title of the session, e.g. "What was at Stake in the India-China Opium Trade?".
    pub title: String,
    /// Lecturer name.
    pub lecturer: String,
    /// Affiliation of the lecturer, e.g. "EHESS, Paris".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
    /// When the session took place, UTC.
    pub date: DateTime<Utc>,
    /// Kind of session: "Colloque", "Leçon inaugurale", ...
    pub lesson_type: String,
    /// Title of the series the session belongs to, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub type_title: String,
    /// Video link, if the upstream page carries one. Not indexed.
    #[serde(skip)]
    pub video_url: String,
    /// Direct link to the audio file.
    #[serde(rename = "audio_link")]
    pub audio_url: String,
    /// Identifier of the chaire (the yearly lecture series).
    pub chaire: String,
    /// BCP-47-like language tag of the audio ("fr", "en", ...). Empty means
    /// the pipeline default.
    #[serde(rename = "lang")]
    pub language: String,
    /// Page this lesson was crawled from.
    pub source_url: String,
    /// Audio duration in seconds.
    #[serde(rename = "duration")]
    pub duration_secs: u64,
    /// When the lesson was scraped. Not indexed.
    #[serde(skip)]
    pub scraped: DateTime<Utc>,
}

impl Lesson {
    /// Vocabulary hints passed to the recognizer to bias it toward the
    /// lesson's domain.
    ///
    /// Returns the non-empty items of (title, lecturer, chaire, type_title)
    /// in that order, dropping any item of [`MAX_HINT_LEN`] characters or
    /// more.
    pub fn hints(&self) -> Vec<String> {
        [&self.title, &self.lecturer, &self.chaire, &self.type_title]
            .into_iter()
            .filter(|s| !s.is_empty() && s.chars().count() < MAX_HINT_LEN)
            .cloned()
            .collect()
    }
}
