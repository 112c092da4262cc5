// SPDX-License-Identifier: MIT OR Apache-2.0
//! Catalog rows: a lesson plus its durable workflow flags.

use crate::{Lesson, source_hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three valid workflow states derived from the `scheduled` and
/// `converted` flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Not yet admitted to the pipeline.
    Pending,
    /// Admitted; the worker will (re)process it until it completes.
    InFlight,
    /// Transcribed and indexed. Terminal.
    Done,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// A record was observed with `scheduled` and `converted` both set.
///
/// This combination is unreachable through the catalog's own transitions, so
/// observing it means some other writer corrupted the row. Fatal.
#[derive(Debug, thiserror::Error)]
#[error("entry {key} is both scheduled and converted")]
pub struct InvariantViolation {
    /// Catalog key of the offending row.
    pub key: String,
}

/// One catalog row: the unit of work the pipeline operates on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Descriptive payload.
    #[serde(flatten)]
    pub lesson: Lesson,
    /// Terminal success flag.
    pub converted: bool,
    /// Admission flag; set while the record is in flight.
    pub scheduled: bool,
    /// When the record was admitted, if it ever was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Lowercase hex SHA-1 of `lesson.source_url`. Immutable once set.
    pub hash: String,
    /// Full transcript. Set exactly once, on conversion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl Entry {
    /// Create a pending entry for the given lesson, deriving the hash from
    /// the lesson's source URL.
    pub fn new(lesson: Lesson) -> Self {
        let hash = source_hash(&lesson.source_url);
        Self {
            lesson,
            converted: false,
            scheduled: false,
            scheduled_at: None,
            hash,
            transcript: None,
        }
    }

    /// Derive the workflow state from the flags.
    ///
    /// `key` is only used to label the error when the flags are in the
    /// impossible `(scheduled, converted)` combination.
    pub fn state(&self, key: &str) -> Result<WorkflowState, InvariantViolation> {
        match (self.scheduled, self.converted) {
            (false, false) => Ok(WorkflowState::Pending),
            (true, false) => Ok(WorkflowState::InFlight),
            (false, true) => Ok(WorkflowState::Done),
            (true, true) => Err(InvariantViolation {
                key: key.to_string(),
            }),
        }
    }
}
