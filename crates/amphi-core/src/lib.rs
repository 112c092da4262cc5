// SPDX-License-Identifier: MIT OR Apache-2.0
//! Data model and shared primitives for the amphi transcription pipeline.
//!
//! The central types are [`Lesson`] (the descriptive payload of one recorded
//! lecture) and [`Entry`] (a lesson plus its durable workflow flags). The
//! worker and every storage backend agree on these types; everything else in
//! the workspace is plumbing around them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod lesson;
mod shutdown;

pub use entry::{Entry, InvariantViolation, WorkflowState};
pub use lesson::{Lesson, MAX_HINT_LEN};
pub use shutdown::Shutdown;

/// One recognized fragment of speech with the recognizer's confidence.
#[derive(Clone, Debug, PartialEq)]
pub struct Transcription {
    /// Recognized text for one result segment.
    pub text: String,
    /// Confidence score in `[0.0, 1.0]` as reported by the recognizer.
    pub confidence: f32,
}

/// Lowercase hex SHA-1 of the given source URL.
///
/// Hex ordering equals byte ordering, so the catalog can use the hash
/// directly as a deterministic pseudo-random tie-break key.
pub fn source_hash(source_url: &str) -> String {
    use sha1::{Digest, Sha1};
    use std::fmt::Write;
    let digest = Sha1::digest(source_url.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
