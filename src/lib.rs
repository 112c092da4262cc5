// SPDX-License-Identifier: MIT OR Apache-2.0
//! Umbrella crate for the amphi workspace.
//!
//! Re-exports the functional crates so the end-to-end tests in `tests/` can
//! exercise the whole pipeline through one dependency. The binary lives in
//! `amphi-cli`.

pub use amphi_blob as blob;
pub use amphi_budget as budget;
pub use amphi_catalog as catalog;
pub use amphi_core as model;
pub use amphi_index as index;
pub use amphi_media as media;
pub use amphi_transcribe as transcribe;
pub use amphi_worker as worker;
