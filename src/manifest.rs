//! The optional remote manifest shape (spec.md §6):
//!
//! ```json
//! { "files": [ { "path": "rel/a.txt", "size": 123, "mtime": 1700000000, "hash": "..." } ] }
//! ```
//!
//! Read-only from the core's perspective; an invalid or missing manifest
//! simply causes the scanner to fall back to a live remote listing.

pub use crate::model::{Manifest, ManifestEntry};
