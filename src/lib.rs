//! Incremental issue/pull-request sync from GitHub into a SQLite document store.
//!
//! Pages are fetched in order per repository, conditioned on the entity tag
//! recorded for that page on the previous run. Unchanged pages are skipped;
//! changed pages are normalized and written together with their new tag in a
//! single upsert batch, so a crash between pages never loses or duplicates data.

pub mod config;
pub mod cursor;
pub mod db;
pub mod github;
pub mod indexer;
pub mod model;
pub mod sync;
pub mod transform;
