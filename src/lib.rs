//! vehicle-store - single-file versioned record store
//!
//! Records are JSON objects keyed by an external identifier (a vehicle
//! registration) and kept one per line in a single backing file. Every field
//! carries a change-deduplicated history; list values are stored verbatim.
//!
//! - [`store::RecordStore`]: locked reads, whole-file rewrites, self-healing
//! - [`history::merge`]: append-on-change history semantics
//! - [`codec`]: line encoding and noise stripping
//! - [`lookup::VehicleLookup`]: freshness-window cache over upstream sources

#![forbid(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation
)]

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod index;
pub mod lock;
pub mod lookup;
pub mod record;
pub mod store;

pub use error::{Error, Result};
pub use lookup::{FieldSource, Lookup, VehicleLookup};
pub use record::{Field, HistoryEntry, Record};
pub use store::{RecordStore, StoreOptions};
