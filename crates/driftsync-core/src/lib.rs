//! # Driftsync Core
//!
//! Pure data model for the driftsync engine: change records, sync markers,
//! versions, and the conflict rule every store applies.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`ChangeRecord`] - One create/update/delete mutation of a single key
//! - [`SyncMarker`] - Opaque cursor over a store's change log
//! - [`PairId`] - Identity of a (collection, source, destination) pairing
//! - [`Collection`] - Validated name scoping keys and tasks
//! - [`ErrorClass`] - Transient / Fatal / Capacity retry classes
//!
//! ## Conflict Rule
//!
//! Stores resolve concurrent edits with last-writer-wins on
//! `(version, origin)`. See [`conflict`].

pub mod change;
pub mod conflict;
pub mod error;
pub mod types;
pub mod validation;

pub use change::{ApplyOutcome, ChangeBatch, ChangeRecord, Operation};
pub use conflict::{resolve, Resolution};
pub use error::{CoreError, ValidationError};
pub use types::{Collection, Direction, ErrorClass, Origin, PairId, Priority, SyncMarker, Version};
pub use validation::{validate_change_record, validate_key, MAX_KEY_LEN, MAX_VERSION};
