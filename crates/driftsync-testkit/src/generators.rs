//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use driftsync_core::{ChangeRecord, Collection, ErrorClass, Operation, Origin, Priority, Version};

/// Generate a valid collection name.
pub fn collection() -> impl Strategy<Value = Collection> {
    "[a-z][a-z0-9_.-]{0,15}".prop_filter_map("valid collection", |name| Collection::new(name).ok())
}

/// Generate a key.
pub fn key() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,12}".prop_map(String::from)
}

/// Generate payload bytes up to `max_len`.
pub fn payload(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(Bytes::from)
}

/// Generate a version in a small range, so collisions are common.
pub fn version() -> impl Strategy<Value = Version> {
    (1u64..64).prop_map(Version)
}

pub fn origin() -> impl Strategy<Value = Origin> {
    prop_oneof![Just(Origin::Local), Just(Origin::Remote)]
}

pub fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Create),
        Just(Operation::Update),
        Just(Operation::Delete),
    ]
}

pub fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Background),
        Just(Priority::Normal),
        Just(Priority::Interactive),
    ]
}

pub fn error_class() -> impl Strategy<Value = ErrorClass> {
    prop_oneof![
        Just(ErrorClass::Transient),
        Just(ErrorClass::Capacity),
        Just(ErrorClass::Fatal),
    ]
}

/// Generate a well-formed change record for `key`.
pub fn change_record_for(key: String) -> impl Strategy<Value = ChangeRecord> {
    (operation(), payload(64), version(), origin()).prop_map(move |(op, payload, version, origin)| {
        match op {
            Operation::Create => ChangeRecord::create(key.clone(), payload, version, origin),
            Operation::Update => ChangeRecord::update(key.clone(), payload, version, origin),
            Operation::Delete => ChangeRecord::delete(key.clone(), version, origin),
        }
    })
}

/// Generate a well-formed change record.
pub fn change_record() -> impl Strategy<Value = ChangeRecord> {
    key().prop_flat_map(change_record_for)
}

/// Generate up to `max` records over a small key space, so the same key is
/// touched more than once.
pub fn change_records(max: usize) -> impl Strategy<Value = Vec<ChangeRecord>> {
    let keyed = prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")]
        .prop_flat_map(|key| change_record_for(key.to_string()));
    prop::collection::vec(keyed, 0..=max)
}
