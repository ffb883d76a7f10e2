// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::store::{Status, UserValue};

/// User-supplied strategy object invoked at record lifecycle points.
///
/// The store is monomorphized on the implementing type, so every hook is
/// statically dispatched and inlineable. "Single" hooks see a record no
/// other session can touch; "concurrent" hooks may race with readers of
/// the same record and mutate it in place.
///
/// Most hooks have workable defaults: a blind upsert, a reader-delegating
/// concurrent read, unconditional updates and in-place deletes. Implement
/// the ones your access pattern cares about.
pub trait Functions {
    /// Per-operation input for read-modify-write.
    type Input;

    /// Output assembled by reads.
    type Output;

    /// Reads a record no other session can be mutating.
    fn single_reader(&mut self, key: &[u8], value: &UserValue, output: &mut Self::Output);

    /// Reads a record that may be concurrently mutated. Sealed and invalid
    /// records are refused before this is reached.
    fn concurrent_reader(&mut self, key: &[u8], value: &UserValue, output: &mut Self::Output) {
        self.single_reader(key, value, output);
    }

    /// Builds the stored value for a fresh upsert.
    fn single_writer(&mut self, _key: &[u8], desired: &[u8]) -> UserValue {
        desired.into()
    }

    /// Runs after a fresh record became visible.
    fn post_single_writer(&mut self, _key: &[u8], _value: &UserValue) {}

    /// Overwrites a live record in place; returning `false` routes the
    /// upsert through seal-and-replace instead.
    fn concurrent_writer(&mut self, _key: &[u8], value: &mut UserValue, desired: &[u8]) -> bool {
        *value = desired.into();
        true
    }

    /// Whether a read-modify-write against a missing record should create
    /// one at all.
    fn need_initial_update(&mut self, _key: &[u8], _input: &Self::Input) -> bool {
        true
    }

    /// Builds the value for a read-modify-write against a missing record.
    fn initial_updater(&mut self, key: &[u8], input: &Self::Input) -> UserValue;

    /// Runs after an initial update became visible.
    fn post_initial_updater(&mut self, _key: &[u8], _value: &UserValue) {}

    /// Mutates a live record in place; returning `false` routes the
    /// operation through the copy path.
    fn in_place_updater(&mut self, key: &[u8], value: &mut UserValue, input: &Self::Input)
        -> bool;

    /// Whether an out-of-place update should happen once the in-place path
    /// was refused.
    fn need_copy_update(&mut self, _key: &[u8], _old: &UserValue, _input: &Self::Input) -> bool {
        true
    }

    /// Builds the replacement value for an out-of-place update.
    fn copy_updater(&mut self, key: &[u8], old: &UserValue, input: &Self::Input) -> UserValue;

    /// Runs after an out-of-place update became visible.
    fn post_copy_updater(&mut self, _key: &[u8], _value: &UserValue) {}

    /// Value stored into a freshly written tombstone record.
    fn single_deleter(&mut self, _key: &[u8]) -> UserValue {
        UserValue::from(&[][..])
    }

    /// Deletes a live record in place; returning `false` seals it and
    /// writes a fresh tombstone record instead.
    fn concurrent_deleter(&mut self, _key: &[u8], _value: &mut UserValue) -> bool {
        true
    }

    /// Completion of a read that did not finish synchronously.
    fn read_completion(&mut self, _key: &[u8], _output: &Self::Output, _status: Status) {}

    /// Completion of a read-modify-write that did not finish synchronously.
    fn rmw_completion(&mut self, _key: &[u8], _status: Status) {}

    /// A checkpoint covering everything up to `serial` became durable.
    fn checkpoint_completion(&mut self, _serial: u64) {}
}
