// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{functions::Functions, lock_table::LockTable, lockable_key::LockType};
use crate::{
    monotonic::monotonic_update,
    store::{RecordInfo, Status, UserValue},
};
use std::sync::atomic::AtomicU64;

/// Wraps user functions with the side effects the store mandates.
///
/// Regardless of what user code does, mutation leaves records dirty and
/// modified, deletion additionally tombstones, and concurrent reads refuse
/// sealed or invalid records. In lockable mode, per-operation (ephemeral)
/// locking is disabled: the session holds manual locks, so acquire/release
/// reduce to debug assertions against the lock table.
pub(crate) struct LockableContext<'a, F: Functions> {
    functions: &'a mut F,
    lock_table: &'a LockTable,
    latest_commit_point: &'a AtomicU64,
}

impl<'a, F: Functions> LockableContext<'a, F> {
    pub fn new(
        functions: &'a mut F,
        lock_table: &'a LockTable,
        latest_commit_point: &'a AtomicU64,
    ) -> Self {
        Self {
            functions,
            lock_table,
            latest_commit_point,
        }
    }

    /// `false` when the record must be skipped and the operation retried.
    pub fn concurrent_reader(
        &mut self,
        key: &[u8],
        info: &RecordInfo,
        value: &UserValue,
        output: &mut F::Output,
    ) -> bool {
        if info.is_sealed() || !info.is_valid() {
            return false;
        }

        self.functions.concurrent_reader(key, value, output);
        true
    }

    pub fn single_writer(&mut self, key: &[u8], desired: &[u8]) -> UserValue {
        self.functions.single_writer(key, desired)
    }

    pub fn post_single_writer(&mut self, key: &[u8], info: &RecordInfo, value: &UserValue) {
        self.functions.post_single_writer(key, value);
        info.set_dirty_and_modified();
    }

    pub fn concurrent_writer(
        &mut self,
        key: &[u8],
        info: &RecordInfo,
        value: &mut UserValue,
        desired: &[u8],
    ) -> bool {
        if !self.functions.concurrent_writer(key, value, desired) {
            return false;
        }

        info.set_dirty_and_modified();
        true
    }

    pub fn need_initial_update(&mut self, key: &[u8], input: &F::Input) -> bool {
        self.functions.need_initial_update(key, input)
    }

    pub fn initial_updater(&mut self, key: &[u8], input: &F::Input) -> UserValue {
        self.functions.initial_updater(key, input)
    }

    pub fn post_initial_updater(&mut self, key: &[u8], info: &RecordInfo, value: &UserValue) {
        self.functions.post_initial_updater(key, value);
        info.set_dirty_and_modified();
    }

    pub fn in_place_updater(
        &mut self,
        key: &[u8],
        info: &RecordInfo,
        value: &mut UserValue,
        input: &F::Input,
    ) -> bool {
        if !self.functions.in_place_updater(key, value, input) {
            return false;
        }

        info.set_dirty_and_modified();
        true
    }

    pub fn need_copy_update(&mut self, key: &[u8], old: &UserValue, input: &F::Input) -> bool {
        self.functions.need_copy_update(key, old, input)
    }

    pub fn copy_updater(&mut self, key: &[u8], old: &UserValue, input: &F::Input) -> UserValue {
        self.functions.copy_updater(key, old, input)
    }

    pub fn post_copy_updater(&mut self, key: &[u8], info: &RecordInfo, value: &UserValue) {
        self.functions.post_copy_updater(key, value);
        info.set_dirty_and_modified();
    }

    pub fn single_deleter(&mut self, key: &[u8]) -> UserValue {
        self.functions.single_deleter(key)
    }

    pub fn concurrent_deleter(
        &mut self,
        key: &[u8],
        info: &RecordInfo,
        value: &mut UserValue,
    ) -> bool {
        if !self.functions.concurrent_deleter(key, value) {
            return false;
        }

        info.set_tombstone();
        info.set_dirty_and_modified();
        true
    }

    /// Ephemeral exclusive acquisition; the key must already be manually
    /// locked in exclusive mode.
    pub fn lock_ephemeral_exclusive(&self, lock_code: u64) -> bool {
        debug_assert!(
            self.lock_table.is_locked_exclusive(lock_code),
            "mutating operation on a key that is not locked exclusive"
        );

        true
    }

    /// Ephemeral shared acquisition; the key must already be manually
    /// locked in some mode.
    pub fn lock_ephemeral_shared(&self, lock_code: u64) -> bool {
        debug_assert!(
            self.lock_table.is_locked(lock_code),
            "read on a key that is not locked"
        );

        true
    }

    pub fn unlock_ephemeral(&self, _lock_code: u64, _lock_type: LockType) {
        // manual locks outlive the operation; nothing to release
    }

    pub fn read_completion(&mut self, key: &[u8], output: &F::Output, status: Status) {
        self.functions.read_completion(key, output, status);
    }

    pub fn rmw_completion(&mut self, key: &[u8], status: Status) {
        self.functions.rmw_completion(key, status);
    }

    /// Records the session's latest commit point, then forwards to user
    /// code.
    pub fn checkpoint_completion(&mut self, serial: u64) {
        monotonic_update(self.latest_commit_point, serial);
        self.functions.checkpoint_completion(serial);
    }
}
