// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod record;

use crate::{
    hash::hash_bytes,
    session::{
        context::LockableContext, epoch::Epoch, functions::Functions, lock_table::LockTable,
        LockableSession,
    },
};
use crossbeam_skiplist::SkipMap;
use std::sync::Arc;

pub use record::{Record, RecordInfo, UserKey, UserValue};

/// Outcome of a point operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    /// The operation completed against an existing record
    Ok,

    /// No live record for this key (for read-modify-write: the record was
    /// freshly created)
    NotFound,

    /// The operation will complete through a completion callback
    Pending,

    /// The operation was refused by user code
    Aborted,
}

/// Internal operation outcome; retries loop inside the session and are
/// never surfaced.
#[derive(Debug)]
pub(crate) enum OperationStatus {
    Done(Status),
    RetryNow,
}

const DEFAULT_LOCK_BUCKETS: usize = 16_384;

/// Concurrent record store driven through lockable sessions.
///
/// Holds the record index, the manual lock table and the epoch. Point
/// operations run through a session's functions pipeline; concurrency
/// control is the session's manual bucket locks, so the routines here can
/// stay simple.
pub struct Store {
    records: SkipMap<UserKey, Arc<Record>>,
    lock_table: LockTable,
    epoch: Epoch,
}

impl Store {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_lock_buckets(DEFAULT_LOCK_BUCKETS)
    }

    /// Creates a store with a lock table of `bucket_count` buckets (a power
    /// of two).
    #[must_use]
    pub fn with_lock_buckets(bucket_count: usize) -> Arc<Self> {
        Arc::new(Self {
            records: SkipMap::new(),
            lock_table: LockTable::new(bucket_count),
            epoch: Epoch::new(),
        })
    }

    /// Collapses a key to its lock code.
    #[must_use]
    pub fn lock_code(key: &[u8]) -> u64 {
        hash_bytes(key)
    }

    #[must_use]
    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    #[must_use]
    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    /// Records in the index, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Opens a session bound to a functions object.
    #[must_use]
    pub fn lockable_session<F: Functions>(self: &Arc<Self>, functions: F) -> LockableSession<F> {
        LockableSession::new(self.clone(), functions)
    }

    fn live_record(&self, key: &[u8]) -> Option<Arc<Record>> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    pub(crate) fn internal_read<F: Functions>(
        &self,
        key: &[u8],
        output: &mut F::Output,
        ctx: &mut LockableContext<'_, F>,
    ) -> OperationStatus {
        ctx.lock_ephemeral_shared(Self::lock_code(key));

        let Some(record) = self.live_record(key) else {
            return OperationStatus::Done(Status::NotFound);
        };

        if record.info.is_tombstone() {
            return OperationStatus::Done(Status::NotFound);
        }

        let value = record.value.read().expect("lock is poisoned");

        if ctx.concurrent_reader(key, &record.info, &value, output) {
            OperationStatus::Done(Status::Ok)
        } else {
            OperationStatus::RetryNow
        }
    }

    pub(crate) fn internal_upsert<F: Functions>(
        &self,
        key: &[u8],
        desired: &[u8],
        ctx: &mut LockableContext<'_, F>,
    ) -> OperationStatus {
        ctx.lock_ephemeral_exclusive(Self::lock_code(key));

        let mut retired_previous = false;

        if let Some(record) = self.live_record(key) {
            if !record.info.is_tombstone() {
                if record.info.is_sealed() || !record.info.is_valid() {
                    return OperationStatus::RetryNow;
                }

                {
                    let mut value = record.value.write().expect("lock is poisoned");

                    if ctx.concurrent_writer(key, &record.info, &mut value, desired) {
                        return OperationStatus::Done(Status::Ok);
                    }
                }

                // user code refused the in-place write; replace the record
                record.info.seal();
                retired_previous = true;
            }
        }

        let value = ctx.single_writer(key, desired);
        let record = Arc::new(Record::new(value));
        self.records.insert(UserKey::from(key), record.clone());

        if retired_previous {
            self.epoch.bump();
        }

        let value = record.value.read().expect("lock is poisoned");
        ctx.post_single_writer(key, &record.info, &value);

        OperationStatus::Done(Status::Ok)
    }

    pub(crate) fn internal_rmw<F: Functions>(
        &self,
        key: &[u8],
        input: &F::Input,
        ctx: &mut LockableContext<'_, F>,
    ) -> OperationStatus {
        ctx.lock_ephemeral_exclusive(Self::lock_code(key));

        if let Some(record) = self.live_record(key) {
            if !record.info.is_tombstone() {
                if record.info.is_sealed() || !record.info.is_valid() {
                    return OperationStatus::RetryNow;
                }

                {
                    let mut value = record.value.write().expect("lock is poisoned");

                    if ctx.in_place_updater(key, &record.info, &mut value, input) {
                        return OperationStatus::Done(Status::Ok);
                    }
                }

                let old = record.value.read().expect("lock is poisoned").clone();

                if !ctx.need_copy_update(key, &old, input) {
                    return OperationStatus::Done(Status::Ok);
                }

                record.info.seal();

                let new_value = ctx.copy_updater(key, &old, input);
                let new_record = Arc::new(Record::new(new_value));
                self.records.insert(UserKey::from(key), new_record.clone());
                self.epoch.bump();

                let value = new_record.value.read().expect("lock is poisoned");
                ctx.post_copy_updater(key, &new_record.info, &value);

                return OperationStatus::Done(Status::Ok);
            }
        }

        if !ctx.need_initial_update(key, input) {
            return OperationStatus::Done(Status::NotFound);
        }

        let value = ctx.initial_updater(key, input);
        let record = Arc::new(Record::new(value));
        self.records.insert(UserKey::from(key), record.clone());

        let value = record.value.read().expect("lock is poisoned");
        ctx.post_initial_updater(key, &record.info, &value);

        // the record was created, but no prior value existed
        OperationStatus::Done(Status::NotFound)
    }

    pub(crate) fn internal_delete<F: Functions>(
        &self,
        key: &[u8],
        ctx: &mut LockableContext<'_, F>,
    ) -> OperationStatus {
        ctx.lock_ephemeral_exclusive(Self::lock_code(key));

        let Some(record) = self.live_record(key) else {
            return OperationStatus::Done(Status::NotFound);
        };

        if record.info.is_tombstone() {
            return OperationStatus::Done(Status::NotFound);
        }

        if record.info.is_sealed() || !record.info.is_valid() {
            return OperationStatus::RetryNow;
        }

        {
            let mut value = record.value.write().expect("lock is poisoned");

            if ctx.concurrent_deleter(key, &record.info, &mut value) {
                return OperationStatus::Done(Status::Ok);
            }
        }

        // refused in place; seal and replace with a fresh tombstone
        record.info.seal();

        let value = ctx.single_deleter(key);
        let tombstone = Arc::new(Record::new(value));
        tombstone.info.set_tombstone();
        tombstone.info.set_dirty_and_modified();
        self.records.insert(UserKey::from(key), tombstone);
        self.epoch.bump();

        OperationStatus::Done(Status::Ok)
    }
}
