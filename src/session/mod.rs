// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub(crate) mod context;
pub mod epoch;
pub mod functions;
pub mod lock_table;
pub mod lockable_key;

use crate::{
    cancel::CancellationToken,
    store::{OperationStatus, Status, Store},
};
use context::LockableContext;
use epoch::Epoch;
use functions::Functions;
use lock_table::{LockStatus, LockTable};
use lockable_key::{sort_lock_keys, LockType, LockableKey};
use std::sync::{atomic::AtomicU64, Arc};

/// Per-session façade over the store with two-phase manual locking.
///
/// A session is owned by one logical task at a time. Between
/// [`LockableSession::begin_lockable`] and [`LockableSession::end_lockable`]
/// it may take and release manual bucket locks and run point operations
/// against keys it holds locks for; the locking discipline is the
/// concurrency control, so operations on unlocked keys are a protocol
/// violation (asserted in debug builds).
///
/// Every synchronous operation runs inside scoped epoch protection acquired
/// here; callers must not already hold protection on the thread.
pub struct LockableSession<F: Functions> {
    store: Arc<Store>,
    functions: F,

    is_acquired_lockable: bool,
    exclusive_lock_count: u64,
    shared_lock_count: u64,

    latest_commit_point: AtomicU64,
}

/// Whether `keys[index]` is the first key (in sort order) mapping onto its
/// bucket. Later keys on the same bucket collapse into no-ops: the sort
/// puts exclusive requests first, so the first occurrence acquires the
/// strongest mode anyone asked for.
fn first_in_bucket(table: &LockTable, keys: &[LockableKey], index: usize) -> bool {
    if index == 0 {
        return true;
    }

    let current = keys.get(index).map(|key| table.bucket_index(key.lock_code));
    let previous = keys
        .get(index - 1)
        .map(|key| table.bucket_index(key.lock_code));

    current != previous
}

impl<F: Functions> LockableSession<F> {
    pub(crate) fn new(store: Arc<Store>, functions: F) -> Self {
        Self {
            store,
            functions,
            is_acquired_lockable: false,
            exclusive_lock_count: 0,
            shared_lock_count: 0,
            latest_commit_point: AtomicU64::new(0),
        }
    }

    /// Enters lockable mode.
    pub fn begin_lockable(&mut self) -> crate::Result<()> {
        if self.is_acquired_lockable {
            return Err(crate::Error::InvalidState);
        }

        debug_assert!(
            !Epoch::is_protected(),
            "begin_lockable under epoch protection"
        );

        self.is_acquired_lockable = true;
        log::trace!("session entered lockable mode");

        Ok(())
    }

    /// Leaves lockable mode. Fails while any lock is still held.
    pub fn end_lockable(&mut self) -> crate::Result<()> {
        if !self.is_acquired_lockable
            || self.exclusive_lock_count != 0
            || self.shared_lock_count != 0
        {
            return Err(crate::Error::InvalidState);
        }

        self.is_acquired_lockable = false;
        log::trace!("session left lockable mode");

        Ok(())
    }

    #[must_use]
    pub fn is_acquired_lockable(&self) -> bool {
        self.is_acquired_lockable
    }

    /// Manual exclusive locks currently held.
    #[must_use]
    pub fn exclusive_lock_count(&self) -> u64 {
        self.exclusive_lock_count
    }

    /// Manual shared locks currently held.
    #[must_use]
    pub fn shared_lock_count(&self) -> u64 {
        self.shared_lock_count
    }

    /// Highest commit point observed through checkpoint completions.
    #[must_use]
    pub fn latest_commit_point(&self) -> u64 {
        self.latest_commit_point
            .load(std::sync::atomic::Ordering::Acquire)
    }

    fn expect_lockable(&self) -> crate::Result<()> {
        if self.is_acquired_lockable {
            Ok(())
        } else {
            Err(crate::Error::InvalidState)
        }
    }

    /// Acquires manual locks for all keys, left to right in the shared
    /// total order, collapsing keys that land on the same bucket.
    ///
    /// The slice is sorted in place; each bucket acquisition retries until
    /// it succeeds.
    pub fn lock(&mut self, keys: &mut [LockableKey]) -> crate::Result<()> {
        self.expect_lockable()?;

        sort_lock_keys(keys);

        debug_assert!(!Epoch::is_protected(), "lock under caller-held epoch");
        let _guard = self.store.epoch().resume();

        let table = self.store.lock_table();

        for index in 0..keys.len() {
            if !first_in_bucket(table, keys, index) {
                continue;
            }

            #[allow(clippy::indexing_slicing)]
            let key = keys[index];

            while !matches!(
                table.try_lock(key.lock_code, key.lock_type),
                LockStatus::Acquired
            ) {
                std::hint::spin_loop();
            }

            match key.lock_type {
                LockType::Exclusive => self.exclusive_lock_count += 1,
                LockType::Shared => self.shared_lock_count += 1,
            }
        }

        Ok(())
    }

    /// Releases manual locks for all keys, right to left, with the same
    /// bucket collapsing as [`LockableSession::lock`].
    pub fn unlock(&mut self, keys: &mut [LockableKey]) -> crate::Result<()> {
        self.expect_lockable()?;

        sort_lock_keys(keys);

        debug_assert!(!Epoch::is_protected(), "unlock under caller-held epoch");
        let _guard = self.store.epoch().resume();

        let table = self.store.lock_table();

        for index in (0..keys.len()).rev() {
            if !first_in_bucket(table, keys, index) {
                continue;
            }

            #[allow(clippy::indexing_slicing)]
            let key = keys[index];

            table.unlock(key.lock_code, key.lock_type);

            match key.lock_type {
                LockType::Exclusive => {
                    debug_assert!(self.exclusive_lock_count > 0, "unlock without matching lock");
                    self.exclusive_lock_count = self.exclusive_lock_count.saturating_sub(1);
                }
                LockType::Shared => {
                    debug_assert!(self.shared_lock_count > 0, "unlock without matching lock");
                    self.shared_lock_count = self.shared_lock_count.saturating_sub(1);
                }
            }
        }

        Ok(())
    }

    /// Reads the record for `key` through the functions pipeline.
    pub fn read(&mut self, key: &[u8], output: &mut F::Output) -> crate::Result<Status> {
        self.expect_lockable()?;

        let store = self.store.clone();

        debug_assert!(!Epoch::is_protected(), "operation under caller-held epoch");
        let guard = store.epoch().resume();

        let status = loop {
            let mut ctx = LockableContext::new(
                &mut self.functions,
                store.lock_table(),
                &self.latest_commit_point,
            );

            match store.internal_read(key, output, &mut ctx) {
                OperationStatus::Done(status) => break status,
                OperationStatus::RetryNow => guard.refresh(),
            }
        };

        Ok(status)
    }

    /// Inserts or overwrites the record for `key`.
    pub fn upsert(&mut self, key: &[u8], desired: &[u8]) -> crate::Result<Status> {
        self.expect_lockable()?;

        let store = self.store.clone();

        debug_assert!(!Epoch::is_protected(), "operation under caller-held epoch");
        let guard = store.epoch().resume();

        let status = loop {
            let mut ctx = LockableContext::new(
                &mut self.functions,
                store.lock_table(),
                &self.latest_commit_point,
            );

            match store.internal_upsert(key, desired, &mut ctx) {
                OperationStatus::Done(status) => break status,
                OperationStatus::RetryNow => guard.refresh(),
            }
        };

        Ok(status)
    }

    /// Read-modify-writes the record for `key` with `input`.
    pub fn rmw(&mut self, key: &[u8], input: &F::Input) -> crate::Result<Status> {
        self.expect_lockable()?;

        let store = self.store.clone();

        debug_assert!(!Epoch::is_protected(), "operation under caller-held epoch");
        let guard = store.epoch().resume();

        let status = loop {
            let mut ctx = LockableContext::new(
                &mut self.functions,
                store.lock_table(),
                &self.latest_commit_point,
            );

            match store.internal_rmw(key, input, &mut ctx) {
                OperationStatus::Done(status) => break status,
                OperationStatus::RetryNow => guard.refresh(),
            }
        };

        Ok(status)
    }

    /// Deletes the record for `key`, leaving a tombstone.
    pub fn delete(&mut self, key: &[u8]) -> crate::Result<Status> {
        self.expect_lockable()?;

        let store = self.store.clone();

        debug_assert!(!Epoch::is_protected(), "operation under caller-held epoch");
        let guard = store.epoch().resume();

        let status = loop {
            let mut ctx = LockableContext::new(
                &mut self.functions,
                store.lock_table(),
                &self.latest_commit_point,
            );

            match store.internal_delete(key, &mut ctx) {
                OperationStatus::Done(status) => break status,
                OperationStatus::RetryNow => guard.refresh(),
            }
        };

        Ok(status)
    }

    /// Re-reads the global epoch into this thread's protection entry.
    pub fn refresh(&mut self) -> crate::Result<()> {
        debug_assert!(!Epoch::is_protected(), "refresh under caller-held epoch");

        let guard = self.store.epoch().resume();
        guard.refresh();

        Ok(())
    }

    /// Drains outstanding operations. The in-memory record index never
    /// leaves an operation pending, so this completes immediately.
    pub fn complete_pending(&mut self, wait: bool) -> crate::Result<bool> {
        let _ = wait;

        debug_assert!(
            !Epoch::is_protected(),
            "complete_pending under caller-held epoch"
        );
        let _guard = self.store.epoch().resume();

        Ok(true)
    }

    /// Like [`LockableSession::read`], but observes `token` between
    /// attempts; the final status is reported through
    /// [`Functions::read_completion`] as well.
    ///
    /// Each attempt takes its own scoped protection instead of wrapping the
    /// whole operation, since cancellation checks sit between attempts.
    pub fn read_cancellable(
        &mut self,
        key: &[u8],
        output: &mut F::Output,
        token: &CancellationToken,
    ) -> crate::Result<Status> {
        self.expect_lockable()?;

        let store = self.store.clone();

        loop {
            if token.is_cancelled() {
                return Err(crate::Error::Cancelled);
            }

            let guard = store.epoch().resume();

            let mut ctx = LockableContext::new(
                &mut self.functions,
                store.lock_table(),
                &self.latest_commit_point,
            );

            let outcome = store.internal_read(key, output, &mut ctx);
            drop(guard);

            if let OperationStatus::Done(status) = outcome {
                let mut ctx = LockableContext::new(
                    &mut self.functions,
                    store.lock_table(),
                    &self.latest_commit_point,
                );
                ctx.read_completion(key, output, status);

                return Ok(status);
            }
        }
    }

    /// Like [`LockableSession::rmw`], but observes `token` between
    /// attempts; the final status is reported through
    /// [`Functions::rmw_completion`] as well.
    pub fn rmw_cancellable(
        &mut self,
        key: &[u8],
        input: &F::Input,
        token: &CancellationToken,
    ) -> crate::Result<Status> {
        self.expect_lockable()?;

        let store = self.store.clone();

        loop {
            if token.is_cancelled() {
                return Err(crate::Error::Cancelled);
            }

            let guard = store.epoch().resume();

            let mut ctx = LockableContext::new(
                &mut self.functions,
                store.lock_table(),
                &self.latest_commit_point,
            );

            let outcome = store.internal_rmw(key, input, &mut ctx);
            drop(guard);

            if let OperationStatus::Done(status) = outcome {
                let mut ctx = LockableContext::new(
                    &mut self.functions,
                    store.lock_table(),
                    &self.latest_commit_point,
                );
                ctx.rmw_completion(key, status);

                return Ok(status);
            }
        }
    }

    /// The session's bound functions object.
    pub fn functions(&self) -> &F {
        &self.functions
    }
}

impl<F: Functions> Drop for LockableSession<F> {
    fn drop(&mut self) {
        debug_assert!(
            self.exclusive_lock_count == 0 && self.shared_lock_count == 0,
            "session dropped with live lock holds"
        );
    }
}
