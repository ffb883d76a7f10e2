// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::lockable_key::LockType;
use crate::hash::hash_u64;
use std::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire},
};

const EXCLUSIVE_BIT: u64 = 1 << 63;
const SHARED_MASK: u64 = EXCLUSIVE_BIT - 1;

/// Outcome of one lock attempt. `RetryNow` is an internal signal the caller
/// loops on; it is never surfaced.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockStatus {
    Acquired,
    RetryNow,
}

/// Bucket-keyed manual lock table.
///
/// A lock code selects a bucket through [`hash_u64`]; each bucket is one
/// word holding an exclusive bit and a shared count. Whoever hashes onto
/// the same bucket contends on the same lock, keys notwithstanding.
pub struct LockTable {
    buckets: Box<[AtomicU64]>,
}

impl LockTable {
    /// Creates a table with `bucket_count` buckets (a power of two).
    #[must_use]
    pub fn new(bucket_count: usize) -> Self {
        assert!(
            bucket_count.is_power_of_two(),
            "bucket count must be a power of two"
        );

        Self {
            buckets: (0..bucket_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket selected by a lock code.
    #[must_use]
    pub fn bucket_index(&self, lock_code: u64) -> u64 {
        hash_u64(lock_code) & (self.buckets.len() as u64 - 1)
    }

    fn bucket(&self, lock_code: u64) -> &AtomicU64 {
        #[allow(clippy::indexing_slicing, clippy::cast_possible_truncation)]
        let bucket = &self.buckets[self.bucket_index(lock_code) as usize];

        bucket
    }

    /// One acquisition attempt; idempotent up to bucket state.
    pub fn try_lock(&self, lock_code: u64, lock_type: LockType) -> LockStatus {
        let bucket = self.bucket(lock_code);

        match lock_type {
            LockType::Exclusive => {
                if bucket.compare_exchange(0, EXCLUSIVE_BIT, AcqRel, Acquire).is_ok() {
                    LockStatus::Acquired
                } else {
                    LockStatus::RetryNow
                }
            }
            LockType::Shared => {
                let word = bucket.load(Acquire);

                if word & EXCLUSIVE_BIT != 0 {
                    return LockStatus::RetryNow;
                }

                if bucket
                    .compare_exchange(word, word + 1, AcqRel, Acquire)
                    .is_ok()
                {
                    LockStatus::Acquired
                } else {
                    LockStatus::RetryNow
                }
            }
        }
    }

    /// Releases a held bucket lock.
    pub fn unlock(&self, lock_code: u64, lock_type: LockType) {
        let bucket = self.bucket(lock_code);

        match lock_type {
            LockType::Exclusive => {
                let previous = bucket.swap(0, AcqRel);
                debug_assert_eq!(
                    EXCLUSIVE_BIT, previous,
                    "released an exclusive lock that was not held"
                );
            }
            LockType::Shared => {
                let previous = bucket.fetch_sub(1, AcqRel);
                debug_assert_eq!(0, previous & EXCLUSIVE_BIT);
                debug_assert!(
                    previous & SHARED_MASK > 0,
                    "released a shared lock that was not held"
                );
            }
        }
    }

    #[must_use]
    pub fn is_locked_exclusive(&self, lock_code: u64) -> bool {
        self.bucket(lock_code).load(Acquire) & EXCLUSIVE_BIT != 0
    }

    #[must_use]
    pub fn is_locked_shared(&self, lock_code: u64) -> bool {
        self.bucket(lock_code).load(Acquire) & SHARED_MASK != 0
    }

    #[must_use]
    pub fn is_locked(&self, lock_code: u64) -> bool {
        self.bucket(lock_code).load(Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn exclusive_excludes_everyone() {
        let table = LockTable::new(64);

        assert_eq!(LockStatus::Acquired, table.try_lock(1, LockType::Exclusive));
        assert_eq!(LockStatus::RetryNow, table.try_lock(1, LockType::Exclusive));
        assert_eq!(LockStatus::RetryNow, table.try_lock(1, LockType::Shared));
        assert!(table.is_locked_exclusive(1));
        assert!(table.is_locked(1));

        table.unlock(1, LockType::Exclusive);
        assert!(!table.is_locked(1));
    }

    #[test]
    fn shared_holds_stack() {
        let table = LockTable::new(64);

        assert_eq!(LockStatus::Acquired, table.try_lock(1, LockType::Shared));
        assert_eq!(LockStatus::Acquired, table.try_lock(1, LockType::Shared));
        assert_eq!(LockStatus::RetryNow, table.try_lock(1, LockType::Exclusive));
        assert!(table.is_locked_shared(1));

        table.unlock(1, LockType::Shared);
        assert!(table.is_locked_shared(1));

        table.unlock(1, LockType::Shared);
        assert!(!table.is_locked(1));
        assert_eq!(LockStatus::Acquired, table.try_lock(1, LockType::Exclusive));
        table.unlock(1, LockType::Exclusive);
    }

    #[test]
    fn buckets_not_keys_are_locked() {
        let table = LockTable::new(1);

        // every code collapses onto the single bucket
        assert_eq!(table.bucket_index(7), table.bucket_index(8));

        assert_eq!(LockStatus::Acquired, table.try_lock(7, LockType::Exclusive));
        assert_eq!(LockStatus::RetryNow, table.try_lock(8, LockType::Shared));

        table.unlock(7, LockType::Exclusive);
    }
}
