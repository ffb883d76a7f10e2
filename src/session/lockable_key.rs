// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// How a lock-table bucket is held.
///
/// `Exclusive` orders before `Shared`: when one lock code is requested in
/// both modes, sorting puts the exclusive request first, so the bucket is
/// acquired exclusively and the shared duplicates collapse into no-ops.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LockType {
    Exclusive,
    Shared,
}

/// A manual-lock request: a 64-bit lock code plus the mode to hold it in.
///
/// Lock codes collapse keys onto lock-table buckets; distinct keys may
/// share a code, and the table locks buckets, not keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LockableKey {
    pub lock_code: u64,
    pub lock_type: LockType,
}

impl LockableKey {
    #[must_use]
    pub fn new(lock_code: u64, lock_type: LockType) -> Self {
        Self {
            lock_code,
            lock_type,
        }
    }

    #[must_use]
    pub fn exclusive(lock_code: u64) -> Self {
        Self::new(lock_code, LockType::Exclusive)
    }

    #[must_use]
    pub fn shared(lock_code: u64) -> Self {
        Self::new(lock_code, LockType::Shared)
    }
}

/// Sorts lock requests into the total acquisition order every session uses:
/// ascending lock code, `Exclusive` before `Shared` per code.
///
/// Sessions that acquire in this shared order cannot deadlock one another.
pub fn sort_lock_keys(keys: &mut [LockableKey]) {
    keys.sort_unstable_by_key(|key| (key.lock_code, key.lock_type));
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn exclusive_sorts_before_shared() {
        let mut keys = [
            LockableKey::shared(7),
            LockableKey::exclusive(8),
            LockableKey::exclusive(7),
            LockableKey::shared(3),
        ];

        sort_lock_keys(&mut keys);

        assert_eq!(
            [
                LockableKey::shared(3),
                LockableKey::exclusive(7),
                LockableKey::shared(7),
                LockableKey::exclusive(8),
            ],
            keys
        );
    }
}
