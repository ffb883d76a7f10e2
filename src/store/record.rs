// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{
        AtomicU32,
        Ordering::{AcqRel, Acquire},
    },
    Arc, RwLock,
};

/// User key bytes, cheap to clone
pub type UserKey = Arc<[u8]>;

/// User value bytes, cheap to clone
pub type UserValue = Arc<[u8]>;

const VALID: u32 = 1;
const SEALED: u32 = 1 << 1;
const TOMBSTONE: u32 = 1 << 2;
const DIRTY: u32 = 1 << 3;
const MODIFIED: u32 = 1 << 4;

/// Per-record metadata flags.
///
/// A sealed or invalid record is skipped by concurrent readers; a deleted
/// record carries `tombstone` and is also dirty and modified.
#[derive(Debug)]
pub struct RecordInfo(AtomicU32);

impl RecordInfo {
    /// Fresh, readable record state.
    #[must_use]
    pub fn new_valid() -> Self {
        Self(AtomicU32::new(VALID))
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0.load(Acquire) & VALID != 0
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.0.load(Acquire) & SEALED != 0
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.0.load(Acquire) & TOMBSTONE != 0
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.0.load(Acquire) & DIRTY != 0
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.0.load(Acquire) & MODIFIED != 0
    }

    /// Makes the record unreadable while it is being retired in favor of
    /// a replacement; concurrent readers retry instead.
    pub fn seal(&self) {
        self.0.fetch_or(SEALED, AcqRel);
    }

    /// Marks the record logically deleted.
    pub fn set_tombstone(&self) {
        self.0.fetch_or(TOMBSTONE, AcqRel);
    }

    /// Flags the record for the next flush and checkpoint delta.
    pub fn set_dirty_and_modified(&self) {
        self.0.fetch_or(DIRTY | MODIFIED, AcqRel);
    }

    pub fn invalidate(&self) {
        self.0.fetch_and(!VALID, AcqRel);
    }
}

impl Default for RecordInfo {
    fn default() -> Self {
        Self::new_valid()
    }
}

impl Clone for RecordInfo {
    fn clone(&self) -> Self {
        Self(AtomicU32::new(self.0.load(Acquire)))
    }
}

/// One live record: metadata flags plus the value payload.
pub struct Record {
    pub info: RecordInfo,
    pub value: RwLock<UserValue>,
}

impl Record {
    #[must_use]
    pub fn new(value: UserValue) -> Self {
        Self {
            info: RecordInfo::new_valid(),
            value: RwLock::new(value),
        }
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Record({:?})", self.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn fresh_record_is_valid_and_clean() {
        let info = RecordInfo::new_valid();

        assert!(info.is_valid());
        assert!(!info.is_sealed());
        assert!(!info.is_tombstone());
        assert!(!info.is_dirty());
        assert!(!info.is_modified());
    }

    #[test]
    fn deleted_record_is_dirty_and_modified() {
        let info = RecordInfo::new_valid();

        info.set_tombstone();
        info.set_dirty_and_modified();

        assert!(info.is_tombstone());
        assert!(info.is_dirty());
        assert!(info.is_modified());
        assert!(info.is_valid());
    }

    #[test]
    fn sealing_does_not_invalidate() {
        let info = RecordInfo::new_valid();

        info.seal();

        assert!(info.is_sealed());
        assert!(info.is_valid());
    }
}
