// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::handle_pool::HandlePool;
use super::SegmentId;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};

/// The read and write handle pools backing one segment.
pub struct PoolPair {
    /// Pool of read handles.
    pub read: Arc<HandlePool>,

    /// Pool of write handles.
    pub write: Arc<HandlePool>,
}

impl PoolPair {
    fn dispose(&self) {
        self.read.dispose();
        self.write.dispose();
    }
}

struct TableInner {
    map: FxHashMap<SegmentId, Arc<PoolPair>>,
    disposed: bool,
}

/// Maps each segment id to its pair of handle pools.
///
/// Concurrent `get_or_add` yields exactly one pair per id; the loser of an
/// insertion race disposes its own builder output. Once disposed, insertion
/// is rejected outright instead of mixing teardown into construction.
pub struct SegmentTable {
    inner: RwLock<TableInner>,
}

impl SegmentTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                map: FxHashMap::default(),
                disposed: false,
            }),
        }
    }

    pub fn get_or_add(
        &self,
        id: SegmentId,
        build: impl FnOnce() -> PoolPair,
    ) -> crate::Result<Arc<PoolPair>> {
        {
            let inner = self.inner.read().expect("lock is poisoned");

            if inner.disposed {
                return Err(crate::Error::Disposed);
            }

            if let Some(pair) = inner.map.get(&id) {
                return Ok(pair.clone());
            }
        }

        // built outside the write lock; pools open handles lazily, so a
        // discarded builder is cheap
        let pair = Arc::new(build());

        let mut inner = self.inner.write().expect("lock is poisoned");

        if inner.disposed {
            pair.dispose();
            return Err(crate::Error::Disposed);
        }

        match inner.map.entry(id) {
            std::collections::hash_map::Entry::Occupied(e) => {
                let winner = e.get().clone();
                drop(inner);
                pair.dispose();
                Ok(winner)
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(pair.clone());
                Ok(pair)
            }
        }
    }

    /// Removes a segment's pools; both are disposed before the removal
    /// becomes observable.
    pub fn remove(&self, id: SegmentId) {
        let mut inner = self.inner.write().expect("lock is poisoned");

        if let Some(pair) = inner.map.remove(&id) {
            pair.dispose();
        }
    }

    /// Drops every pool pair, leaving the table usable.
    pub fn drain(&self) -> Vec<SegmentId> {
        let drained: Vec<_> = {
            let mut inner = self.inner.write().expect("lock is poisoned");
            inner.map.drain().collect()
        };

        drained
            .into_iter()
            .map(|(id, pair)| {
                pair.dispose();
                id
            })
            .collect()
    }

    /// Marks the table disposed and drops every pool pair. Subsequent
    /// `get_or_add` calls fail.
    pub fn dispose(&self) {
        let drained: Vec<_> = {
            let mut inner = self.inner.write().expect("lock is poisoned");
            inner.disposed = true;
            inner.map.drain().map(|(_, pair)| pair).collect()
        };

        for pair in drained {
            pair.dispose();
        }
    }

    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.inner
            .read()
            .expect("lock is poisoned")
            .map
            .keys()
            .copied()
            .collect()
    }
}

impl Default for SegmentTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::handle_pool::HandleFactory;
    use test_log::test;

    fn pair_for(dir: &std::path::Path, id: SegmentId) -> PoolPair {
        let factory = HandleFactory::write(dir.join(format!("log.{id}")), None);

        PoolPair {
            read: HandlePool::new(factory.clone(), 2),
            write: HandlePool::new(factory, 2),
        }
    }

    #[test]
    fn one_pair_per_id() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SegmentTable::new();

        let a = table.get_or_add(0, || pair_for(dir.path(), 0))?;
        let b = table.get_or_add(0, || pair_for(dir.path(), 0))?;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(vec![0], table.segment_ids());

        Ok(())
    }

    #[test]
    fn rejects_insertion_after_dispose() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SegmentTable::new();

        table.get_or_add(0, || pair_for(dir.path(), 0))?;
        table.dispose();

        assert!(matches!(
            table.get_or_add(1, || pair_for(dir.path(), 1)),
            Err(crate::Error::Disposed)
        ));

        Ok(())
    }

    #[test]
    fn remove_disposes_pools() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SegmentTable::new();

        let pair = table.get_or_add(7, || pair_for(dir.path(), 7))?;
        table.remove(7);

        assert!(pair.read.is_disposed());
        assert!(pair.write.is_disposed());
        assert!(table.segment_ids().is_empty());

        Ok(())
    }
}
