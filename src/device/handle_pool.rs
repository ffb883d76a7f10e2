// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::positioned_io::enable_direct_io;
use std::{
    collections::VecDeque,
    fs::File,
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
};

/// Default per-segment, per-direction cap on simultaneously open handles.
///
/// This is the device's only throttle.
pub const DEFAULT_HANDLE_CAPACITY: usize = 120;

/// Which direction a pool's handles are opened for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandleKind {
    Read,
    Write,
}

/// Opens fresh handles for one segment file in one direction.
#[derive(Clone, Debug)]
pub struct HandleFactory {
    pub(crate) path: PathBuf,
    pub(crate) kind: HandleKind,

    /// Keep the OS page cache for reads instead of going direct.
    pub(crate) os_read_buffering: bool,

    /// Resize freshly created write handles to this length.
    pub(crate) preallocate_to: Option<u64>,
}

impl HandleFactory {
    /// Factory for read handles; direct I/O is enabled post-open unless OS
    /// read buffering is requested.
    #[must_use]
    pub fn read<P: Into<PathBuf>>(path: P, os_read_buffering: bool) -> Self {
        Self {
            path: path.into(),
            kind: HandleKind::Read,
            os_read_buffering,
            preallocate_to: None,
        }
    }

    /// Factory for write handles, optionally preallocated to a fixed size.
    #[must_use]
    pub fn write<P: Into<PathBuf>>(path: P, preallocate_to: Option<u64>) -> Self {
        Self {
            path: path.into(),
            kind: HandleKind::Write,
            os_read_buffering: false,
            preallocate_to,
        }
    }

    pub(crate) fn open(&self) -> std::io::Result<File> {
        match self.kind {
            HandleKind::Read => {
                let file = std::fs::OpenOptions::new().read(true).open(&self.path)?;

                if !self.os_read_buffering && !enable_direct_io(&file) {
                    log::trace!("direct reads unavailable for {:?}", self.path);
                }

                Ok(file)
            }
            HandleKind::Write => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&self.path)?;

                if let Some(size) = self.preallocate_to {
                    if file.metadata()?.len() < size {
                        file.set_len(size)?;
                    }
                }

                if !enable_direct_io(&file) {
                    log::trace!("direct writes unavailable for {:?}", self.path);
                }

                Ok(file)
            }
        }
    }
}

enum WaiterState {
    Waiting,
    Ready(File),
    Closed,
}

/// One FIFO claimant's hand-off slot.
struct Waiter {
    state: Mutex<WaiterState>,
    signal: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaiterState::Waiting),
            signal: Condvar::new(),
        })
    }

    /// Hands a file to this waiter. Returns it if the slot was already closed.
    fn fill(&self, file: File) -> Option<File> {
        let mut state = self.state.lock().expect("lock is poisoned");

        match &*state {
            WaiterState::Waiting => {
                *state = WaiterState::Ready(file);
                drop(state);
                self.signal.notify_one();
                None
            }
            _ => Some(file),
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("lock is poisoned");

        if matches!(*state, WaiterState::Waiting) {
            *state = WaiterState::Closed;
            drop(state);
            self.signal.notify_one();
        }
    }

    fn wait(&self) -> crate::Result<File> {
        let mut state = self.state.lock().expect("lock is poisoned");

        loop {
            match std::mem::replace(&mut *state, WaiterState::Waiting) {
                WaiterState::Ready(file) => return Ok(file),
                WaiterState::Closed => {
                    *state = WaiterState::Closed;
                    return Err(crate::Error::Disposed);
                }
                WaiterState::Waiting => {
                    state = self.signal.wait(state).expect("lock is poisoned");
                }
            }
        }
    }
}

struct PoolState {
    idle: Vec<File>,

    /// Handles currently in existence, idle or claimed.
    open_count: usize,

    waiters: VecDeque<Arc<Waiter>>,
    disposed: bool,
}

/// A bounded pool of open file handles for a single segment in one direction.
///
/// At most `capacity` handles exist at any instant. Claimants beyond that
/// block and are served strictly in registration order; a returned handle is
/// handed to the front waiter directly, so it wakes exactly one claimant.
pub struct HandlePool {
    factory: HandleFactory,
    capacity: usize,
    state: Mutex<PoolState>,
}

/// A claimed handle; returns itself to its pool on drop.
pub struct PooledFile {
    pool: Arc<HandlePool>,
    file: Option<File>,
}

impl std::ops::Deref for PooledFile {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        self.file.as_ref().expect("still claimed")
    }
}

impl Drop for PooledFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.give_back(file);
        }
    }
}

impl HandlePool {
    #[must_use]
    pub fn new(factory: HandleFactory, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            factory,
            capacity,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open_count: 0,
                waiters: VecDeque::new(),
                disposed: false,
            }),
        })
    }

    /// Non-blocking claim of an idle handle.
    #[must_use]
    pub fn try_get(self: &Arc<Self>) -> Option<PooledFile> {
        let mut state = self.state.lock().expect("lock is poisoned");

        state.idle.pop().map(|file| PooledFile {
            pool: self.clone(),
            file: Some(file),
        })
    }

    /// Claims a handle: an idle one, a fresh one while below capacity, or
    /// blocks FIFO until another claimant returns one.
    pub fn get(self: &Arc<Self>) -> crate::Result<PooledFile> {
        let waiter = {
            let mut state = self.state.lock().expect("lock is poisoned");

            if state.disposed {
                return Err(crate::Error::Disposed);
            }

            if let Some(file) = state.idle.pop() {
                return Ok(PooledFile {
                    pool: self.clone(),
                    file: Some(file),
                });
            }

            if state.open_count < self.capacity {
                state.open_count += 1;
                drop(state);

                return match self.factory.open() {
                    Ok(file) => Ok(PooledFile {
                        pool: self.clone(),
                        file: Some(file),
                    }),
                    Err(e) => {
                        self.state.lock().expect("lock is poisoned").open_count -= 1;
                        Err(crate::Error::Io(e))
                    }
                };
            }

            let waiter = Waiter::new();
            state.waiters.push_back(waiter.clone());
            waiter
        };

        // Blocks outside the pool lock so returns can proceed.
        let file = waiter.wait()?;

        Ok(PooledFile {
            pool: self.clone(),
            file: Some(file),
        })
    }

    /// Gives a handle back, waking the front waiter if any.
    fn give_back(&self, mut file: File) {
        let mut state = self.state.lock().expect("lock is poisoned");

        if state.disposed {
            // closed instead of re-pooled
            state.open_count -= 1;
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.fill(file) {
                None => return,
                Some(rejected) => file = rejected,
            }
        }

        state.idle.push(file);
    }

    /// Closes all idle handles and fails pending waiters.
    ///
    /// In-flight claims drain normally; their handles are closed as they
    /// come back.
    pub fn dispose(&self) {
        let waiters = {
            let mut state = self.state.lock().expect("lock is poisoned");

            if state.disposed {
                return;
            }

            state.disposed = true;
            state.open_count -= state.idle.len();
            state.idle.clear();

            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            waiter.close();
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().expect("lock is poisoned").disposed
    }

    /// Handles currently in existence (idle plus claimed).
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().expect("lock is poisoned").open_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use test_log::test;

    fn scratch_factory(dir: &std::path::Path) -> HandleFactory {
        HandleFactory::write(dir.join("segment.0"), None)
    }

    #[test]
    fn capacity_is_never_exceeded() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = HandlePool::new(scratch_factory(dir.path()), 3);

        let a = pool.get()?;
        let b = pool.get()?;
        let c = pool.get()?;
        assert_eq!(3, pool.open_count());
        assert!(pool.try_get().is_none());

        drop(a);
        assert_eq!(3, pool.open_count());
        let _d = pool.try_get().expect("one idle handle");

        drop(b);
        drop(c);
        assert_eq!(3, pool.open_count());

        Ok(())
    }

    #[test]
    fn waiters_are_served_fifo() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = HandlePool::new(scratch_factory(dir.path()), 1);

        let held = pool.get()?;

        let turn = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                let turn = turn.clone();
                let order = order.clone();

                std::thread::spawn(move || {
                    // register waiters one at a time, in index order
                    while turn.load(SeqCst) != i {
                        std::thread::yield_now();
                    }

                    let claim = pool.get_registered(&turn);
                    order.lock().expect("lock is poisoned").push(i);
                    drop(claim);
                })
            })
            .collect();

        // all four registered
        while turn.load(SeqCst) != 4 {
            std::thread::yield_now();
        }

        drop(held);

        for t in threads {
            t.join().expect("thread panicked");
        }

        assert_eq!(vec![0, 1, 2, 3], *order.lock().expect("lock is poisoned"));

        Ok(())
    }

    #[test]
    fn dispose_fails_waiters_and_closes_returns() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = HandlePool::new(scratch_factory(dir.path()), 1);

        let held = pool.get()?;

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.get().err())
        };

        // wait for registration
        while pool.state.lock().expect("lock is poisoned").waiters.is_empty() {
            std::thread::yield_now();
        }

        pool.dispose();

        assert!(matches!(
            waiter.join().expect("thread panicked"),
            Some(crate::Error::Disposed)
        ));

        // the in-flight claim drains; its handle is closed, not re-pooled
        drop(held);
        assert_eq!(0, pool.open_count());
        assert!(matches!(pool.get(), Err(crate::Error::Disposed)));

        Ok(())
    }
}

#[cfg(test)]
impl HandlePool {
    /// Claims like [`HandlePool::get`], bumping `turn` once this claimant is
    /// either served or registered as a waiter. Test hook for pinning FIFO
    /// delivery order.
    fn get_registered(
        self: &Arc<Self>,
        turn: &std::sync::atomic::AtomicUsize,
    ) -> crate::Result<PooledFile> {
        use std::sync::atomic::Ordering::SeqCst;

        let waiter = {
            let mut state = self.state.lock().expect("lock is poisoned");

            if state.disposed {
                return Err(crate::Error::Disposed);
            }

            if let Some(file) = state.idle.pop() {
                turn.fetch_add(1, SeqCst);
                return Ok(PooledFile {
                    pool: self.clone(),
                    file: Some(file),
                });
            }

            let waiter = Waiter::new();
            state.waiters.push_back(waiter.clone());
            turn.fetch_add(1, SeqCst);
            waiter
        };

        let file = waiter.wait()?;

        Ok(PooledFile {
            pool: self.clone(),
            file: Some(file),
        })
    }
}
