// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod buffer_pool;
pub mod handle_pool;
pub mod positioned_io;
pub mod segment_table;
pub mod worker_pool;

use buffer_pool::BufferPool;
use handle_pool::{HandleFactory, HandlePool, DEFAULT_HANDLE_CAPACITY};
use segment_table::{PoolPair, SegmentTable};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{
            AtomicBool, AtomicU64,
            Ordering::{AcqRel, Acquire},
        },
        Arc,
    },
};
use worker_pool::WorkerPool;

/// Identifies one file-backed chunk of the log.
pub type SegmentId = u64;

/// Log sector size in bytes; direct I/O wants addresses, lengths and
/// offsets aligned to this.
#[cfg(unix)]
pub const SECTOR_SIZE: u64 = 512;

#[cfg(not(unix))]
pub const SECTOR_SIZE: u64 = 4_096;

/// Callback completing one issued I/O: `(error_code, bytes_transferred)`.
///
/// Invoked exactly once per I/O, from a worker thread. The error code is 0
/// on success, the low 16 bits of the OS error on I/O failure, and
/// [`ERROR_UNCLASSIFIED`] for everything else.
pub type IoCompletion = Box<dyn FnOnce(u32, u32) + Send + 'static>;

/// Callback error code for failures with no OS error behind them.
pub const ERROR_UNCLASSIFIED: u32 = u32::MAX;

/// `EINVAL`, reported when an unbuffered write is not sector-aligned.
const EINVAL_CODE: u32 = 22;

fn os_error_code(e: &std::io::Error) -> u32 {
    #[allow(clippy::cast_sign_loss)]
    let code = e
        .raw_os_error()
        .map_or(ERROR_UNCLASSIFIED, |code| (code as u32) & 0xFFFF);

    code
}

// SAFETY: the device moves caller-owned buffer pointers onto worker threads;
// the caller guarantees they outlive the callback (see read_async/write_async)
#[expect(unsafe_code, reason = "see safety")]
mod send_ptr {
    pub(super) struct SendConst(pub *const u8);
    unsafe impl Send for SendConst {}

    pub(super) struct SendMut(pub *mut u8);
    unsafe impl Send for SendMut {}
}

use send_ptr::{SendConst, SendMut};

/// Storage device boundary the log writes through.
///
/// Implementations multiplex append-only logs over some backing medium and
/// complete positioned I/O through callbacks on worker threads.
pub trait StorageDevice {
    /// Alignment required by the backing medium.
    fn sector_size(&self) -> u64;

    /// Fixed segment length, if segments are bounded.
    fn segment_size(&self) -> Option<u64>;

    /// First segment discovered at startup.
    fn start_segment(&self) -> SegmentId;

    /// Last segment discovered at startup.
    fn end_segment(&self) -> SegmentId;

    /// Number of I/Os issued but not yet completed.
    fn in_flight(&self) -> u64;

    /// Whether issuing should back off. Handle pools bound concurrency
    /// already, so devices relying on them report `false`.
    fn throttled(&self) -> bool {
        false
    }

    /// Issues an asynchronous positioned read of `length` bytes from a
    /// segment into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `length` bytes until `callback`
    /// has run.
    #[expect(unsafe_code, reason = "raw caller buffer crosses threads")]
    unsafe fn read_async(
        &self,
        segment: SegmentId,
        offset: u64,
        dst: *mut u8,
        length: u32,
        callback: IoCompletion,
    );

    /// Issues an asynchronous positioned write of `length` bytes from `src`
    /// into a segment, flushing the handle before completion.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `length` bytes until `callback`
    /// has run.
    #[expect(unsafe_code, reason = "raw caller buffer crosses threads")]
    unsafe fn write_async(
        &self,
        src: *const u8,
        segment: SegmentId,
        offset: u64,
        length: u32,
        callback: IoCompletion,
    );

    /// Drops a segment's handle pools and deletes its backing file.
    fn remove_segment(&self, segment: SegmentId) -> crate::Result<()>;

    /// [`StorageDevice::remove_segment`] with a post-completion callback;
    /// the removal itself is synchronous.
    fn remove_segment_async(&self, segment: SegmentId, callback: IoCompletion);

    /// Returns a segment's length in bytes: the configured segment size if
    /// fixed, otherwise the live file length.
    fn file_size(&self, segment: SegmentId) -> crate::Result<u64>;

    /// Drops all handle pools; deletes segment files if the device was
    /// configured to delete on close. The device stays usable.
    fn reset(&self) -> crate::Result<()>;

    /// Waits for in-flight I/O to drain, then tears down all pools (and
    /// segment files, if configured to delete on close).
    fn dispose(&self);
}

/// Segmented device configuration builder
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Fixed segment length; `None` leaves segments unbounded.
    pub segment_size: Option<u64>,

    /// Per-segment, per-direction handle cap. This is the only throttle.
    pub handle_capacity: usize,

    /// Delete segment files on `reset`/`dispose`.
    pub delete_on_close: bool,

    /// Resize new segment files to `segment_size` up front.
    pub preallocate_file: bool,

    /// Keep the OS page cache for reads instead of direct I/O.
    pub os_read_buffering: bool,

    /// Discover existing segments on startup.
    pub recover_device: bool,

    /// I/O worker threads.
    pub worker_count: usize,

    /// Bound on queued I/O jobs; submitters block beyond it.
    pub queue_depth: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            segment_size: None,
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
            delete_on_close: false,
            preallocate_file: false,
            os_read_buffering: false,
            recover_device: true,
            worker_count: 4,
            queue_depth: 64,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn segment_size(mut self, size: Option<u64>) -> Self {
        self.segment_size = size;
        self
    }

    #[must_use]
    pub fn handle_capacity(mut self, capacity: usize) -> Self {
        self.handle_capacity = capacity;
        self
    }

    #[must_use]
    pub fn delete_on_close(mut self, delete: bool) -> Self {
        self.delete_on_close = delete;
        self
    }

    #[must_use]
    pub fn preallocate_file(mut self, preallocate: bool) -> Self {
        self.preallocate_file = preallocate;
        self
    }

    #[must_use]
    pub fn os_read_buffering(mut self, buffering: bool) -> Self {
        self.os_read_buffering = buffering;
        self
    }

    #[must_use]
    pub fn recover_device(mut self, recover: bool) -> Self {
        self.recover_device = recover;
        self
    }

    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }
}

/// Shared state behind a [`SegmentedDevice`].
pub struct DeviceInner {
    /// Full base path; segment `n` lives at `<base>.<n>`.
    base: PathBuf,

    config: DeviceConfig,
    table: SegmentTable,
    buffers: BufferPool,
    workers: WorkerPool,
    in_flight: AtomicU64,

    // recovery-time bounds; written single-threaded at startup
    start_segment: AtomicU64,
    end_segment: AtomicU64,

    disposed: AtomicBool,
}

/// Log-structured storage device multiplexing append-only logs across
/// numbered segment files, with direct-I/O semantics on POSIX.
///
/// Reads and writes are positioned, issued through per-segment handle
/// pools, performed on a fixed worker pool and completed through callbacks.
#[derive(Clone)]
pub struct SegmentedDevice(Arc<DeviceInner>);

impl std::ops::Deref for SegmentedDevice {
    type Target = DeviceInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for SegmentedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SegmentedDevice({:?})", self.base)
    }
}

impl DeviceInner {
    fn segment_path(&self, segment: SegmentId) -> PathBuf {
        let mut path = self.base.as_os_str().to_owned();
        path.push(format!(".{segment}"));
        path.into()
    }

    fn build_pools(&self, segment: SegmentId) -> PoolPair {
        let path = self.segment_path(segment);

        log::trace!("creating handle pools for segment file {path:?}");

        PoolPair {
            read: HandlePool::new(
                HandleFactory::read(path.clone(), self.config.os_read_buffering),
                self.config.handle_capacity,
            ),
            write: HandlePool::new(
                HandleFactory::write(
                    path,
                    self.config
                        .preallocate_file
                        .then_some(self.config.segment_size)
                        .flatten(),
                ),
                self.config.handle_capacity,
            ),
        }
    }
}

impl SegmentedDevice {
    /// Opens a device whose segments live at `<base>.<segment_id>`.
    ///
    /// The base path's directory is created if absent. With
    /// `recover_device`, existing segment files are enumerated and
    /// `start_segment`/`end_segment` are set to the bounds of the longest
    /// contiguous run ending at the highest id; a gap resets both bounds.
    pub fn open<P: AsRef<Path>>(base: P, config: DeviceConfig) -> crate::Result<Self> {
        let base = base.as_ref().to_path_buf();

        let dir = match base.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        std::fs::create_dir_all(&dir)?;

        let (start, end) = if config.recover_device {
            Self::recover_bounds(&dir, &base)?
        } else {
            (0, 0)
        };

        log::debug!("opened segmented device at {base:?}, segments {start}..={end}");

        Ok(Self(Arc::new(DeviceInner {
            buffers: BufferPool::new(usize::try_from(SECTOR_SIZE).unwrap_or(512)),
            workers: WorkerPool::new(config.worker_count, config.queue_depth),
            table: SegmentTable::new(),
            in_flight: AtomicU64::new(0),
            start_segment: AtomicU64::new(start),
            end_segment: AtomicU64::new(end),
            disposed: AtomicBool::new(false),
            base,
            config,
        })))
    }

    fn recover_bounds(dir: &Path, base: &Path) -> crate::Result<(SegmentId, SegmentId)> {
        let Some(file_name) = base.file_name().and_then(|n| n.to_str()) else {
            return Ok((0, 0));
        };

        let prefix = format!("{file_name}.");

        let mut ids = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();

            let Some(name) = name.to_str() else {
                continue;
            };

            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };

            match suffix.parse::<SegmentId>() {
                Ok(id) => ids.push(id),
                Err(_) => log::warn!("ignoring non-segment file {name:?}"),
            }
        }

        ids.sort_unstable();

        // longest contiguous run ending at the highest id; a gap resets
        // both bounds, so end_segment can never go stale
        let mut start = 0;
        let mut end = 0;

        for (idx, id) in ids.iter().copied().enumerate() {
            if idx == 0 || id != end + 1 {
                start = id;
            }

            end = id;
        }

        if !ids.is_empty() {
            log::debug!("recovered {} segment file(s), run {start}..={end}", ids.len());
        }

        Ok((start, end))
    }

    fn complete_detached(&self, callback: IoCompletion, code: u32, bytes: u32) {
        let inner = self.0.clone();

        self.workers.execute(Box::new(move || {
            inner.in_flight.fetch_sub(1, AcqRel);
            callback(code, bytes);
        }));
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Acquire)
    }
}

fn perform_read(
    inner: &DeviceInner,
    file: &File,
    dst: *mut u8,
    offset: u64,
    length: u32,
) -> (u32, u32) {
    let len = length as usize;

    let result = if dst as usize % usize::try_from(SECTOR_SIZE).unwrap_or(512) == 0 {
        // SAFETY: caller contract of read_async — dst valid until callback
        #[expect(unsafe_code, reason = "see safety")]
        let buf = unsafe { std::slice::from_raw_parts_mut(dst, len) };

        positioned_io::pread(file, buf, offset)
    } else {
        // unaligned destination; stage through an aligned buffer
        let mut staging = inner.buffers.acquire(len);
        let result = positioned_io::pread(file, staging.as_mut_slice(), offset);

        if let Ok(count) = result {
            // SAFETY: caller contract of read_async, count <= len
            #[expect(unsafe_code, reason = "see safety")]
            unsafe {
                std::ptr::copy_nonoverlapping(staging.as_ptr(), dst, count);
            }
        }

        inner.buffers.release(staging);
        result
    };

    match result {
        #[allow(clippy::cast_possible_truncation)]
        Ok(count) => (0, count as u32),
        Err(e) => (os_error_code(&e), 0),
    }
}

fn perform_write(
    inner: &DeviceInner,
    file: &File,
    src: *const u8,
    offset: u64,
    length: u32,
) -> (u32, u32) {
    let len = length as usize;

    let result = if src as usize % usize::try_from(SECTOR_SIZE).unwrap_or(512) == 0 {
        // SAFETY: caller contract of write_async — src valid until callback
        #[expect(unsafe_code, reason = "see safety")]
        let data = unsafe { std::slice::from_raw_parts(src, len) };

        positioned_io::pwrite(file, data, offset)
    } else {
        let mut staging = inner.buffers.acquire(len);

        // SAFETY: caller contract of write_async
        #[expect(unsafe_code, reason = "see safety")]
        unsafe {
            std::ptr::copy_nonoverlapping(src, staging.as_mut_ptr(), len);
        }

        let result = positioned_io::pwrite(file, staging.as_slice(), offset);
        inner.buffers.release(staging);
        result
    };

    // flush so durability on completion matches the log's invariants
    match result.and_then(|count| file.sync_all().map(|()| count)) {
        #[allow(clippy::cast_possible_truncation)]
        Ok(count) => (0, count as u32),
        Err(e) => (os_error_code(&e), 0),
    }
}

impl StorageDevice for SegmentedDevice {
    fn sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    fn segment_size(&self) -> Option<u64> {
        self.config.segment_size
    }

    fn start_segment(&self) -> SegmentId {
        self.0.start_segment.load(Acquire)
    }

    fn end_segment(&self) -> SegmentId {
        self.0.end_segment.load(Acquire)
    }

    fn in_flight(&self) -> u64 {
        self.0.in_flight.load(Acquire)
    }

    #[expect(unsafe_code, reason = "raw caller buffer crosses threads")]
    unsafe fn read_async(
        &self,
        segment: SegmentId,
        offset: u64,
        dst: *mut u8,
        length: u32,
        callback: IoCompletion,
    ) {
        self.in_flight.fetch_add(1, AcqRel);

        if self.is_disposed() {
            self.complete_detached(callback, ERROR_UNCLASSIFIED, 0);
            return;
        }

        let pair = match self.table.get_or_add(segment, || self.build_pools(segment)) {
            Ok(pair) => pair,
            Err(_) => {
                self.complete_detached(callback, ERROR_UNCLASSIFIED, 0);
                return;
            }
        };

        let pool = pair.read.clone();
        let claimed = pool.try_get();
        let dst = SendMut(dst);
        let inner = self.0.clone();

        self.workers.execute(Box::new(move || {
            let dst = dst;
            let (code, bytes) = match claimed.map_or_else(|| pool.get(), Ok) {
                Ok(handle) => perform_read(&inner, &handle, dst.0, offset, length),
                Err(crate::Error::Io(e)) => (os_error_code(&e), 0),
                Err(_) => (ERROR_UNCLASSIFIED, 0),
            };

            inner.in_flight.fetch_sub(1, AcqRel);
            callback(code, bytes);
        }));
    }

    #[expect(unsafe_code, reason = "raw caller buffer crosses threads")]
    unsafe fn write_async(
        &self,
        src: *const u8,
        segment: SegmentId,
        offset: u64,
        length: u32,
        callback: IoCompletion,
    ) {
        self.in_flight.fetch_add(1, AcqRel);

        if self.is_disposed() {
            self.complete_detached(callback, ERROR_UNCLASSIFIED, 0);
            return;
        }

        // segment files are unbuffered; misaligned writes are refused
        // instead of relying on the filesystem to reject them
        if offset % SECTOR_SIZE != 0 || u64::from(length) % SECTOR_SIZE != 0 {
            self.complete_detached(callback, EINVAL_CODE, 0);
            return;
        }

        let pair = match self.table.get_or_add(segment, || self.build_pools(segment)) {
            Ok(pair) => pair,
            Err(_) => {
                self.complete_detached(callback, ERROR_UNCLASSIFIED, 0);
                return;
            }
        };

        let pool = pair.write.clone();
        let claimed = pool.try_get();
        let src = SendConst(src);
        let inner = self.0.clone();

        self.workers.execute(Box::new(move || {
            let src = src;
            let (code, bytes) = match claimed.map_or_else(|| pool.get(), Ok) {
                Ok(handle) => perform_write(&inner, &handle, src.0, offset, length),
                Err(crate::Error::Io(e)) => (os_error_code(&e), 0),
                Err(_) => (ERROR_UNCLASSIFIED, 0),
            };

            inner.in_flight.fetch_sub(1, AcqRel);
            callback(code, bytes);
        }));
    }

    fn remove_segment(&self, segment: SegmentId) -> crate::Result<()> {
        self.table.remove(segment);

        let path = self.segment_path(segment);

        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("removed segment file {path:?}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_segment_async(&self, segment: SegmentId, callback: IoCompletion) {
        let code = match self.remove_segment(segment) {
            Ok(()) => 0,
            Err(crate::Error::Io(e)) => os_error_code(&e),
            Err(_) => ERROR_UNCLASSIFIED,
        };

        callback(code, 0);
    }

    fn file_size(&self, segment: SegmentId) -> crate::Result<u64> {
        if let Some(size) = self.config.segment_size {
            return Ok(size);
        }

        let pair = self.table.get_or_add(segment, || self.build_pools(segment))?;

        // the claim returns to the pool on drop
        let handle = pair.read.get()?;

        Ok(handle.metadata().map_err(crate::Error::Io)?.len())
    }

    fn reset(&self) -> crate::Result<()> {
        for id in self.table.drain() {
            if self.config.delete_on_close {
                let path = self.segment_path(id);

                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, AcqRel) {
            return;
        }

        while self.in_flight() > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        self.table.dispose();

        if self.config.delete_on_close {
            for id in self.known_segment_files() {
                let path = self.segment_path(id);

                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("could not delete segment file {path:?}: {e}");
                    }
                }
            }
        }

        log::debug!("segmented device at {:?} disposed", self.base);
    }
}

impl SegmentedDevice {
    /// Segment files currently present on disk for this base name.
    fn known_segment_files(&self) -> Vec<SegmentId> {
        let dir = match self.base.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let Some(file_name) = self.base.file_name().and_then(|n| n.to_str()) else {
            return Vec::new();
        };

        let prefix = format!("{file_name}.");

        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };

        entries
            .filter_map(|entry| {
                let name = entry.ok()?.file_name();
                name.to_str()?.strip_prefix(&prefix)?.parse().ok()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn segment_path_uses_decimal_suffix() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let device = SegmentedDevice::open(dir.path().join("log"), DeviceConfig::default())?;

        assert_eq!(dir.path().join("log.0"), device.segment_path(0));
        assert_eq!(dir.path().join("log.17"), device.segment_path(17));

        device.dispose();

        Ok(())
    }

    #[test]
    fn creates_missing_directory() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let base = dir.path().join("nested").join("deeper").join("log");
        let device = SegmentedDevice::open(&base, DeviceConfig::default())?;

        assert!(base.parent().expect("has parent").exists());

        device.dispose();

        Ok(())
    }

    #[test]
    fn fixed_segment_size_wins_over_file_length() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let device = SegmentedDevice::open(
            dir.path().join("log"),
            DeviceConfig::default().segment_size(Some(1 << 20)),
        )?;

        assert_eq!(1 << 20, device.file_size(0)?);

        device.dispose();

        Ok(())
    }

    #[test]
    fn file_size_queries_live_length() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        std::fs::write(dir.path().join("log.3"), vec![0u8; 8_192])?;

        let device = SegmentedDevice::open(
            dir.path().join("log"),
            DeviceConfig::default().os_read_buffering(true),
        )?;

        assert_eq!(8_192, device.file_size(3)?);

        device.dispose();

        Ok(())
    }
}
