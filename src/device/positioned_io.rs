// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Positioned reads and writes.
//!
//! Positioned I/O never moves the file's seek pointer, so many concurrent
//! operations can share a single handle without seek races. Short transfers
//! are possible and are not retried here.

use std::fs::File;

/// Reads into `buf` at an absolute byte offset, returning the transfer count.
#[cfg(unix)]
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

/// Writes `data` at an absolute byte offset, returning the transfer count.
#[cfg(unix)]
pub fn pwrite(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(data, offset)
}

#[cfg(windows)]
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
pub fn pwrite(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(data, offset)
}

/// Flags an already-open file for direct (unbuffered) I/O.
///
/// ORs `O_DIRECT` into the file status flags. Callers must keep buffer
/// addresses, lengths and offsets sector-aligned afterwards. Returns whether
/// the flag was applied; filesystems without direct I/O support (tmpfs for
/// one) refuse it.
#[cfg(target_os = "linux")]
#[expect(unsafe_code, reason = "fcntl on a borrowed, open descriptor")]
pub fn enable_direct_io(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();

    // SAFETY: the descriptor is open for the lifetime of `file`
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return false;
    }

    // SAFETY: as above
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_DIRECT) == 0 }
}

/// No direct-I/O file status flag on this platform.
#[cfg(not(target_os = "linux"))]
pub fn enable_direct_io(_file: &File) -> bool {
    false
}
