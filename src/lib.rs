// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Segmented direct-I/O log device and lockable sessions for concurrent
//! key-value stores.
//!
//! ##### About
//!
//! This crate provides the two load-bearing subsystems of a log-structured,
//! epoch-protected key-value store:
//!
//! - [`SegmentedDevice`] — a storage device that multiplexes large
//!   append-only logs across numbered segment files, serves concurrent
//!   positioned reads and writes through per-segment pools of file handles,
//!   and opens those handles with unbuffered (direct) semantics on POSIX.
//!   I/O completes through callbacks on a fixed worker pool.
//! - [`LockableSession`] — a per-session façade enforcing two-phase manual
//!   locking over a bucket-keyed lock table, with epoch-protected point
//!   operations routed through a user-supplied [`Functions`] pipeline.
//!
//! ```
//! use seglog::{LockType, LockableKey, Store};
//! # use seglog::{Status, UserValue};
//!
//! struct Blind;
//!
//! impl seglog::Functions for Blind {
//!     type Input = ();
//!     type Output = Vec<u8>;
//!
//!     fn single_reader(&mut self, _key: &[u8], value: &UserValue, output: &mut Vec<u8>) {
//!         output.clear();
//!         output.extend_from_slice(value);
//!     }
//!
//!     fn initial_updater(&mut self, _key: &[u8], _input: &()) -> UserValue {
//!         UserValue::from(&[][..])
//!     }
//!
//!     fn in_place_updater(&mut self, _key: &[u8], _value: &mut UserValue, _input: &()) -> bool {
//!         true
//!     }
//!
//!     fn copy_updater(&mut self, _key: &[u8], old: &UserValue, _input: &()) -> UserValue {
//!         old.clone()
//!     }
//! }
//!
//! let store = Store::new();
//! let mut session = store.lockable_session(Blind);
//!
//! session.begin_lockable()?;
//!
//! let mut keys = [LockableKey::exclusive(Store::lock_code(b"my_key"))];
//! session.lock(&mut keys)?;
//!
//! session.upsert(b"my_key", b"my_value")?;
//!
//! let mut output = Vec::new();
//! assert_eq!(Status::Ok, session.read(b"my_key", &mut output)?);
//! assert_eq!(b"my_value".as_slice(), output);
//!
//! session.unlock(&mut keys)?;
//! session.end_lockable()?;
//! #
//! # Ok::<(), seglog::Error>(())
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod cancel;

pub mod device;

mod error;

#[doc(hidden)]
pub mod hash;

mod human_size;

#[doc(hidden)]
pub mod monotonic;

pub mod session;

pub mod store;

pub use {
    cancel::{with_cancellation, CancellationToken},
    device::{
        DeviceConfig, IoCompletion, SegmentId, SegmentedDevice, StorageDevice,
        ERROR_UNCLASSIFIED, SECTOR_SIZE,
    },
    error::{Error, Result},
    human_size::parse_human_size,
    monotonic::monotonic_update,
    session::{
        functions::Functions,
        lockable_key::{LockType, LockableKey},
        LockableSession,
    },
    store::{Status, Store, UserKey, UserValue},
};
