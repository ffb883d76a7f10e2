// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::AtomicBool,
    mpsc::{Receiver, RecvTimeoutError},
    Arc,
};
use std::time::Duration;

/// Cooperative cancellation flag, cheap to clone and share across threads.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Signals cancellation to everyone holding a clone of this token.
    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Returns whether cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Races a completion channel against a cancellation token.
///
/// On cancellation, surfaces [`Error::Cancelled`](crate::Error::Cancelled)
/// without aborting the work feeding the channel; the producer completes
/// into the void. A disconnected channel (producer dropped without sending)
/// surfaces [`Error::Disposed`](crate::Error::Disposed).
pub fn with_cancellation<T>(rx: &Receiver<T>, token: &CancellationToken) -> crate::Result<T> {
    loop {
        if token.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }

        match rx.recv_timeout(Duration::from_millis(1)) {
            Ok(item) => return Ok(item),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err(crate::Error::Disposed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn completes_when_not_cancelled() -> crate::Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        let token = CancellationToken::default();

        std::thread::spawn(move || {
            tx.send(42u32).ok();
        });

        assert_eq!(42, with_cancellation(&rx, &token)?);

        Ok(())
    }

    #[test]
    fn surfaces_cancellation() {
        let (tx, rx) = std::sync::mpsc::channel::<u32>();
        let token = CancellationToken::default();
        token.cancel();

        assert!(matches!(
            with_cancellation(&rx, &token),
            Err(crate::Error::Cancelled)
        ));

        // the producer may still complete into the void
        tx.send(1).ok();
    }

    #[test]
    fn dropped_producer_is_disposed() {
        let (tx, rx) = std::sync::mpsc::channel::<u32>();
        drop(tx);

        assert!(matches!(
            with_cancellation(&rx, &CancellationToken::default()),
            Err(crate::Error::Disposed)
        ));
    }
}
