// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the store core
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// A handle pool, segment table or device was used after disposal
    Disposed,

    /// Violation of the session locking state machine
    InvalidState,

    /// Operation was cancelled through a [`CancellationToken`](crate::CancellationToken)
    Cancelled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SeglogError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Store core result
pub type Result<T> = std::result::Result<T, Error>;
