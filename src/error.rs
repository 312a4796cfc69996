//! Error handling utils.
//!
//! Runtime-internal failures are never rethrown into unrelated fibers. OS
//! errors surface as [`std::io::Error`] values (wrapped in [`Error::Io`] by
//! the manager-level APIs, or returned directly by the cooperative I/O
//! wrappers in [`stream`](crate::stream), which mirror `std::io` signatures).
//! Violated state-machine preconditions are programming errors and panic.

use std::io;
use std::os::unix::io::RawFd;

use crate::io::Direction;

/// A specialized [`Result`] type for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Returned from `schedule` once the scheduler has been told to stop.
    /// Work is never silently dropped.
    #[error("scheduler has been stopped")]
    Stopped,

    /// An event registration already exists for this descriptor/direction
    /// pair. At most one continuation may be parked per direction.
    #[error("event already registered: fd {fd} {direction:?}")]
    EventExists { fd: RawFd, direction: Direction },
}

impl Error {
    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Io(_) => "Io",
            Self::Stopped => "Stopped",
            Self::EventExists { .. } => "EventExists",
        }
    }
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};
