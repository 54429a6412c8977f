//! Error handling
//!
//! Errors fall in two groups. Protocol errors (`InvalidGroupSize`, `NoActiveGroup`, ...) are
//! deterministic on every rank and are resolved into outcomes by the coordinator without
//! breaking the collective call sequence. Transport errors are fatal to the run: once a
//! collective fails on one rank the remaining ranks can no longer be kept in lockstep.

use thiserror::Error;

use crate::topology::Rank;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the harness
#[derive(Error, Debug)]
pub enum Error {
    /// A test requested a group size outside of `1..=available`
    #[error("np ({requested}) must be between 1 and the total amount of mpi ranks ({available})")]
    InvalidGroupSize {
        /// The size declared by the test
        requested: i64,
        /// Size of the parent group
        available: Rank,
    },

    /// The communication group was requested outside of an active test
    #[error("no active communication group for this rank")]
    NoActiveGroup,

    /// The communication group was already handed out for this invocation
    #[error("the communication group was already taken for this invocation")]
    GroupAlreadyTaken,

    /// A group lease for this test is still held
    #[error("test `{0}` already holds a communication group")]
    GroupAlreadyHeld(String),

    /// Predefined groups (e.g. the world group) cannot be freed
    #[error("predefined communication groups cannot be freed")]
    PredefinedGroup,

    /// A rank of an in-process universe panicked outside of a test body
    #[error("rank {0} panicked")]
    RankPanicked(usize),

    /// Outcome (de)serialization failed
    #[error("could not encode rank outcome: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The collective transport reported a failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Unrecognized value for the run mode
    #[error("invalid run mode `{0}`, expected `mpi` or `ordinary`")]
    InvalidRunMode(String),
}

impl Error {
    /// Whether the error is a per-test protocol error that leaves the transport usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidGroupSize { .. } | Error::NoActiveGroup | Error::GroupAlreadyTaken
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_group_size_message_names_both_sizes() {
        let err = Error::InvalidGroupSize {
            requested: 5,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "np (5) must be between 1 and the total amount of mpi ranks (3)"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn transport_errors_are_fatal() {
        assert!(!Error::Transport("lost".into()).is_recoverable());
        assert!(!Error::PredefinedGroup.is_recoverable());
    }
}
