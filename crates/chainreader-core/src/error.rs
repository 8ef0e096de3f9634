//! Error and control-flow types for the reader pipeline.
//!
//! Two disjoint classes:
//! - [`ReaderError`]: genuine failures (RPC, storage, malformed state). They
//!   abort the current sync attempt.
//! - [`Signal`]: the closed set of control-flow outcomes that event handlers
//!   return to steer the read loop. Only the reader and the sequence validator
//!   interpret them; adding a variant means updating both match sites.

use thiserror::Error;

/// Errors that abort a read or sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReaderError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid block height {height}")]
    InvalidHeight { height: u64 },

    #[error("Block {actual} does not follow the current block (expected height {expected})")]
    BlockSequence { expected: u64, actual: u64 },

    #[error("Packet error: {0}")]
    Packet(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unhandled reader signal: {0}")]
    UnhandledSignal(String),

    #[error("{0}")]
    Other(String),
}

impl ReaderError {
    /// Returns `true` if the node reported a height it does not have.
    pub fn is_invalid_height(&self) -> bool {
        matches!(self, Self::InvalidHeight { .. })
    }
}

/// Outcome raised by an event handler.
///
/// Every variant except [`Signal::Failure`] is a control-flow signal that is
/// never shown to an end user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Signal {
    /// Restart the whole read loop from `height`.
    #[error("restart blockchain reader from height {height}")]
    Restart { height: u64 },

    /// Skip the failed state transition and continue with the next one.
    #[error("ignore state transition")]
    IgnoreStateTransition,

    /// Block continuity cannot be verified against the synced window.
    #[error("not able to validate sequence of block {height} (first synced block {first_synced_block_height})")]
    NotAbleToValidateSequence {
        height: u64,
        first_synced_block_height: u64,
    },

    /// The block's parent hash does not match the last synced block.
    #[error("wrong sequence at block {height}: previous block hash {previous_block_hash}, last synced {last_synced_hash}")]
    WrongSequence {
        height: u64,
        previous_block_hash: String,
        last_synced_hash: String,
    },

    #[error(transparent)]
    Failure(#[from] ReaderError),
}

impl Signal {
    /// Returns the restart height if this is a restart signal.
    pub fn restart_height(&self) -> Option<u64> {
        match self {
            Self::Restart { height } => Some(*height),
            _ => None,
        }
    }
}

impl From<Signal> for ReaderError {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Failure(err) => err,
            other => ReaderError::UnhandledSignal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_unwraps_into_reader_error() {
        let signal = Signal::from(ReaderError::Rpc("connection refused".into()));
        assert_eq!(
            ReaderError::from(signal),
            ReaderError::Rpc("connection refused".into())
        );
    }

    #[test]
    fn stray_signal_becomes_unhandled() {
        let err = ReaderError::from(Signal::IgnoreStateTransition);
        assert!(matches!(err, ReaderError::UnhandledSignal(_)));
        assert_eq!(Signal::Restart { height: 7 }.restart_height(), Some(7));
        assert_eq!(Signal::IgnoreStateTransition.restart_height(), None);
    }
}
