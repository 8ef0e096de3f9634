//! An ordered, awaited event bus bound to one reader state.
//!
//! Handlers for an event run in registration order and every emit waits for
//! all of them (and anything they await) before returning. The first handler
//! error stops the fan-out and is returned to the emitter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::Signal;
use crate::state::ReaderState;
use crate::types::{Block, StateTransitionHeader};

/// Discriminant of [`ReaderEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Begin,
    BlockBegin,
    StateTransition,
    StateTransitionError,
    StateTransitionSkip,
    StateTransitionStale,
    StateTransitionOrphaned,
    BlockEnd,
    BlockError,
    BlockStale,
    BlockOrphaned,
    BlockSequenceValidationImpossible,
    OutOfBounds,
    FullySynced,
    End,
    Reset,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Begin => "begin",
            Self::BlockBegin => "block_begin",
            Self::StateTransition => "state_transition",
            Self::StateTransitionError => "state_transition_error",
            Self::StateTransitionSkip => "state_transition_skip",
            Self::StateTransitionStale => "state_transition_stale",
            Self::StateTransitionOrphaned => "state_transition_orphaned",
            Self::BlockEnd => "block_end",
            Self::BlockError => "block_error",
            Self::BlockStale => "block_stale",
            Self::BlockOrphaned => "block_orphaned",
            Self::BlockSequenceValidationImpossible => "block_sequence_validation_impossible",
            Self::OutOfBounds => "out_of_bounds",
            Self::FullySynced => "fully_synced",
            Self::End => "end",
            Self::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Lifecycle events emitted while reading the chain.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    /// Read loop starting at `height`.
    Begin { height: u64 },
    /// About to derive and apply the block's state transitions.
    BlockBegin(Block),
    StateTransition {
        state_transition: StateTransitionHeader,
        block: Block,
    },
    StateTransitionError {
        error: Signal,
        block: Block,
        state_transition: StateTransitionHeader,
    },
    StateTransitionSkip {
        state_transition: StateTransitionHeader,
        block: Block,
    },
    StateTransitionStale {
        state_transition: StateTransitionHeader,
        block: Block,
    },
    StateTransitionOrphaned {
        state_transition: StateTransitionHeader,
        block: Block,
    },
    /// Block fully applied and folded into the reader state.
    BlockEnd(Block),
    BlockError {
        error: Signal,
        block: Block,
        state_transition: Option<StateTransitionHeader>,
    },
    BlockStale(Block),
    BlockOrphaned(Block),
    BlockSequenceValidationImpossible {
        height: u64,
        first_synced_block_height: u64,
    },
    OutOfBounds {
        initial_block_height: u64,
        current_block_count: u64,
    },
    FullySynced { current_block_count: u64 },
    End { last_height_read: u64 },
    /// Drop all derived state for this indexing scope.
    Reset,
}

impl ReaderEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Begin { .. } => EventKind::Begin,
            Self::BlockBegin(_) => EventKind::BlockBegin,
            Self::StateTransition { .. } => EventKind::StateTransition,
            Self::StateTransitionError { .. } => EventKind::StateTransitionError,
            Self::StateTransitionSkip { .. } => EventKind::StateTransitionSkip,
            Self::StateTransitionStale { .. } => EventKind::StateTransitionStale,
            Self::StateTransitionOrphaned { .. } => EventKind::StateTransitionOrphaned,
            Self::BlockEnd(_) => EventKind::BlockEnd,
            Self::BlockError { .. } => EventKind::BlockError,
            Self::BlockStale(_) => EventKind::BlockStale,
            Self::BlockOrphaned(_) => EventKind::BlockOrphaned,
            Self::BlockSequenceValidationImpossible { .. } => {
                EventKind::BlockSequenceValidationImpossible
            }
            Self::OutOfBounds { .. } => EventKind::OutOfBounds,
            Self::FullySynced { .. } => EventKind::FullySynced,
            Self::End { .. } => EventKind::End,
            Self::Reset => EventKind::Reset,
        }
    }

    /// The block this event concerns, if any.
    pub fn block(&self) -> Option<&Block> {
        match self {
            Self::BlockBegin(block)
            | Self::BlockEnd(block)
            | Self::BlockStale(block)
            | Self::BlockOrphaned(block) => Some(block),
            Self::StateTransition { block, .. }
            | Self::StateTransitionError { block, .. }
            | Self::StateTransitionSkip { block, .. }
            | Self::StateTransitionStale { block, .. }
            | Self::StateTransitionOrphaned { block, .. }
            | Self::BlockError { block, .. } => Some(block),
            _ => None,
        }
    }

    /// The state transition this event concerns, if any.
    pub fn state_transition(&self) -> Option<&StateTransitionHeader> {
        match self {
            Self::StateTransition { state_transition, .. }
            | Self::StateTransitionError { state_transition, .. }
            | Self::StateTransitionSkip { state_transition, .. }
            | Self::StateTransitionStale { state_transition, .. }
            | Self::StateTransitionOrphaned { state_transition, .. } => Some(state_transition),
            Self::BlockError { state_transition, .. } => state_transition.as_ref(),
            _ => None,
        }
    }
}

/// Trait for mediator subscribers.
///
/// Handlers receive the mediator so they can inspect or roll back the reader
/// state, emit follow-up events, or request a reset.
#[async_trait]
pub trait ReaderEventHandler: Send + Sync {
    async fn handle(&self, event: &ReaderEvent, mediator: &ReaderMediator) -> Result<(), Signal>;
}

/// Ordered event bus owning the reader state.
pub struct ReaderMediator {
    state: Mutex<ReaderState>,
    initial_block_height: u64,
    handlers: HashMap<EventKind, Vec<Arc<dyn ReaderEventHandler>>>,
}

impl ReaderMediator {
    pub fn new(state: ReaderState, initial_block_height: u64) -> Self {
        Self {
            state: Mutex::new(state),
            initial_block_height,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for one event kind. Handlers run in registration order.
    pub fn on(&mut self, kind: EventKind, handler: Arc<dyn ReaderEventHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Register `handler` for several event kinds.
    pub fn on_many(&mut self, kinds: &[EventKind], handler: Arc<dyn ReaderEventHandler>) {
        for kind in kinds {
            self.on(*kind, handler.clone());
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Lock the reader state.
    ///
    /// The guard must be dropped before the next `.await`.
    pub fn state(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn initial_block_height(&self) -> u64 {
        self.initial_block_height
    }

    /// Dispatch `event` to its handlers one after another.
    pub async fn emit(&self, event: ReaderEvent) -> Result<(), Signal> {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            return Ok(());
        };
        for handler in handlers {
            handler.handle(&event, self).await?;
        }
        Ok(())
    }

    /// Clear the reader state, then tell subscribers to drop derived state.
    pub async fn reset(&self) -> Result<(), Signal> {
        self.state().clear();
        tracing::info!(
            initial_block_height = self.initial_block_height,
            "reader state reset"
        );
        self.emit(ReaderEvent::Reset).await
    }
}
