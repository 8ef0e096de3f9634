//! Block sequence validation and reorg recovery.
//!
//! The validator runs on `BlockBegin`, before a block is folded into the
//! reader state, and classifies the block against the last synced one:
//!
//! 1. **Unverifiable**: no overlap with the synced window. Recovery resets
//!    the reader and restarts from the initial block height.
//! 2. **Wrong sequence**: the parent hash does not match. Recovery rolls back
//!    the last synced block (orphaning it and its transitions, newest first)
//!    and restarts one block lower.
//!
//! Recovery runs when the classification error comes back through
//! `BlockError`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Signal;
use crate::headers::TransitionDeriver;
use crate::mediator::{EventKind, ReaderEvent, ReaderEventHandler, ReaderMediator};
use crate::state::ReaderState;
use crate::types::Block;

/// Classify `current` against the synced window.
pub fn validate_sequence(
    state: &ReaderState,
    initial_block_height: u64,
    current: &Block,
) -> Result<(), Signal> {
    let Some(previous) = state.last_block() else {
        if current.height != initial_block_height {
            return Err(Signal::NotAbleToValidateSequence {
                height: current.height,
                first_synced_block_height: state.first_block_height(),
            });
        }
        return Ok(());
    };

    if current.height <= state.first_block_height() {
        return Err(Signal::NotAbleToValidateSequence {
            height: current.height,
            first_synced_block_height: state.first_block_height(),
        });
    }

    if let Some(parent) = &current.previous_block_hash {
        if *parent != previous.hash {
            return Err(Signal::WrongSequence {
                height: current.height,
                previous_block_hash: parent.clone(),
                last_synced_hash: previous.hash.clone(),
            });
        }
    }

    Ok(())
}

/// Mediator subscriber that guards block continuity.
pub struct SequenceValidator {
    deriver: Arc<dyn TransitionDeriver>,
}

impl SequenceValidator {
    pub fn new(deriver: Arc<dyn TransitionDeriver>) -> Self {
        Self { deriver }
    }

    /// Subscribe to `BlockBegin` and `BlockError`.
    pub fn attach(self: Arc<Self>, mediator: &mut ReaderMediator) {
        mediator.on_many(&[EventKind::BlockBegin, EventKind::BlockError], self);
    }

    async fn recover(
        &self,
        error: &Signal,
        current: &Block,
        mediator: &ReaderMediator,
    ) -> Result<(), Signal> {
        match error {
            Signal::NotAbleToValidateSequence {
                height,
                first_synced_block_height,
            } => {
                tracing::warn!(
                    height,
                    first_synced_block_height,
                    initial_block_height = mediator.initial_block_height(),
                    "block sequence cannot be validated, resetting"
                );
                mediator
                    .emit(ReaderEvent::BlockSequenceValidationImpossible {
                        height: *height,
                        first_synced_block_height: *first_synced_block_height,
                    })
                    .await?;
                mediator.reset().await?;
                Err(Signal::Restart {
                    height: mediator.initial_block_height(),
                })
            }
            Signal::WrongSequence { .. } => self.roll_back(current, mediator).await,
            _ => Ok(()),
        }
    }

    /// Drop the last synced block and orphan its transitions.
    ///
    /// When the dropped block is at or above `current`, the restart stays at
    /// `current.height`; a parent still conflicting there is rolled back on
    /// the next pass, so deeper reorgs converge one block at a time.
    async fn roll_back(&self, current: &Block, mediator: &ReaderMediator) -> Result<(), Signal> {
        let last = mediator.state().last_block().cloned();
        let Some(last) = last else {
            return Ok(());
        };

        // more history is needed before deciding what to drop
        if current.height > last.height + 1 {
            tracing::debug!(
                height = current.height,
                last_synced = last.height,
                "sequence gap, reading missing blocks first"
            );
            return Err(Signal::Restart {
                height: last.height + 1,
            });
        }

        // derive first: a failure here must leave the state untouched
        let transitions = self.deriver.derive(&last).await?;

        mediator.state().remove_last_block();
        tracing::warn!(
            height = last.height,
            hash = %last.hash,
            replaced_by = current.height,
            "reorg detected, orphaning block"
        );

        mediator
            .emit(ReaderEvent::BlockOrphaned(last.clone()))
            .await?;
        for state_transition in transitions.into_iter().rev() {
            mediator
                .emit(ReaderEvent::StateTransitionOrphaned {
                    state_transition,
                    block: last.clone(),
                })
                .await?;
        }

        let next_height = if last.height >= current.height {
            current.height
        } else {
            current.height - 1
        };
        Err(Signal::Restart {
            height: next_height,
        })
    }
}

#[async_trait]
impl ReaderEventHandler for SequenceValidator {
    async fn handle(&self, event: &ReaderEvent, mediator: &ReaderMediator) -> Result<(), Signal> {
        match event {
            ReaderEvent::BlockBegin(block) => {
                let state = mediator.state();
                validate_sequence(&state, mediator.initial_block_height(), block)
            }
            ReaderEvent::BlockError { error, block, .. } => {
                self.recover(error, block, mediator).await
            }
            _ => Ok(()),
        }
    }
}
