//! Event logging subscriber.

use async_trait::async_trait;

use crate::error::Signal;
use crate::mediator::{EventKind, ReaderEvent, ReaderEventHandler, ReaderMediator};

/// Every event kind, in emission order within a read.
pub const ALL_EVENT_KINDS: [EventKind; 16] = [
    EventKind::Begin,
    EventKind::BlockBegin,
    EventKind::StateTransition,
    EventKind::StateTransitionError,
    EventKind::StateTransitionSkip,
    EventKind::StateTransitionStale,
    EventKind::StateTransitionOrphaned,
    EventKind::BlockEnd,
    EventKind::BlockError,
    EventKind::BlockStale,
    EventKind::BlockOrphaned,
    EventKind::BlockSequenceValidationImpossible,
    EventKind::OutOfBounds,
    EventKind::FullySynced,
    EventKind::End,
    EventKind::Reset,
];

/// Logs every mediator event through `tracing`.
#[derive(Debug, Default)]
pub struct EventLogger;

impl EventLogger {
    pub fn attach(self: std::sync::Arc<Self>, mediator: &mut ReaderMediator) {
        mediator.on_many(&ALL_EVENT_KINDS, self);
    }
}

#[async_trait]
impl ReaderEventHandler for EventLogger {
    async fn handle(&self, event: &ReaderEvent, _mediator: &ReaderMediator) -> Result<(), Signal> {
        match event {
            ReaderEvent::Begin { height } => tracing::info!(height, "sync started"),
            ReaderEvent::End { last_height_read } => {
                tracing::info!(last_height_read, "sync finished")
            }
            ReaderEvent::FullySynced {
                current_block_count,
            } => tracing::info!(current_block_count, "already fully synced"),
            ReaderEvent::OutOfBounds {
                initial_block_height,
                current_block_count,
            } => tracing::warn!(
                initial_block_height,
                current_block_count,
                "initial block height is above the chain tip"
            ),
            ReaderEvent::BlockSequenceValidationImpossible {
                height,
                first_synced_block_height,
            } => tracing::warn!(height, first_synced_block_height, "block sequence validation impossible"),
            ReaderEvent::Reset => tracing::warn!("reader reset"),
            ReaderEvent::BlockError {
                error,
                block,
                state_transition,
            } => tracing::warn!(
                height = block.height,
                hash = %block.hash,
                state_transition = state_transition.as_ref().map(|st| st.hash.as_str()),
                error = %error,
                "block error"
            ),
            ReaderEvent::StateTransitionError {
                error,
                block,
                state_transition,
            } => tracing::warn!(
                height = block.height,
                state_transition = %state_transition.hash,
                error = %error,
                "state transition error"
            ),
            ReaderEvent::BlockStale(block) | ReaderEvent::BlockOrphaned(block) => {
                tracing::warn!(height = block.height, hash = %block.hash, event = %event.kind(), "block rolled back")
            }
            other => {
                let height = other.block().map(|b| b.height);
                let state_transition = other.state_transition().map(|st| st.hash.as_str());
                tracing::debug!(event = %other.kind(), ?height, ?state_transition, "reader event");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MemoryChain;
    use crate::state::ReaderState;
    use std::sync::Arc;

    #[tokio::test]
    async fn subscribes_to_every_kind_and_never_fails() {
        let mut mediator = ReaderMediator::new(ReaderState::new(4), 1);
        Arc::new(EventLogger).attach(&mut mediator);
        for kind in ALL_EVENT_KINDS {
            assert_eq!(mediator.handler_count(kind), 1);
        }

        let block = MemoryChain::block(1, "a", "a");
        let events = [
            ReaderEvent::Begin { height: 1 },
            ReaderEvent::BlockBegin(block.clone()),
            ReaderEvent::BlockOrphaned(block.clone()),
            ReaderEvent::BlockError {
                error: Signal::IgnoreStateTransition,
                block,
                state_transition: None,
            },
            ReaderEvent::End { last_height_read: 1 },
        ];
        for event in events {
            mediator.emit(event).await.unwrap();
        }
    }
}
