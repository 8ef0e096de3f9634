//! Walks blocks in order and fans out lifecycle events.
//!
//! Per block:
//! 1. emit `BlockBegin` (the sequence validator runs here)
//! 2. derive the block's state transitions
//! 3. emit `StateTransition` for each; on failure emit `StateTransitionError`,
//!    which may answer `IgnoreStateTransition` to skip it
//! 4. fold the block into the reader state, emit `BlockEnd`
//!
//! Any block-level failure is reported through `BlockError`. A handler that
//! answers `Restart { height }` makes the loop start over from `height`;
//! anything else aborts the read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ReaderError, Signal};
use crate::headers::TransitionDeriver;
use crate::mediator::{ReaderEvent, ReaderMediator};
use crate::source::BlockSource;
use crate::types::{Block, StateTransitionHeader};

/// The read loop over a [`BlockSource`].
pub struct BlockchainReader<S> {
    mediator: Arc<ReaderMediator>,
    source: S,
    deriver: Arc<dyn TransitionDeriver>,
    stop: Arc<AtomicBool>,
}

impl<S: BlockSource> BlockchainReader<S> {
    pub fn new(
        mediator: Arc<ReaderMediator>,
        source: S,
        deriver: Arc<dyn TransitionDeriver>,
    ) -> Self {
        Self {
            mediator,
            source,
            deriver,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mediator(&self) -> &Arc<ReaderMediator> {
        &self.mediator
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Flag that stops the loop after the current block's fan-out completes.
    ///
    /// The flag stays set: later reads return before touching the source.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Read from `height` to the end of the source.
    ///
    /// Returns the height of the last block read successfully, or 0.
    pub async fn read(&mut self, height: u64) -> Result<u64, ReaderError> {
        let mut height = height;
        loop {
            match self.try_read(height).await {
                Ok(last_height_read) => return Ok(last_height_read),
                Err(Signal::Restart { height: next }) => {
                    tracing::info!(from = height, to = next, "restarting blockchain reader");
                    height = next;
                }
                Err(signal) => return Err(signal.into()),
            }
        }
    }

    async fn try_read(&mut self, height: u64) -> Result<u64, Signal> {
        self.source.set_height(height)?;

        let mut last_height_read = 0;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                tracing::info!(height = last_height_read, "reader stopped");
                break;
            }
            let Some(block) = self.source.next().await? else {
                break;
            };
            let mut failed_transition = None;
            if let Err(error) = self.read_block(&block, &mut failed_transition).await {
                tracing::warn!(
                    height = block.height,
                    hash = %block.hash,
                    error = %error,
                    "block processing failed"
                );
                self.mediator
                    .emit(ReaderEvent::BlockError {
                        error: error.clone(),
                        block,
                        state_transition: failed_transition,
                    })
                    .await?;
                return Err(error);
            }
            last_height_read = block.height;
        }
        Ok(last_height_read)
    }

    async fn read_block(
        &self,
        block: &Block,
        failed_transition: &mut Option<StateTransitionHeader>,
    ) -> Result<(), Signal> {
        self.mediator
            .emit(ReaderEvent::BlockBegin(block.clone()))
            .await?;

        let transitions = self.deriver.derive(block).await?;
        tracing::debug!(
            height = block.height,
            transitions = transitions.len(),
            "applying block"
        );

        for state_transition in transitions {
            let applied = self
                .mediator
                .emit(ReaderEvent::StateTransition {
                    state_transition: state_transition.clone(),
                    block: block.clone(),
                })
                .await;
            let Err(error) = applied else {
                continue;
            };

            let handled = self
                .mediator
                .emit(ReaderEvent::StateTransitionError {
                    error: error.clone(),
                    block: block.clone(),
                    state_transition: state_transition.clone(),
                })
                .await;
            match handled {
                Err(Signal::IgnoreStateTransition) => {
                    tracing::debug!(
                        height = block.height,
                        state_transition = %state_transition.hash,
                        error = %error,
                        "state transition skipped"
                    );
                    self.mediator
                        .emit(ReaderEvent::StateTransitionSkip {
                            state_transition,
                            block: block.clone(),
                        })
                        .await?;
                }
                Err(other) => {
                    *failed_transition = Some(state_transition);
                    return Err(other);
                }
                Ok(()) => {
                    *failed_transition = Some(state_transition);
                    return Err(error);
                }
            }
        }

        self.mediator.state().add_block(block.clone())?;
        self.mediator.emit(ReaderEvent::BlockEnd(block.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::{EventKind, ReaderEventHandler};
    use crate::rpc::MemoryChain;
    use crate::source::ArrayBlockSource;
    use crate::state::ReaderState;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Derives fixed transitions per height.
    #[derive(Default)]
    struct FixedDeriver(HashMap<u64, Vec<StateTransitionHeader>>);

    #[async_trait]
    impl TransitionDeriver for FixedDeriver {
        async fn derive(&self, block: &Block) -> Result<Vec<StateTransitionHeader>, ReaderError> {
            Ok(self.0.get(&block.height).cloned().unwrap_or_default())
        }
    }

    fn header(hash: &str) -> StateTransitionHeader {
        StateTransitionHeader {
            hash: hash.into(),
            transaction_type: crate::types::TRANSITION_TX_TYPE,
            payload: crate::types::TransitionPayload {
                version: 1,
                reg_tx_id: "user".into(),
                hash_prev_sub_tx: "prev".into(),
                credit_fee: 0,
                hash_st_packet: format!("packet-{hash}"),
            },
        }
    }

    /// Logs events and answers configured signals.
    #[derive(Default)]
    struct Script {
        log: Mutex<Vec<String>>,
        fail_transitions: Vec<String>,
        on_transition_error: Option<Signal>,
        fail_block_begin_once: Mutex<Option<u64>>,
        restart_on_block_error: bool,
        on_block_error: Option<Signal>,
    }

    #[async_trait]
    impl ReaderEventHandler for Script {
        async fn handle(&self, event: &ReaderEvent, _m: &ReaderMediator) -> Result<(), Signal> {
            let entry = match (event.block(), event.state_transition()) {
                (Some(b), Some(st)) => format!("{}:{}:{}", event.kind(), b.height, st.hash),
                (Some(b), None) => format!("{}:{}", event.kind(), b.height),
                _ => event.kind().to_string(),
            };
            self.log.lock().unwrap().push(entry);

            match event {
                ReaderEvent::BlockBegin(block) => {
                    let mut once = self.fail_block_begin_once.lock().unwrap();
                    if *once == Some(block.height) {
                        *once = None;
                        return Err(ReaderError::Other("transient".into()).into());
                    }
                    Ok(())
                }
                ReaderEvent::StateTransition { state_transition, .. }
                    if self.fail_transitions.contains(&state_transition.hash) =>
                {
                    Err(ReaderError::Other("apply failed".into()).into())
                }
                ReaderEvent::StateTransitionError { .. } => match &self.on_transition_error {
                    Some(signal) => Err(signal.clone()),
                    None => Ok(()),
                },
                ReaderEvent::BlockError { block, .. } if self.restart_on_block_error => {
                    Err(Signal::Restart { height: block.height })
                }
                ReaderEvent::BlockError { .. } => match &self.on_block_error {
                    Some(signal) => Err(signal.clone()),
                    None => Ok(()),
                },
                _ => Ok(()),
            }
        }
    }

    const KINDS: [EventKind; 6] = [
        EventKind::BlockBegin,
        EventKind::StateTransition,
        EventKind::StateTransitionError,
        EventKind::StateTransitionSkip,
        EventKind::BlockEnd,
        EventKind::BlockError,
    ];

    fn reader(
        script: Arc<Script>,
        deriver: FixedDeriver,
        blocks: Vec<Block>,
    ) -> BlockchainReader<ArrayBlockSource> {
        let initial = blocks.first().map(|b| b.height).unwrap_or(0);
        let mut mediator = ReaderMediator::new(ReaderState::new(10), initial);
        mediator.on_many(&KINDS, script);
        BlockchainReader::new(
            Arc::new(mediator),
            ArrayBlockSource::new(blocks),
            Arc::new(deriver),
        )
    }

    fn heights(reader: &BlockchainReader<ArrayBlockSource>) -> Vec<u64> {
        reader.mediator().state().blocks().iter().map(|b| b.height).collect()
    }

    #[tokio::test]
    async fn reads_all_blocks_in_order() {
        let script = Arc::new(Script::default());
        let mut deriver = FixedDeriver::default();
        deriver.0.insert(2, vec![header("a"), header("b")]);
        let mut reader = reader(script.clone(), deriver, MemoryChain::linear(1, 3, "x").blocks());

        assert_eq!(reader.read(1).await.unwrap(), 3);
        assert_eq!(heights(&reader), vec![1, 2, 3]);
        assert_eq!(
            *script.log.lock().unwrap(),
            vec![
                "block_begin:1",
                "block_end:1",
                "block_begin:2",
                "state_transition:2:a",
                "state_transition:2:b",
                "block_end:2",
                "block_begin:3",
                "block_end:3",
            ]
        );
    }

    #[tokio::test]
    async fn seeking_past_source_fails_with_invalid_height() {
        let script = Arc::new(Script::default());
        let blocks = MemoryChain::linear(1, 1, "x").blocks();
        let mut reader = reader(script.clone(), FixedDeriver::default(), blocks);

        let err = reader.read(5).await.unwrap_err();
        assert_eq!(err, ReaderError::InvalidHeight { height: 5 });
        assert!(script.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignored_transition_skips_and_folds_block() {
        let script = Arc::new(Script {
            fail_transitions: vec!["a".into()],
            on_transition_error: Some(Signal::IgnoreStateTransition),
            ..Default::default()
        });
        let mut deriver = FixedDeriver::default();
        deriver.0.insert(1, vec![header("a"), header("b")]);
        let mut reader = reader(script.clone(), deriver, MemoryChain::linear(1, 1, "x").blocks());

        assert_eq!(reader.read(1).await.unwrap(), 1);
        let log = script.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "block_begin:1",
                "state_transition:1:a",
                "state_transition_error:1:a",
                "state_transition_skip:1:a",
                "state_transition:1:b",
                "block_end:1",
            ]
        );
        assert_eq!(heights(&reader), vec![1]);
    }

    #[tokio::test]
    async fn unhandled_transition_error_fails_block() {
        let script = Arc::new(Script {
            fail_transitions: vec!["a".into()],
            ..Default::default()
        });
        let mut deriver = FixedDeriver::default();
        deriver.0.insert(2, vec![header("a"), header("b")]);
        let mut reader = reader(script.clone(), deriver, MemoryChain::linear(1, 3, "x").blocks());

        let err = reader.read(1).await.unwrap_err();
        assert_eq!(err, ReaderError::Other("apply failed".into()));
        // block 2 never folded, block 3 never read, transition b abandoned
        assert_eq!(heights(&reader), vec![1]);
        let log = script.log.lock().unwrap().clone();
        assert_eq!(log.last().unwrap(), "block_error:2:a");
        assert!(!log.iter().any(|e| e.ends_with(":b") || e.contains(":3")));
    }

    #[tokio::test]
    async fn transition_error_answered_with_failure_aborts_block() {
        let script = Arc::new(Script {
            fail_transitions: vec!["a".into()],
            on_transition_error: Some(ReaderError::Packet("rejected".into()).into()),
            ..Default::default()
        });
        let mut deriver = FixedDeriver::default();
        deriver.0.insert(2, vec![header("a"), header("b")]);
        let mut reader = reader(script.clone(), deriver, MemoryChain::linear(1, 3, "x").blocks());

        let err = reader.read(1).await.unwrap_err();
        assert_eq!(err, ReaderError::Packet("rejected".into()));
        assert_eq!(heights(&reader), vec![1]);
        let log = script.log.lock().unwrap().clone();
        assert_eq!(
            &log[3..],
            &[
                "state_transition:2:a",
                "state_transition_error:2:a",
                "block_error:2:a",
            ]
        );
    }

    #[tokio::test]
    async fn block_error_answer_is_raised_to_caller() {
        let script = Arc::new(Script {
            fail_transitions: vec!["a".into()],
            on_block_error: Some(ReaderError::Storage("disk full".into()).into()),
            ..Default::default()
        });
        let mut deriver = FixedDeriver::default();
        deriver.0.insert(1, vec![header("a"), header("b")]);
        let mut reader = reader(script.clone(), deriver, MemoryChain::linear(1, 2, "x").blocks());

        let err = reader.read(1).await.unwrap_err();
        assert_eq!(err, ReaderError::Storage("disk full".into()));
        assert!(heights(&reader).is_empty());
        let log = script.log.lock().unwrap().clone();
        assert_eq!(log.last().unwrap(), "block_error:1:a");
        assert!(!log.iter().any(|e| e.ends_with(":b") || e.contains(":2")));
    }

    #[tokio::test]
    async fn restart_signal_rereads_from_height() {
        let script = Arc::new(Script {
            fail_block_begin_once: Mutex::new(Some(2)),
            restart_on_block_error: true,
            ..Default::default()
        });
        let mut reader = reader(
            script.clone(),
            FixedDeriver::default(),
            MemoryChain::linear(1, 3, "x").blocks(),
        );

        assert_eq!(reader.read(1).await.unwrap(), 3);
        assert_eq!(heights(&reader), vec![1, 2, 3]);
        let log = script.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "block_begin:1",
                "block_end:1",
                "block_begin:2",
                "block_error:2",
                "block_begin:2",
                "block_end:2",
                "block_begin:3",
                "block_end:3",
            ]
        );
    }

    #[tokio::test]
    async fn stop_handle_halts_between_blocks() {
        struct Stopper(Arc<AtomicBool>);

        #[async_trait]
        impl ReaderEventHandler for Stopper {
            async fn handle(&self, _e: &ReaderEvent, _m: &ReaderMediator) -> Result<(), Signal> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let blocks = MemoryChain::linear(1, 5, "x").blocks();
        let mut mediator = ReaderMediator::new(ReaderState::new(10), 1);
        let stop = Arc::new(AtomicBool::new(false));
        mediator.on(EventKind::BlockEnd, Arc::new(Stopper(stop.clone())));
        let mut reader = BlockchainReader {
            mediator: Arc::new(mediator),
            source: ArrayBlockSource::new(blocks),
            deriver: Arc::new(FixedDeriver::default()),
            stop,
        };

        assert_eq!(reader.read(1).await.unwrap(), 1);
        // stays stopped
        assert_eq!(reader.read(2).await.unwrap(), 0);
        assert_eq!(heights(&reader), vec![1]);
    }
}
