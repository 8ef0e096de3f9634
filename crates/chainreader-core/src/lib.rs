//! chainreader-core — ordered, reorg-safe reading of a blockchain's state transitions.
//!
//! # Architecture
//!
//! ```text
//! SyncDriver → BlockchainReader
//!                  ├── BlockSource        (array / node hash chain)
//!                  ├── TransitionDeriver  (block → state-transition headers)
//!                  └── ReaderMediator     (ordered, awaited event fan-out)
//!                        ├── ReaderState        (bounded window of synced blocks)
//!                        ├── SequenceValidator  (parent-hash checks, rollback)
//!                        ├── StateViewProjection (revision-chain apply / revert)
//!                        ├── PacketPinner       (packet pin / unpin)
//!                        ├── SnapshotPersister  (resume across restarts)
//!                        └── EventLogger
//! ```

pub mod applier;
pub mod config;
pub mod error;
pub mod headers;
pub mod logger;
pub mod mediator;
pub mod query;
pub mod reader;
pub mod revision;
pub mod rpc;
pub mod sequence;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod sync;
pub mod types;

pub use applier::{MemoryPacketStore, PacketPinner, PacketStore, StateViewApplier, StateViewProjection};
pub use config::{ReaderConfig, ReaderConfigBuilder};
pub use error::{ReaderError, Signal};
pub use headers::{HeaderExtractor, RpcTransitionDeriver, TransitionDeriver};
pub use logger::EventLogger;
pub use mediator::{EventKind, ReaderEvent, ReaderEventHandler, ReaderMediator};
pub use query::{QueryOptions, SortOrder};
pub use reader::BlockchainReader;
pub use revision::{
    EntityKind, EntityRepository, MemoryEntityRepository, RevertOutcome, RevisionChain,
    StateTransitionApplier, StateViewEntity,
};
pub use rpc::{BlockchainRpc, MemoryChain};
pub use sequence::SequenceValidator;
pub use snapshot::{MemoryReaderStateRepository, ReaderStateRepository, ReaderStateSnapshot, SnapshotPersister};
pub use source::{ArrayBlockSource, BlockSource, RpcBlockSource};
pub use state::ReaderState;
pub use sync::{SyncDriver, SyncOutcome};
pub use types::{Block, Reference, StPacket, StateTransitionHeader};
