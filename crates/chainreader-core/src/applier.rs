//! Routes state-transition packets into the contract and object revision
//! chains, and keeps packet content pinned while it is live.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{ReaderError, Signal};
use crate::mediator::{EventKind, ReaderEvent, ReaderEventHandler, ReaderMediator};
use crate::revision::{RevertOutcome, RevisionChain, StateTransitionApplier};
use crate::rpc::BlockchainRpc;
use crate::types::{Block, EntityPayload, Reference, StPacket, StateTransitionHeader};

/// Content-addressable packet store.
#[async_trait]
pub trait PacketStore: Send + Sync {
    /// Store `packet` and return its content id.
    async fn put(&self, packet: &StPacket) -> Result<String, ReaderError>;

    async fn get(&self, content_id: &str) -> Result<Option<StPacket>, ReaderError>;

    async fn pin(&self, content_id: &str) -> Result<(), ReaderError>;

    async fn unpin(&self, content_id: &str) -> Result<(), ReaderError>;

    async fn unpin_all(&self) -> Result<(), ReaderError>;
}

/// [`StateTransitionApplier`] that projects packets into contracts and objects.
pub struct StateViewApplier {
    rpc: Arc<dyn BlockchainRpc>,
    packets: Arc<dyn PacketStore>,
    contracts: RevisionChain,
    objects: RevisionChain,
}

impl StateViewApplier {
    pub fn new(
        rpc: Arc<dyn BlockchainRpc>,
        packets: Arc<dyn PacketStore>,
        contracts: RevisionChain,
        objects: RevisionChain,
    ) -> Self {
        Self {
            rpc,
            packets,
            contracts,
            objects,
        }
    }

    pub fn contracts(&self) -> &RevisionChain {
        &self.contracts
    }

    pub fn objects(&self) -> &RevisionChain {
        &self.objects
    }

    /// Undo everything `state_transition_hash` wrote to either projection.
    pub async fn revert(
        &self,
        state_transition_hash: &str,
    ) -> Result<Vec<RevertOutcome>, ReaderError> {
        let mut outcomes = self.contracts.revert(state_transition_hash, self).await?;
        outcomes.extend(self.objects.revert(state_transition_hash, self).await?);
        Ok(outcomes)
    }

    /// Drop both projections.
    pub async fn clear(&self) -> Result<(), ReaderError> {
        self.contracts.repository().delete_all().await?;
        self.objects.repository().delete_all().await
    }

    async fn packet(&self, header: &StateTransitionHeader) -> Result<StPacket, ReaderError> {
        let content_id = header.packet_content_id();
        self.packets.get(content_id).await?.ok_or_else(|| {
            ReaderError::Packet(format!(
                "packet {content_id} of state transition {} not found",
                header.hash
            ))
        })
    }

    fn reference(header: &StateTransitionHeader, block: &Block, payload: &EntityPayload) -> Reference {
        Reference {
            block_hash: block.hash.clone(),
            block_height: block.height,
            state_transition_hash: header.hash.clone(),
            packet_hash: header.packet_content_id().to_string(),
            object_hash: payload.hash(),
        }
    }
}

#[async_trait]
impl StateTransitionApplier for StateViewApplier {
    async fn apply(
        &self,
        state_transition: &StateTransitionHeader,
        block: &Block,
    ) -> Result<(), ReaderError> {
        let packet = self.packet(state_transition).await?;
        for payload in &packet.contracts {
            let reference = Self::reference(state_transition, block, payload);
            self.contracts.apply(reference, payload, false).await?;
        }
        for payload in &packet.objects {
            let reference = Self::reference(state_transition, block, payload);
            self.objects.apply(reference, payload, false).await?;
        }
        Ok(())
    }

    async fn apply_from_reference(
        &self,
        reference: &Reference,
        is_revert: bool,
    ) -> Result<(), ReaderError> {
        let block = self.rpc.get_block(&reference.block_hash).await?;
        let raw = self
            .rpc
            .get_raw_transaction(&reference.state_transition_hash)
            .await?;
        let header = StateTransitionHeader::from_bytes(&raw)
            .map_err(|e| ReaderError::Packet(format!("{}: {e}", reference.state_transition_hash)))?;
        let packet = self.packet(&header).await?;

        let contract = packet
            .contracts
            .iter()
            .find(|p| p.hash() == reference.object_hash);
        if let Some(payload) = contract {
            let reference = Self::reference(&header, &block, payload);
            return self.contracts.apply(reference, payload, is_revert).await;
        }

        let object = packet
            .objects
            .iter()
            .find(|p| p.hash() == reference.object_hash);
        if let Some(payload) = object {
            let reference = Self::reference(&header, &block, payload);
            return self.objects.apply(reference, payload, is_revert).await;
        }

        Err(ReaderError::Packet(format!(
            "object {} not found in packet {}",
            reference.object_hash, reference.packet_hash
        )))
    }
}

/// Mediator subscriber that keeps the projections in step with the chain.
pub struct StateViewProjection {
    applier: Arc<StateViewApplier>,
}

impl StateViewProjection {
    pub fn new(applier: Arc<StateViewApplier>) -> Self {
        Self { applier }
    }

    pub fn attach(self: Arc<Self>, mediator: &mut ReaderMediator) {
        mediator.on_many(
            &[
                EventKind::StateTransition,
                EventKind::StateTransitionStale,
                EventKind::StateTransitionOrphaned,
                EventKind::Reset,
            ],
            self,
        );
    }
}

#[async_trait]
impl ReaderEventHandler for StateViewProjection {
    async fn handle(&self, event: &ReaderEvent, _mediator: &ReaderMediator) -> Result<(), Signal> {
        match event {
            ReaderEvent::StateTransition {
                state_transition,
                block,
            } => self.applier.apply(state_transition, block).await?,
            ReaderEvent::StateTransitionStale {
                state_transition, ..
            }
            | ReaderEvent::StateTransitionOrphaned {
                state_transition, ..
            } => {
                let outcomes = self.applier.revert(&state_transition.hash).await?;
                tracing::info!(
                    state_transition = %state_transition.hash,
                    entities = outcomes.len(),
                    "state transition reverted"
                );
            }
            ReaderEvent::Reset => self.applier.clear().await?,
            _ => {}
        }
        Ok(())
    }
}

/// Mediator subscriber that pins packets of live state transitions.
pub struct PacketPinner {
    packets: Arc<dyn PacketStore>,
}

impl PacketPinner {
    pub fn new(packets: Arc<dyn PacketStore>) -> Self {
        Self { packets }
    }

    pub fn attach(self: Arc<Self>, mediator: &mut ReaderMediator) {
        mediator.on_many(
            &[
                EventKind::StateTransition,
                EventKind::StateTransitionStale,
                EventKind::StateTransitionOrphaned,
                EventKind::Reset,
            ],
            self,
        );
    }
}

#[async_trait]
impl ReaderEventHandler for PacketPinner {
    async fn handle(&self, event: &ReaderEvent, _mediator: &ReaderMediator) -> Result<(), Signal> {
        match event {
            ReaderEvent::StateTransition {
                state_transition, ..
            } => {
                self.packets
                    .pin(state_transition.packet_content_id())
                    .await?
            }
            ReaderEvent::StateTransitionStale {
                state_transition, ..
            }
            | ReaderEvent::StateTransitionOrphaned {
                state_transition, ..
            } => {
                self.packets
                    .unpin(state_transition.packet_content_id())
                    .await?
            }
            ReaderEvent::Reset => self.packets.unpin_all().await?,
            _ => {}
        }
        Ok(())
    }
}

// ─── In-memory packet store (for testing) ─────────────────────────────────────

#[derive(Default)]
struct PacketData {
    packets: HashMap<String, StPacket>,
    pinned: HashSet<String>,
}

/// In-memory packet store for tests and ephemeral readers.
#[derive(Default)]
pub struct MemoryPacketStore {
    data: Mutex<PacketData>,
}

impl MemoryPacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pinned(&self, content_id: &str) -> bool {
        self.lock().pinned.contains(content_id)
    }

    pub fn pinned_count(&self) -> usize {
        self.lock().pinned.len()
    }

    fn lock(&self) -> MutexGuard<'_, PacketData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PacketStore for MemoryPacketStore {
    async fn put(&self, packet: &StPacket) -> Result<String, ReaderError> {
        let content_id = packet.content_id();
        self.lock().packets.insert(content_id.clone(), packet.clone());
        Ok(content_id)
    }

    async fn get(&self, content_id: &str) -> Result<Option<StPacket>, ReaderError> {
        Ok(self.lock().packets.get(content_id).cloned())
    }

    async fn pin(&self, content_id: &str) -> Result<(), ReaderError> {
        let mut data = self.lock();
        if !data.packets.contains_key(content_id) {
            return Err(ReaderError::Packet(format!("cannot pin unknown packet {content_id}")));
        }
        data.pinned.insert(content_id.to_string());
        Ok(())
    }

    async fn unpin(&self, content_id: &str) -> Result<(), ReaderError> {
        self.lock().pinned.remove(content_id);
        Ok(())
    }

    async fn unpin_all(&self) -> Result<(), ReaderError> {
        self.lock().pinned.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{EntityKind, EntityRepository, MemoryEntityRepository};
    use crate::rpc::MemoryChain;
    use crate::state::ReaderState;
    use crate::types::EntityAction;
    use serde_json::json;

    struct Fixture {
        chain: Arc<MemoryChain>,
        packets: Arc<MemoryPacketStore>,
        contracts: Arc<MemoryEntityRepository>,
        objects: Arc<MemoryEntityRepository>,
        applier: Arc<StateViewApplier>,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MemoryChain::linear(1, 3, "a"));
        let packets = Arc::new(MemoryPacketStore::new());
        let contracts = Arc::new(MemoryEntityRepository::new(EntityKind::Contract));
        let objects = Arc::new(MemoryEntityRepository::new(EntityKind::Object));
        let applier = Arc::new(StateViewApplier::new(
            chain.clone(),
            packets.clone(),
            RevisionChain::new(contracts.clone()),
            RevisionChain::new(objects.clone()),
        ));
        Fixture {
            chain,
            packets,
            contracts,
            objects,
            applier,
        }
    }

    fn entry(id: &str, action: EntityAction, revision: u64, data: serde_json::Value) -> EntityPayload {
        EntityPayload {
            id: id.into(),
            owner_id: "user".into(),
            action,
            revision,
            data,
        }
    }

    /// Store `packet`, record its transition at `height`, return the header.
    async fn publish(fx: &Fixture, txid: &str, height: u64, packet: StPacket) -> StateTransitionHeader {
        let content_id = fx.packets.put(&packet).await.unwrap();
        let raw = serde_json::to_vec(&json!({
            "txid": txid,
            "type": 12,
            "extraPayload": {
                "version": 1,
                "regTxId": "user",
                "hashPrevSubTx": "prev",
                "creditFee": 0,
                "hashSTPacket": content_id
            }
        }))
        .unwrap();
        fx.chain.add_transaction(height, txid, raw.clone());
        StateTransitionHeader::from_bytes(&raw).unwrap()
    }

    #[tokio::test]
    async fn projects_and_reverts_through_events() {
        let fx = fixture();
        let mut mediator = ReaderMediator::new(ReaderState::new(10), 1);
        Arc::new(StateViewProjection::new(fx.applier.clone())).attach(&mut mediator);
        Arc::new(PacketPinner::new(fx.packets.clone())).attach(&mut mediator);

        let create = StPacket {
            contracts: vec![entry("dpc", EntityAction::Create, 1, json!({"schema": 1}))],
            objects: vec![entry("obj", EntityAction::Create, 1, json!({"v": 1}))],
        };
        let update = StPacket {
            contracts: vec![],
            objects: vec![entry("obj", EntityAction::Update, 2, json!({"v": 2}))],
        };
        let st1 = publish(&fx, "st1", 1, create).await;
        let st2 = publish(&fx, "st2", 2, update).await;
        let b1 = fx.chain.block_at(1).unwrap();
        let b2 = fx.chain.block_at(2).unwrap();

        for (st, block) in [(&st1, &b1), (&st2, &b2)] {
            mediator
                .emit(ReaderEvent::StateTransition {
                    state_transition: st.clone(),
                    block: block.clone(),
                })
                .await
                .unwrap();
        }
        let obj = fx.objects.find("obj").await.unwrap().unwrap();
        assert_eq!(obj.revision, 2);
        assert_eq!(obj.reference.block_hash, "a-2");
        assert!(fx.packets.is_pinned(st2.packet_content_id()));

        mediator
            .emit(ReaderEvent::StateTransitionOrphaned {
                state_transition: st2.clone(),
                block: b2,
            })
            .await
            .unwrap();
        let obj = fx.objects.find("obj").await.unwrap().unwrap();
        assert_eq!(obj.revision, 1);
        assert_eq!(obj.data, json!({"v": 1}));
        assert_eq!(obj.reference.state_transition_hash, "st1");
        assert!(!fx.packets.is_pinned(st2.packet_content_id()));

        mediator.reset().await.unwrap();
        assert!(fx.objects.is_empty());
        assert!(fx.contracts.is_empty());
        assert_eq!(fx.packets.pinned_count(), 0);
    }

    #[tokio::test]
    async fn missing_packet_fails_apply() {
        let fx = fixture();
        let st = publish(&fx, "st1", 1, StPacket::default()).await;
        let mut orphan = st.clone();
        orphan.payload.hash_st_packet = "missing".into();

        let err = fx
            .applier
            .apply(&orphan, &fx.chain.block_at(1).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Packet(_)));
    }

    #[tokio::test]
    async fn pinning_unknown_packet_fails() {
        let store = MemoryPacketStore::new();
        assert!(store.pin("nope").await.is_err());
        let id = store.put(&StPacket::default()).await.unwrap();
        store.pin(&id).await.unwrap();
        assert!(store.is_pinned(&id));
    }
}
