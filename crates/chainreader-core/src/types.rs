//! Shared types for the reader pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block as returned by the node's `getblock` call.
///
/// Field names follow the node's wire format. `nextblockhash` is absent at the
/// chain tip and `previousblockhash` is absent for genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    #[serde(rename = "previousblockhash", default, skip_serializing_if = "Option::is_none")]
    pub previous_block_hash: Option<String>,
    #[serde(rename = "nextblockhash", default, skip_serializing_if = "Option::is_none")]
    pub next_block_hash: Option<String>,
    /// Transaction ids in block order.
    #[serde(rename = "tx", default)]
    pub transaction_ids: Vec<String>,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.height == parent.height + 1
            && self.previous_block_hash.as_deref() == Some(parent.hash.as_str())
    }
}

// ─── StateTransitionHeader ───────────────────────────────────────────────────

/// Transaction type of a state-transition carrying special transaction.
pub const TRANSITION_TX_TYPE: u16 = 12;

/// Errors raised while decoding a raw transaction into a header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderParseError {
    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("transaction type {0} is not a state transition")]
    WrongType(u16),

    #[error("state transition {0} has no payload")]
    MissingPayload(String),
}

/// Payload of a state-transition special transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionPayload {
    pub version: u16,
    /// Registration transaction of the user who signed the transition.
    pub reg_tx_id: String,
    pub hash_prev_sub_tx: String,
    pub credit_fee: u64,
    /// Content id of the state-transition packet.
    #[serde(rename = "hashSTPacket")]
    pub hash_st_packet: String,
}

#[derive(Deserialize)]
struct RawTransaction {
    txid: String,
    #[serde(rename = "type", default)]
    tx_type: u16,
    #[serde(rename = "extraPayload")]
    extra_payload: Option<TransitionPayload>,
}

/// A state-transition header extracted from a block transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionHeader {
    /// Transaction id of the header.
    pub hash: String,
    pub transaction_type: u16,
    pub payload: TransitionPayload,
}

impl StateTransitionHeader {
    /// Decode a verbose raw transaction (JSON bytes) into a header.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, HeaderParseError> {
        let tx: RawTransaction = serde_json::from_slice(raw)
            .map_err(|e| HeaderParseError::Malformed(e.to_string()))?;
        if tx.tx_type != TRANSITION_TX_TYPE {
            return Err(HeaderParseError::WrongType(tx.tx_type));
        }
        let payload = tx
            .extra_payload
            .ok_or_else(|| HeaderParseError::MissingPayload(tx.txid.clone()))?;
        Ok(Self {
            hash: tx.txid,
            transaction_type: tx.tx_type,
            payload,
        })
    }

    /// Content id of the packet this header commits to.
    pub fn packet_content_id(&self) -> &str {
        &self.payload.hash_st_packet
    }

    /// Registration transaction id of the acting user.
    pub fn user_id(&self) -> &str {
        &self.payload.reg_tx_id
    }
}

// ─── Reference ───────────────────────────────────────────────────────────────

/// Provenance pointer used to re-fetch and re-apply a prior state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub block_hash: String,
    pub block_height: u64,
    pub state_transition_hash: String,
    pub packet_hash: String,
    pub object_hash: String,
}

// ─── Packets ─────────────────────────────────────────────────────────────────

/// What a packet entry does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityAction {
    Create,
    Update,
    Delete,
}

/// One contract or object entry carried by a state-transition packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub id: String,
    pub owner_id: String,
    pub action: EntityAction,
    pub revision: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EntityPayload {
    /// Hex SHA-256 of the payload's JSON encoding.
    pub fn hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }
}

/// The content stored under a header's packet content id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StPacket {
    #[serde(default)]
    pub contracts: Vec<EntityPayload>,
    #[serde(default)]
    pub objects: Vec<EntityPayload>,
}

impl StPacket {
    /// Hex SHA-256 of the packet's JSON encoding, used as its content id.
    pub fn content_id(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64, hash: &str, previous: Option<&str>) -> Block {
        Block {
            height,
            hash: hash.into(),
            previous_block_hash: previous.map(Into::into),
            next_block_hash: None,
            transaction_ids: vec![],
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = block(100, "aaa", Some("000"));
        let child = block(101, "bbb", Some("aaa"));
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
        assert!(!block(102, "ccc", Some("aaa")).extends(&parent));
    }

    #[test]
    fn block_uses_node_field_names() {
        let raw = r#"{"height":3,"hash":"c","previousblockhash":"b","tx":["t1","t2"]}"#;
        let b: Block = serde_json::from_str(raw).unwrap();
        assert_eq!(b.previous_block_hash.as_deref(), Some("b"));
        assert!(b.next_block_hash.is_none());
        assert_eq!(b.transaction_ids, vec!["t1", "t2"]);
    }

    #[test]
    fn header_from_transition_transaction() {
        let raw = br#"{
            "txid": "st1",
            "type": 12,
            "extraPayload": {
                "version": 1,
                "regTxId": "user",
                "hashPrevSubTx": "prev",
                "creditFee": 1000,
                "hashSTPacket": "packet"
            }
        }"#;
        let header = StateTransitionHeader::from_bytes(raw).unwrap();
        assert_eq!(header.hash, "st1");
        assert_eq!(header.packet_content_id(), "packet");
        assert_eq!(header.user_id(), "user");
    }

    #[test]
    fn header_rejects_other_transaction_types() {
        let raw = br#"{"txid": "tx", "type": 0}"#;
        assert_eq!(
            StateTransitionHeader::from_bytes(raw),
            Err(HeaderParseError::WrongType(0))
        );
        assert!(matches!(
            StateTransitionHeader::from_bytes(b"not json"),
            Err(HeaderParseError::Malformed(_))
        ));
    }

    #[test]
    fn payload_hash_depends_on_content() {
        let a = EntityPayload {
            id: "o1".into(),
            owner_id: "u".into(),
            action: EntityAction::Create,
            revision: 1,
            data: serde_json::json!({"name": "alice"}),
        };
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.revision = 2;
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }
}
