//! The three messages exchanged between sync peers. Wire-agnostic: any
//! [`crate::transport::SyncTransport`] implementation is responsible for
//! framing and delivering these.

use synapse_core::ShardId;

/// Ask a peer for every change to `shard_id` since `from_change_id`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncRequest {
    pub shard_id: ShardId,
    pub from_change_id: u64,
    pub node_id: String,
}

/// A peer's answer to a [`SyncRequest`]: an encoded delta (see
/// [`crate::delta`]) of everything it has past the requested watermark.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncResponse {
    pub delta_bytes: Vec<u8>,
}

/// Unsolicited push of local changes to a peer, used for the push half of
/// a sync round (step 4 of the per-shard sync procedure).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncPush {
    pub shard_id: ShardId,
    pub delta_bytes: Vec<u8>,
    pub node_id: String,
}

/// The three message kinds a [`crate::transport::SyncTransport`] carries,
/// tagged so one transport can multiplex all of them over a single
/// connection or socket.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SyncMessage {
    Request(SyncRequest),
    Response(SyncResponse),
    Push(SyncPush),
}
