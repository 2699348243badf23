/// Replicated operation envelope and payload types.
///
/// Every state change travels as one small op through the external ordered
/// log. Replicas apply ops in log order; a submitter does not apply its own op
/// until the log delivers it back.
///
/// - Envelope and payload: bincode 1.x `DefaultOptions` (little-endian,
///   variable-length integers, length-prefixed strings, trailing bytes
///   rejected)
/// - `OpType` is encoded as its variant index, which is the wire tag
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::perm::ids::{DefIndex, GroupId, PlayerId};
use crate::perm::limits::{MAX_OP_BYTES, MAX_OP_PAYLOAD_BYTES};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("Payload exceeds max size ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Op exceeds max size ({size} > {max})")]
    OpTooLarge { size: usize, max: usize },

    #[error("Bincode encoding failed: {0}")]
    Encode(String),

    #[error("Bincode decoding failed: {0}")]
    Decode(String),
}

fn wire_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new().with_limit(limit as u64)
}

// ---------------------------------------------------------------------------
// OpType enum
// ---------------------------------------------------------------------------

/// The five replicated operations. The discriminant is the wire tag.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpType {
    DuplicateGroup = 0,
    DeleteGroup = 1,
    RenameGroup = 2,
    SetPlayerGroup = 3,
    SetFlag = 4,
}

impl OpType {
    /// Whether this op changes the set of live groups.
    pub fn is_structural(&self) -> bool {
        matches!(self, OpType::DuplicateGroup | OpType::DeleteGroup)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::DuplicateGroup => "DuplicateGroup",
            OpType::DeleteGroup => "DeleteGroup",
            OpType::RenameGroup => "RenameGroup",
            OpType::SetPlayerGroup => "SetPlayerGroup",
            OpType::SetFlag => "SetFlag",
        }
    }
}

// ---------------------------------------------------------------------------
// Payload types (bincode-encoded inside OpEnvelope.payload)
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DuplicateGroupPayload {
    pub name: String,
    pub source: GroupId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeleteGroupPayload {
    pub group: GroupId,
    pub replacement: GroupId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RenameGroupPayload {
    pub group: GroupId,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SetPlayerGroupPayload {
    pub player: PlayerId,
    pub group: GroupId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SetFlagPayload {
    pub group: GroupId,
    pub definition: DefIndex,
    pub value: bool,
}

/// A decoded op, ready for dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    DuplicateGroup(DuplicateGroupPayload),
    DeleteGroup(DeleteGroupPayload),
    RenameGroup(RenameGroupPayload),
    SetPlayerGroup(SetPlayerGroupPayload),
    SetFlag(SetFlagPayload),
}

impl Op {
    pub fn op_type(&self) -> OpType {
        match self {
            Op::DuplicateGroup(_) => OpType::DuplicateGroup,
            Op::DeleteGroup(_) => OpType::DeleteGroup,
            Op::RenameGroup(_) => OpType::RenameGroup,
            Op::SetPlayerGroup(_) => OpType::SetPlayerGroup,
            Op::SetFlag(_) => OpType::SetFlag,
        }
    }

    /// Wrap this op in an envelope sent by `sender`.
    pub fn seal(&self, sender: PlayerId) -> Result<OpEnvelope, OpError> {
        match self {
            Op::DuplicateGroup(p) => OpEnvelope::new(OpType::DuplicateGroup, sender, p),
            Op::DeleteGroup(p) => OpEnvelope::new(OpType::DeleteGroup, sender, p),
            Op::RenameGroup(p) => OpEnvelope::new(OpType::RenameGroup, sender, p),
            Op::SetPlayerGroup(p) => OpEnvelope::new(OpType::SetPlayerGroup, sender, p),
            Op::SetFlag(p) => OpEnvelope::new(OpType::SetFlag, sender, p),
        }
    }
}

// ---------------------------------------------------------------------------
// OpEnvelope
// ---------------------------------------------------------------------------

/// One replicated operation as it travels through the log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OpEnvelope {
    pub op_type: OpType,
    /// Participant that submitted the op.
    pub sender: PlayerId,
    /// bincode-encoded payload bytes.
    pub payload: Vec<u8>,
}

impl OpEnvelope {
    /// Encode `payload` and wrap it.
    pub fn new<P: Serialize>(op_type: OpType, sender: PlayerId, payload: &P) -> Result<Self, OpError> {
        let payload_bytes = wire_options(MAX_OP_PAYLOAD_BYTES)
            .serialize(payload)
            .map_err(|e| match *e {
                bincode::ErrorKind::SizeLimit => OpError::PayloadTooLarge {
                    size: wire_options(usize::MAX).serialized_size(payload).unwrap_or(0) as usize,
                    max: MAX_OP_PAYLOAD_BYTES,
                },
                other => OpError::Encode(other.to_string()),
            })?;

        Ok(OpEnvelope {
            op_type,
            sender,
            payload: payload_bytes,
        })
    }

    /// Serialize the full envelope to bytes (for the wire / the log).
    pub fn to_bytes(&self) -> Result<Vec<u8>, OpError> {
        if self.payload.len() > MAX_OP_PAYLOAD_BYTES {
            return Err(OpError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_OP_PAYLOAD_BYTES,
            });
        }
        wire_options(MAX_OP_BYTES)
            .serialize(self)
            .map_err(|e| OpError::Encode(e.to_string()))
    }

    /// Deserialize an envelope from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OpError> {
        if bytes.len() > MAX_OP_BYTES {
            return Err(OpError::OpTooLarge {
                size: bytes.len(),
                max: MAX_OP_BYTES,
            });
        }
        let envelope: OpEnvelope = wire_options(MAX_OP_BYTES)
            .deserialize(bytes)
            .map_err(|e| OpError::Decode(e.to_string()))?;
        if envelope.payload.len() > MAX_OP_PAYLOAD_BYTES {
            return Err(OpError::PayloadTooLarge {
                size: envelope.payload.len(),
                max: MAX_OP_PAYLOAD_BYTES,
            });
        }
        Ok(envelope)
    }

    /// Decode the payload into a typed struct.
    pub fn decode_payload<P: serde::de::DeserializeOwned>(&self) -> Result<P, OpError> {
        wire_options(MAX_OP_PAYLOAD_BYTES)
            .deserialize(&self.payload)
            .map_err(|e| OpError::Decode(e.to_string()))
    }

    /// Decode the payload according to `op_type`.
    pub fn decode_op(&self) -> Result<Op, OpError> {
        Ok(match self.op_type {
            OpType::DuplicateGroup => Op::DuplicateGroup(self.decode_payload()?),
            OpType::DeleteGroup => Op::DeleteGroup(self.decode_payload()?),
            OpType::RenameGroup => Op::RenameGroup(self.decode_payload()?),
            OpType::SetPlayerGroup => Op::SetPlayerGroup(self.decode_payload()?),
            OpType::SetFlag => Op::SetFlag(self.decode_payload()?),
        })
    }
}

// ---------------------------------------------------------------------------
// OpLog
// ---------------------------------------------------------------------------

/// The external ordered log. `submit` hands op bytes to the transport; the
/// host later feeds every delivered op (in global order, own ops included) to
/// `PermissionSystem::receive`.
pub trait OpLog {
    fn submit(&mut self, op: Vec<u8>);
}

/// In-memory log: collects submitted ops until drained. Used for tests and
/// single-process hosts.
#[derive(Clone, Debug, Default)]
pub struct VecOpLog {
    pending: Vec<Vec<u8>>,
}

impl VecOpLog {
    pub fn new() -> Self {
        VecOpLog::default()
    }

    /// Take every submitted op, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> &[Vec<u8>] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl OpLog for VecOpLog {
    fn submit(&mut self, op: Vec<u8>) {
        self.pending.push(op);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
