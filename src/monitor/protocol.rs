//! Binary message catalog of the monitoring protocol.

use super::hooks::Position;
use crate::{error::ProtocolError, NodeStatus, NodeUid};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Value of the `protocol` byte of every header.
pub const PROTOCOL_ID: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    FullTree,
    Status,
    GetTransitions,
    UpdateMode,
    Start,
    Suspend,
    Stop,
    Auth,
    State,
    HookInsert,
    RemoveHook,
    BreakpointUnlock,
    EnableAllHooks,
    DisableAllHooks,
    HooksDump,
    ToggleRecording,
    Blackboard,
    /// Sent on the publish socket only.
    BreakpointReached,
    /// Placeholder of a header that could not be decoded.
    Undefined,
    Unknown(u8),
}

impl RequestType {
    pub fn code(self) -> u8 {
        match self {
            Self::FullTree => b'T',
            Self::Status => b'S',
            Self::GetTransitions => b't',
            Self::UpdateMode => b'm',
            Self::Start => b'g',
            Self::Suspend => b'p',
            Self::Stop => b'q',
            Self::Auth => b'a',
            Self::State => b'e',
            Self::HookInsert => b'I',
            Self::RemoveHook => b'R',
            Self::BreakpointUnlock => b'U',
            Self::EnableAllHooks => b'E',
            Self::DisableAllHooks => b'X',
            Self::HooksDump => b'D',
            Self::ToggleRecording => b'r',
            Self::Blackboard => b'B',
            Self::BreakpointReached => b'N',
            Self::Undefined => 0,
            Self::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            b'T' => Self::FullTree,
            b'S' => Self::Status,
            b't' => Self::GetTransitions,
            b'm' => Self::UpdateMode,
            b'g' => Self::Start,
            b'p' => Self::Suspend,
            b'q' => Self::Stop,
            b'a' => Self::Auth,
            b'e' => Self::State,
            b'I' => Self::HookInsert,
            b'R' => Self::RemoveHook,
            b'U' => Self::BreakpointUnlock,
            b'E' => Self::EnableAllHooks,
            b'X' => Self::DisableAllHooks,
            b'D' => Self::HooksDump,
            b'r' => Self::ToggleRecording,
            b'B' => Self::Blackboard,
            b'N' => Self::BreakpointReached,
            0 => Self::Undefined,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub protocol: u8,
    pub ty: RequestType,
    pub unique_id: u32,
}

impl RequestHeader {
    pub const SIZE: usize = 6;

    pub fn new(ty: RequestType, unique_id: u32) -> Self {
        Self {
            protocol: PROTOCOL_ID,
            ty,
            unique_id,
        }
    }

    pub fn undefined() -> Self {
        Self {
            protocol: 0,
            ty: RequestType::Undefined,
            unique_id: 0,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.protocol);
        buf.put_u8(self.ty.code());
        buf.put_u32_le(self.unique_id);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != Self::SIZE {
            return Err(ProtocolError::HeaderSize {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            protocol: bytes.get_u8(),
            ty: RequestType::from_code(bytes.get_u8()),
            unique_id: bytes.get_u32_le(),
        })
    }

    /// Decodes whatever fields a malformed header holds, leaving the rest zeroed.
    pub fn decode_partial(bytes: &[u8]) -> Self {
        let mut header = Self::undefined();
        if let Some(&protocol) = bytes.first() {
            header.protocol = protocol;
        }
        if let Some(&code) = bytes.get(1) {
            header.ty = RequestType::from_code(code);
        }
        if let Some(id) = bytes.get(2..Self::SIZE) {
            header.unique_id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
        }
        header
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub request: RequestHeader,
    /// Fingerprint of the topology the reply refers to.
    pub tree_id: [u8; 16],
}

impl ReplyHeader {
    pub const SIZE: usize = RequestHeader::SIZE + 16;

    /// Echoes `request`, normalizing the protocol byte.
    pub fn new(request: RequestHeader, tree_id: [u8; 16]) -> Self {
        Self {
            request: RequestHeader {
                protocol: PROTOCOL_ID,
                ..request
            },
            tree_id,
        }
    }

    /// Whether this is the reply to `request`.
    pub fn answers(&self, request: &RequestHeader) -> bool {
        self.request.ty == request.ty && self.request.unique_id == request.unique_id
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        self.request.encode(buf);
        buf.put_slice(&self.tree_id);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != Self::SIZE {
            return Err(ProtocolError::HeaderSize {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let request = RequestHeader::decode(&bytes[..RequestHeader::SIZE])?;
        let mut tree_id = [0; 16];
        tree_id.copy_from_slice(&bytes[RequestHeader::SIZE..]);
        Ok(Self { request, tree_id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    Error = 1,
}

impl ResultCode {
    pub fn frame(self) -> Vec<u8> {
        vec![self as u8]
    }
}

/// One status change, relative to the recording start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Microseconds since the recording started. Only the low 48 bits go on the wire.
    pub timestamp_us: u64,
    pub uid: NodeUid,
    pub status: NodeStatus,
}

impl Transition {
    pub const SIZE: usize = 9;
    const TIMESTAMP_MASK: u64 = (1 << 48) - 1;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_uint_le(self.timestamp_us & Self::TIMESTAMP_MASK, 6);
        buf.put_u16_le(self.uid);
        buf.put_u8(self.status.as_u8());
    }

    /// Decodes a frame of concatenated records.
    pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Self>, ProtocolError> {
        if bytes.len() % Self::SIZE != 0 {
            return Err(ProtocolError::HeaderSize {
                expected: Self::SIZE,
                actual: bytes.len() % Self::SIZE,
            });
        }
        let mut ret = Vec::with_capacity(bytes.len() / Self::SIZE);
        while bytes.has_remaining() {
            let timestamp_us = bytes.get_uint_le(6);
            let uid = bytes.get_u16_le();
            let status = decode_status_byte(bytes.get_u8())?;
            ret.push(Self {
                timestamp_us,
                uid,
                status,
            });
        }
        Ok(ret)
    }
}

fn decode_status_byte(value: u8) -> Result<NodeStatus, ProtocolError> {
    NodeStatus::from_u8(value).ok_or(ProtocolError::InvalidStatus(value))
}

/// Encodes the STATUS payload: `(uid, status)` per node.
pub fn encode_statuses(statuses: impl IntoIterator<Item = (NodeUid, NodeStatus)>) -> Vec<u8> {
    let mut buf = vec![];
    for (uid, status) in statuses {
        buf.put_u16_le(uid);
        buf.put_u8(status.as_u8());
    }
    buf
}

pub fn decode_statuses(mut bytes: &[u8]) -> Result<Vec<(NodeUid, NodeStatus)>, ProtocolError> {
    if bytes.len() % 3 != 0 {
        return Err(ProtocolError::HeaderSize {
            expected: 3,
            actual: bytes.len() % 3,
        });
    }
    let mut ret = Vec::with_capacity(bytes.len() / 3);
    while bytes.has_remaining() {
        let uid = bytes.get_u16_le();
        ret.push((uid, decode_status_byte(bytes.get_u8())?));
    }
    Ok(ret)
}

/// Payload of REMOVE_HOOK and BREAKPOINT_REACHED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookAddress {
    pub position: Position,
    pub uid: NodeUid,
}

/// Payload of BREAKPOINT_UNLOCK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub position: Position,
    pub uid: NodeUid,
    /// IDLE lets the node run its own logic.
    #[serde(default)]
    pub desired_status: NodeStatus,
    #[serde(default)]
    pub remove_when_done: bool,
}
