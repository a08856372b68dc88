//! Error types of the engine, the tree loader and the monitoring protocol.
//!
//! Nothing here ever terminates the process: tick errors degrade to a
//! `Failure` status, protocol and state errors degrade to an error reply.

use crate::{
    monitor::{RequestType, RunState},
    Symbol,
};
use thiserror::Error;

/// The tree text could not be turned into a valid graph.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("The main tree {0:?} does not exist")]
    MissingTree(String),
    #[error("Node type or subtree name not found {0:?}")]
    MissingNode(String),
    #[error("Attempted to add too many nodes to {node} (at most {max})")]
    TooManyChildren { node: String, max: usize },
    #[error("Node {node} requires at least {min} children")]
    MissingChild { node: String, min: usize },
    #[error("Subtree {node} refers to itself")]
    InfiniteRecursion { node: String },
    #[error("Port {port:?} was not provided by the node {node:?}")]
    PortUnmatch { node: String, port: String },
    #[error("Port {port:?} on node {node:?} has a wrong direction")]
    PortIOUnmatch { node: String, port: String },
    #[error("A literal cannot be assigned to the output port {port:?} of {node:?}")]
    LiteralToOutput { node: String, port: String },
    #[error("The tree has more than {0} nodes")]
    TooManyNodes(usize),
    #[error("Malformed tree source: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A node's logic failed while being ticked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TickError {
    #[error("input port {port:?} is not set")]
    MissingInput { port: Symbol },
    #[error("blackboard entry {key:?} holds {found}, not the requested type")]
    TypeMismatch { key: Symbol, found: &'static str },
    #[error("port {port:?} is bound to a literal and cannot be written")]
    ReadOnlyPort { port: Symbol },
    #[error("node {node} returned IDLE from tick")]
    IdleReturned { node: String },
    #[error("{0}")]
    Failed(String),
    #[error("node panicked: {0}")]
    Panicked(String),
}

pub type TickResult<T = crate::NodeStatus> = Result<T, TickError>;

/// A request could not be decoded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("header has {actual} bytes, expected {expected}")]
    HeaderSize { expected: usize, actual: usize },
    #[error("request {request:?} carries {actual} frames, expected {expected}")]
    FrameCount {
        request: RequestType,
        expected: usize,
        actual: usize,
    },
    #[error("request type not recognized: {0:#04x}")]
    UnknownRequest(u8),
    #[error("invalid status value {0}")]
    InvalidStatus(u8),
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("message is empty")]
    Empty,
    #[error("malformed {0} frame")]
    BadFrame(&'static str),
    #[error("malformed topology: {0}")]
    Topology(#[from] serde_yaml::Error),
}

/// A request is not valid for the current run state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    #[error("{request:?} is not allowed while {current}; expected {}", join_states(.expected))]
    InvalidTransition {
        request: RequestType,
        current: RunState,
        expected: Vec<RunState>,
    },
    #[error("authentication failed")]
    Unauthorized,
}

fn join_states(states: &[RunState]) -> String {
    states
        .iter()
        .map(|state| state.to_string())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Socket level failure. Logged by the server loop, never fatal.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

impl TransportError {
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublisherError {
    #[error("port {0} is already used by another publisher")]
    PortInUse(u16),
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn the {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to describe the tree: {0}")]
    Describe(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failures seen by [`crate::monitor::MonitorClient`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no reply matching request {0} arrived")]
    Stale(u32),
    #[error("server replied with an error: {0}")]
    Remote(String),
}
