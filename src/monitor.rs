//! Remote monitoring of a running tree.
//!
//! A [`Publisher`] serves a request/reply protocol on one TCP port and streams
//! notifications on a second one. Every message is a sequence of frames
//! (see [`frame`](encode_message)); the first frame is a header.
//!
//! | Request | Code | Payload | Reply after the header |
//! |---|---|---|---|
//! | FULLTREE | `T` | | YAML [`TreeDescription`] |
//! | STATUS | `S` | | `(uid: u16 LE, status: u8)` per node, in uid order |
//! | GET_TRANSITIONS | `t` | | 9-byte [`Transition`] records, recording start (µs, decimal) |
//! | UPDATE_MODE | `m` | YAML tree source | code, message |
//! | START / SUSPEND / STOP | `g` / `p` / `q` | | code, new state |
//! | AUTH | `a` | token (optional) | code, new state |
//! | STATE | `e` | | code, state |
//! | HOOK_INSERT | `I` | JSON [`HookSpec`] | code, message |
//! | REMOVE_HOOK | `R` | JSON [`HookAddress`] | code, message |
//! | BREAKPOINT_UNLOCK | `U` | JSON [`UnlockRequest`] | code, message |
//! | ENABLE_ALL_HOOKS / DISABLE_ALL_HOOKS | `E` / `X` | | code, message |
//! | HOOKS_DUMP | `D` | | JSON array of [`HookSpec`] |
//! | TOGGLE_RECORDING | `r` | `start` or `stop` | code, recording start (µs) |
//! | BLACKBOARD | `B` | scope names separated by `;` (optional) | JSON array of [`ScopeDump`] |
//!
//! Any request can be answered with `[header, 1, message]` instead, for example
//! an unknown request type or a state transition that is not allowed.
//!
//! The publish port carries STATUS snapshots whenever a status changed, a STATE
//! heartbeat every [`PublisherConfig::heartbeat_interval_ms`], and a
//! BREAKPOINT_REACHED (`N`) notification whenever the tree blocks on a breakpoint.

mod blackboard_dump;
mod client;
mod config;
mod frame;
mod hooks;
mod ports;
mod protocol;
mod publisher;
mod run_state;
mod server;
mod topology;

pub use self::blackboard_dump::{dump_scopes, EntryDump, ScopeDump};
pub use self::client::{MonitorClient, MonitorSubscriber, Notification};
pub use self::config::PublisherConfig;
pub use self::frame::{encode_message, Connection, FrameDecoder, Message, MAX_FRAME_LEN};
pub use self::hooks::{HookMode, HookSpec, HookTable, Position};
pub use self::ports::{PortClaim, PortRegistry};
pub use self::protocol::{
    decode_statuses, encode_statuses, HookAddress, ReplyHeader, RequestHeader, RequestType,
    ResultCode, Transition, UnlockRequest, PROTOCOL_ID,
};
pub use self::publisher::Publisher;
pub use self::run_state::{RunControl, RunState};
pub use self::topology::{NodeDescription, PortDescription, TreeDescription};
