//! The two publisher threads and the state they share with the ticking thread.

use super::{
    blackboard_dump::dump_scopes,
    config::PublisherConfig,
    frame::Connection,
    hooks::{HookSpec, HookTable},
    protocol::{
        encode_statuses, HookAddress, ReplyHeader, RequestHeader, RequestType, ResultCode,
        Transition, UnlockRequest,
    },
    run_state::{RunControl, RunState},
    topology::Topology,
};
use crate::{
    blackboard::BlackboardMirror,
    error::{LoadError, ProtocolError, StateError, TransportError},
    parser::{load, TreeSource},
    NodeStatus, NodeUid, Registry,
};
use bytes::Bytes;
use std::{
    collections::VecDeque,
    io::ErrorKind,
    net::TcpListener,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Read timeout of request connections, and the idle sleep of both loops.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Node statuses as last reported by the ticking thread.
#[derive(Debug, Default)]
pub(crate) struct StatusBuffer {
    pub(crate) statuses: Vec<NodeStatus>,
    /// Changed since last published.
    pub(crate) dirty: bool,
}

#[derive(Debug)]
pub(crate) struct TransitionLog {
    pub(crate) records: VecDeque<Transition>,
    /// Microseconds since the UNIX epoch at which the recording started.
    pub(crate) epoch_us: u64,
    pub(crate) recording: bool,
    pub(crate) capacity: usize,
}

impl TransitionLog {
    fn new(recording: bool, capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            epoch_us: now_us(),
            recording,
            capacity,
        }
    }

    pub(crate) fn push(&mut self, timestamp: Duration, uid: NodeUid, status: NodeStatus) {
        if !self.recording || self.capacity == 0 {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        let timestamp_us = (timestamp.as_micros() as u64).saturating_sub(self.epoch_us);
        self.records.push_back(Transition {
            timestamp_us,
            uid,
            status,
        });
    }

    fn start(&mut self) {
        self.records.clear();
        self.epoch_us = now_us();
        self.recording = true;
    }
}

pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the ticking thread, the server thread and the heartbeat thread share.
pub(crate) struct Shared {
    pub(crate) config: PublisherConfig,
    pub(crate) active: AtomicBool,
    pub(crate) topology: RwLock<Topology>,
    pub(crate) status: Mutex<StatusBuffer>,
    pub(crate) transitions: Mutex<TransitionLog>,
    pub(crate) hooks: Arc<HookTable>,
    pub(crate) blackboards: Arc<BlackboardMirror>,
    pub(crate) control: Arc<RunControl>,
    pub(crate) registry: Option<Arc<Registry>>,
    pub(crate) pending_topology: Mutex<Option<TreeSource>>,
    last_request: Mutex<Instant>,
    pub(crate) max_heartbeat_delay_ms: AtomicU64,
    subscribers: Mutex<Vec<Connection>>,
}

impl Shared {
    pub(crate) fn new(
        config: PublisherConfig,
        topology: Topology,
        statuses: Vec<NodeStatus>,
        hooks: Arc<HookTable>,
        blackboards: Arc<BlackboardMirror>,
        control: Arc<RunControl>,
        registry: Option<Arc<Registry>>,
    ) -> Self {
        let transitions = TransitionLog::new(config.record_transitions, config.max_transitions);
        let max_heartbeat_delay_ms = AtomicU64::new(config.max_heartbeat_delay_ms);
        Self {
            config,
            active: AtomicBool::new(true),
            topology: RwLock::new(topology),
            status: Mutex::new(StatusBuffer {
                statuses,
                dirty: true,
            }),
            transitions: Mutex::new(transitions),
            hooks,
            blackboards,
            control,
            registry,
            pending_topology: Mutex::new(None),
            last_request: Mutex::new(Instant::now()),
            max_heartbeat_delay_ms,
            subscribers: Mutex::new(vec![]),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn tree_id(&self) -> [u8; 16] {
        self.topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tree_id
    }

    pub(crate) fn status(&self) -> MutexGuard<'_, StatusBuffer> {
        lock(&self.status)
    }

    pub(crate) fn transitions(&self) -> MutexGuard<'_, TransitionLog> {
        lock(&self.transitions)
    }

    pub(crate) fn pending_topology(&self) -> MutexGuard<'_, Option<TreeSource>> {
        lock(&self.pending_topology)
    }

    fn heartbeat_alive(&self) -> bool {
        let delay = Duration::from_millis(self.max_heartbeat_delay_ms.load(Ordering::Relaxed));
        lock(&self.last_request).elapsed() < delay
    }

    /// Sends to every publish subscriber, dropping the ones that fail.
    pub(crate) fn publish<F: AsRef<[u8]>>(&self, frames: &[F]) {
        lock(&self.subscribers).retain_mut(|subscriber| match subscriber.send(frames) {
            Ok(()) => true,
            Err(err) => {
                debug!(peer = ?subscriber.peer_addr(), error = %err, "dropping subscriber");
                false
            }
        });
    }

    pub(crate) fn notification_header(&self, ty: RequestType) -> Vec<u8> {
        ReplyHeader::new(RequestHeader::new(ty, 0), self.tree_id()).to_bytes()
    }
}

/// Why a request was answered with an error reply.
#[derive(Debug, Error)]
enum RequestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("{0}")]
    Rejected(String),
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.into())
    }
}

/// Answers one request message. Never fails: problems become an error reply
/// `[header, 1, message]` and the connection stays usable.
pub(crate) fn handle_request(shared: &Shared, message: &[Bytes]) -> Vec<Vec<u8>> {
    *lock(&shared.last_request) = Instant::now();

    let (header, result) = match message.split_first() {
        None => (RequestHeader::undefined(), Err(ProtocolError::Empty.into())),
        Some((first, payload)) => match RequestHeader::decode(first) {
            Ok(header) => (header, respond(shared, header, payload)),
            Err(err) => (RequestHeader::decode_partial(first), Err(err.into())),
        },
    };

    let reply_header = ReplyHeader::new(header, shared.tree_id()).to_bytes();
    match result {
        Ok(mut frames) => {
            frames.insert(0, reply_header);
            frames
        }
        Err(err) => {
            debug!(request = ?header.ty, error = %err, "request rejected");
            vec![
                reply_header,
                ResultCode::Error.frame(),
                err.to_string().into_bytes(),
            ]
        }
    }
}

fn ok(message: impl Into<String>) -> Vec<Vec<u8>> {
    vec![ResultCode::Ok.frame(), message.into().into_bytes()]
}

fn expect_frames(
    request: RequestType,
    payload: &[Bytes],
    expected: usize,
) -> Result<(), ProtocolError> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(ProtocolError::FrameCount {
            request,
            expected: expected + 1,
            actual: payload.len() + 1,
        })
    }
}

fn text(frame: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(frame).map_err(|_| ProtocolError::NotUtf8)
}

fn respond(
    shared: &Shared,
    header: RequestHeader,
    payload: &[Bytes],
) -> Result<Vec<Vec<u8>>, RequestError> {
    use RequestType::*;
    let ty = header.ty;
    match ty {
        FullTree => {
            expect_frames(ty, payload, 0)?;
            let topology = shared.topology.read().unwrap_or_else(PoisonError::into_inner);
            Ok(vec![topology.text.clone().into_bytes()])
        }
        Status => {
            expect_frames(ty, payload, 0)?;
            let status = shared.status();
            Ok(vec![encode_statuses(
                status
                    .statuses
                    .iter()
                    .enumerate()
                    .map(|(uid, status)| (uid as NodeUid, *status)),
            )])
        }
        GetTransitions => {
            expect_frames(ty, payload, 0)?;
            let (records, epoch_us) = {
                let mut log = shared.transitions();
                (std::mem::take(&mut log.records), log.epoch_us)
            };
            let mut buf = Vec::with_capacity(records.len() * Transition::SIZE);
            for record in &records {
                record.encode(&mut buf);
            }
            Ok(vec![buf, epoch_us.to_string().into_bytes()])
        }
        UpdateMode => {
            expect_frames(ty, payload, 1)?;
            let current = shared.control.state();
            if current != RunState::Stopped {
                return Err(StateError::InvalidTransition {
                    request: ty,
                    current,
                    expected: vec![RunState::Stopped],
                }
                .into());
            }
            let text = text(&payload[0])?;
            let source = TreeSource::from_yaml(text)?;
            if let Some(registry) = &shared.registry {
                load(&source, registry, true)?;
            }
            if let Some(path) = &shared.config.topology_path {
                std::fs::write(path, text).map_err(|err| {
                    RequestError::Rejected(format!(
                        "failed to persist the topology to {}: {err}",
                        path.display()
                    ))
                })?;
            }
            *shared.pending_topology() = Some(source);
            info!("new topology accepted; it takes effect on the next START");
            Ok(ok("topology accepted"))
        }
        Start => {
            expect_frames(ty, payload, 0)?;
            if shared.control.start()? != RunState::Suspended {
                // A fresh run re-arms the hooks a previous STOP disarmed.
                shared.hooks.enable_all(true);
            }
            Ok(ok(RunState::Running.name()))
        }
        Suspend => {
            expect_frames(ty, payload, 0)?;
            shared.control.suspend()?;
            Ok(ok(RunState::Suspended.name()))
        }
        Stop => {
            expect_frames(ty, payload, 0)?;
            shared.control.stop()?;
            shared.hooks.enable_all(false);
            Ok(ok(RunState::Stopped.name()))
        }
        Auth => {
            let token = match payload {
                [] => None,
                [token] => Some(text(token)?),
                _ => {
                    return Err(ProtocolError::FrameCount {
                        request: ty,
                        expected: 2,
                        actual: payload.len() + 1,
                    }
                    .into())
                }
            };
            let state = shared.control.auth(token)?;
            Ok(ok(state.name()))
        }
        State => {
            expect_frames(ty, payload, 0)?;
            Ok(ok(shared.control.state().name()))
        }
        HookInsert => {
            expect_frames(ty, payload, 1)?;
            let spec: HookSpec = serde_json::from_slice(&payload[0])?;
            let num_nodes = shared
                .topology
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .num_nodes;
            if spec.uid as usize >= num_nodes {
                return Err(RequestError::Rejected(format!(
                    "node {} does not exist",
                    spec.uid
                )));
            }
            let (position, uid) = (spec.position, spec.uid);
            if !shared.hooks.insert(spec) {
                return Err(RequestError::Rejected(format!(
                    "a hook already exists at {position:?} of node {uid}"
                )));
            }
            Ok(ok("hook inserted"))
        }
        RemoveHook => {
            expect_frames(ty, payload, 1)?;
            let address: HookAddress = serde_json::from_slice(&payload[0])?;
            if !shared.hooks.remove(address.position, address.uid) {
                return Err(no_hook(address.position, address.uid));
            }
            Ok(ok("hook removed"))
        }
        BreakpointUnlock => {
            expect_frames(ty, payload, 1)?;
            let request: UnlockRequest = serde_json::from_slice(&payload[0])?;
            if !shared.hooks.unlock(
                request.position,
                request.uid,
                request.desired_status,
                request.remove_when_done,
            ) {
                return Err(no_hook(request.position, request.uid));
            }
            Ok(ok("unlocked"))
        }
        EnableAllHooks | DisableAllHooks => {
            expect_frames(ty, payload, 0)?;
            shared.hooks.enable_all(ty == EnableAllHooks);
            Ok(ok(if ty == EnableAllHooks {
                "hooks enabled"
            } else {
                "hooks disabled"
            }))
        }
        HooksDump => {
            expect_frames(ty, payload, 0)?;
            Ok(vec![serde_json::to_vec(&shared.hooks.dump())?])
        }
        ToggleRecording => {
            expect_frames(ty, payload, 1)?;
            let mut log = shared.transitions();
            match text(&payload[0])?.trim() {
                "start" => log.start(),
                "stop" => log.recording = false,
                other => {
                    return Err(RequestError::Rejected(format!(
                        "expected \"start\" or \"stop\", got {other:?}"
                    )))
                }
            }
            Ok(vec![
                ResultCode::Ok.frame(),
                log.epoch_us.to_string().into_bytes(),
            ])
        }
        Blackboard => {
            let names: Vec<&str> = match payload {
                [] => vec![],
                [names] => text(names)?
                    .split(';')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .collect(),
                _ => {
                    return Err(ProtocolError::FrameCount {
                        request: ty,
                        expected: 2,
                        actual: payload.len() + 1,
                    }
                    .into())
                }
            };
            let dump = shared
                .blackboards
                .with(|blackboards| dump_scopes(blackboards, &names))
                .unwrap_or_default();
            Ok(vec![serde_json::to_vec(&dump)?])
        }
        BreakpointReached | Undefined | Unknown(_) => {
            Err(ProtocolError::UnknownRequest(ty.code()).into())
        }
    }
}

fn no_hook(position: super::hooks::Position, uid: NodeUid) -> RequestError {
    RequestError::Rejected(format!("no hook at {position:?} of node {uid}"))
}

fn accept_all(listener: &TcpListener, read_timeout: Duration, write_timeout: Duration) -> Vec<Connection> {
    let mut accepted = vec![];
    loop {
        match listener.accept() {
            Ok((stream, peer)) => match Connection::new(stream, read_timeout, write_timeout) {
                Ok(conn) => {
                    debug!(%peer, "monitor connected");
                    accepted.push(conn);
                }
                Err(err) => warn!(%peer, error = %err, "failed to set up a connection"),
            },
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) => {
                warn!(error = %err, "accept failed");
                break;
            }
        }
    }
    accepted
}

/// Serves requests until the publisher is dropped.
pub(crate) fn server_loop(shared: Arc<Shared>, listener: TcpListener) {
    let io_timeout = shared.config.io_timeout();
    let mut connections: Vec<Connection> = vec![];
    while shared.is_active() {
        connections.extend(accept_all(&listener, POLL_INTERVAL, io_timeout));
        if connections.is_empty() {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        connections.retain_mut(|conn| serve(&shared, conn));
    }
    debug!("server thread finished");
}

/// Handles at most one request. Returns false if the connection is gone.
fn serve(shared: &Shared, conn: &mut Connection) -> bool {
    let message = match conn.recv() {
        Ok(message) => message,
        Err(TransportError::Timeout) => return true,
        Err(TransportError::Closed) => {
            debug!(peer = ?conn.peer_addr(), "monitor disconnected");
            return false;
        }
        Err(err) => {
            warn!(peer = ?conn.peer_addr(), error = %err, "receive failed");
            return false;
        }
    };
    let reply = handle_request(shared, &message);
    match conn.send(&reply) {
        Ok(()) => true,
        Err(err) => {
            warn!(peer = ?conn.peer_addr(), error = %err, "reply failed");
            false
        }
    }
}

/// Watches the monitor's liveness and feeds the publish socket.
pub(crate) fn heartbeat_loop(shared: Arc<Shared>, listener: TcpListener) {
    let io_timeout = shared.config.io_timeout();
    let interval = shared.config.heartbeat_interval();
    let mut alive = true;
    let mut last_beat: Option<Instant> = None;
    while shared.is_active() {
        let accepted = accept_all(&listener, io_timeout, io_timeout);
        if !accepted.is_empty() {
            lock(&shared.subscribers).extend(accepted);
            // A new subscriber gets a full snapshot.
            shared.status().dirty = true;
        }

        let now_alive = shared.heartbeat_alive();
        if now_alive != alive {
            alive = now_alive;
            if alive {
                info!("monitor heartbeat regained; hooks enabled");
            } else {
                warn!("monitor heartbeat lost; releasing all hooks");
            }
            shared.hooks.enable_all(alive);
        }

        let snapshot = {
            let mut status = shared.status();
            std::mem::take(&mut status.dirty).then(|| {
                encode_statuses(
                    status
                        .statuses
                        .iter()
                        .enumerate()
                        .map(|(uid, status)| (uid as NodeUid, *status)),
                )
            })
        };
        if let Some(snapshot) = snapshot {
            shared.publish(&[shared.notification_header(RequestType::Status), snapshot]);
        }

        if last_beat.map_or(true, |beat| beat.elapsed() >= interval) {
            last_beat = Some(Instant::now());
            shared.publish(&[
                shared.notification_header(RequestType::State),
                shared.control.state().name().as_bytes().to_vec(),
            ]);
        }

        thread::sleep(POLL_INTERVAL);
    }
    debug!("heartbeat thread finished");
}

#[cfg(test)]
mod test;
