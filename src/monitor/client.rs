use super::{
    blackboard_dump::ScopeDump,
    frame::{Connection, Message},
    hooks::{HookSpec, Position},
    protocol::{
        decode_statuses, HookAddress, ReplyHeader, RequestHeader, RequestType, ResultCode,
        Transition, UnlockRequest,
    },
    run_state::RunState,
    topology::TreeDescription,
};
use crate::{
    error::{ClientError, ProtocolError, TransportError},
    NodeStatus, NodeUid,
};
use bytes::Bytes;
use std::{
    net::ToSocketAddrs,
    time::{Duration, Instant},
};
use tracing::debug;

/// Request/reply side of a remote monitor.
///
/// Requests are answered in order, but a reply that does not echo the
/// outstanding request header (a late answer to a request that timed out) is
/// discarded.
pub struct MonitorClient {
    conn: Connection,
    next_id: u32,
    timeout: Duration,
    tree_id: Option<[u8; 16]>,
}

impl MonitorClient {
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Connection::connect(addr, timeout)?,
            next_id: 0,
            timeout,
            tree_id: None,
        })
    }

    /// The tree_id of the last reply.
    pub fn tree_id(&self) -> Option<[u8; 16]> {
        self.tree_id
    }

    /// Sends a request and returns the frames of its reply after the header.
    pub fn request(&mut self, ty: RequestType, payload: &[&[u8]]) -> Result<Message, ClientError> {
        self.next_id = self.next_id.wrapping_add(1);
        let header = RequestHeader::new(ty, self.next_id);
        let header_bytes = header.to_bytes();
        let mut frames: Vec<&[u8]> = Vec::with_capacity(payload.len() + 1);
        frames.push(&header_bytes);
        frames.extend_from_slice(payload);
        self.conn.send(&frames)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Stale(header.unique_id));
            }
            self.conn.set_read_timeout(remaining)?;
            let mut message = match self.conn.recv() {
                Ok(message) => message,
                Err(TransportError::Timeout) => return Err(ClientError::Stale(header.unique_id)),
                Err(err) => return Err(err.into()),
            };
            let reply = message
                .first()
                .and_then(|first| ReplyHeader::decode(first).ok());
            match reply {
                Some(reply) if reply.answers(&header) => {
                    self.tree_id = Some(reply.tree_id);
                    message.remove(0);
                    return Ok(message);
                }
                reply => debug!(?reply, expected = header.unique_id, "discarding stale reply"),
            }
        }
    }

    /// Sends a request answered with `[code, message]`.
    pub fn command(&mut self, ty: RequestType, payload: &[&[u8]]) -> Result<String, ClientError> {
        let body = self.request(ty, payload)?;
        check_error(&body)?;
        match body.as_slice() {
            [code, message] if code.as_ref() == ResultCode::Ok.frame().as_slice() => {
                Ok(utf8(message)?.to_owned())
            }
            _ => Err(ProtocolError::FrameCount {
                request: ty,
                expected: 3,
                actual: body.len() + 1,
            }
            .into()),
        }
    }

    /// A request answered with data frames, or with an error reply.
    fn data(&mut self, ty: RequestType, frames: usize) -> Result<Message, ClientError> {
        let body = self.request(ty, &[])?;
        check_error(&body)?;
        if body.len() != frames {
            return Err(ProtocolError::FrameCount {
                request: ty,
                expected: frames + 1,
                actual: body.len() + 1,
            }
            .into());
        }
        Ok(body)
    }

    pub fn full_tree_text(&mut self) -> Result<String, ClientError> {
        let body = self.data(RequestType::FullTree, 1)?;
        Ok(utf8(&body[0])?.to_owned())
    }

    pub fn full_tree(&mut self) -> Result<TreeDescription, ClientError> {
        let text = self.full_tree_text()?;
        Ok(TreeDescription::from_yaml(&text).map_err(ProtocolError::from)?)
    }

    pub fn status(&mut self) -> Result<Vec<(NodeUid, NodeStatus)>, ClientError> {
        let body = self.data(RequestType::Status, 1)?;
        Ok(decode_statuses(&body[0])?)
    }

    /// Transitions recorded since the last poll, with the recording start in
    /// microseconds since the UNIX epoch.
    pub fn transitions(&mut self) -> Result<(Vec<Transition>, u64), ClientError> {
        let body = self.data(RequestType::GetTransitions, 2)?;
        let records = Transition::decode_all(&body[0])?;
        let start = parse_us(&body[1])?;
        Ok((records, start))
    }

    pub fn start(&mut self) -> Result<RunState, ClientError> {
        self.state_command(RequestType::Start, &[])
    }

    pub fn suspend(&mut self) -> Result<RunState, ClientError> {
        self.state_command(RequestType::Suspend, &[])
    }

    pub fn stop(&mut self) -> Result<RunState, ClientError> {
        self.state_command(RequestType::Stop, &[])
    }

    pub fn auth(&mut self, token: Option<&str>) -> Result<RunState, ClientError> {
        match token {
            Some(token) => self.state_command(RequestType::Auth, &[token.as_bytes()]),
            None => self.state_command(RequestType::Auth, &[]),
        }
    }

    pub fn state(&mut self) -> Result<RunState, ClientError> {
        self.state_command(RequestType::State, &[])
    }

    fn state_command(&mut self, ty: RequestType, payload: &[&[u8]]) -> Result<RunState, ClientError> {
        let message = self.command(ty, payload)?;
        message
            .parse()
            .map_err(|_| ProtocolError::BadFrame("run state").into())
    }

    /// Proposes a new tree source. Only accepted while STOPPED.
    pub fn update_mode(&mut self, source: &str) -> Result<String, ClientError> {
        self.command(RequestType::UpdateMode, &[source.as_bytes()])
    }

    pub fn insert_hook(&mut self, spec: &HookSpec) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(spec).map_err(ProtocolError::from)?;
        self.command(RequestType::HookInsert, &[payload.as_slice()]).map(|_| ())
    }

    pub fn remove_hook(&mut self, position: Position, uid: NodeUid) -> Result<(), ClientError> {
        let payload =
            serde_json::to_vec(&HookAddress { position, uid }).map_err(ProtocolError::from)?;
        self.command(RequestType::RemoveHook, &[payload.as_slice()]).map(|_| ())
    }

    /// Releases a blocked breakpoint. `IDLE` lets the node run its own logic.
    pub fn unlock(&mut self, request: &UnlockRequest) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(request).map_err(ProtocolError::from)?;
        self.command(RequestType::BreakpointUnlock, &[payload.as_slice()])
            .map(|_| ())
    }

    pub fn hooks(&mut self) -> Result<Vec<HookSpec>, ClientError> {
        let body = self.data(RequestType::HooksDump, 1)?;
        Ok(serde_json::from_slice(&body[0]).map_err(ProtocolError::from)?)
    }

    pub fn enable_all_hooks(&mut self, enabled: bool) -> Result<(), ClientError> {
        let ty = if enabled {
            RequestType::EnableAllHooks
        } else {
            RequestType::DisableAllHooks
        };
        self.command(ty, &[]).map(|_| ())
    }

    /// Returns the recording start in microseconds since the UNIX epoch.
    pub fn toggle_recording(&mut self, recording: bool) -> Result<u64, ClientError> {
        let arg: &[u8] = if recording { b"start" } else { b"stop" };
        let start = self.command(RequestType::ToggleRecording, &[arg])?;
        parse_us(start.as_bytes()).map_err(Into::into)
    }

    /// Dumps the named blackboard scopes, or all of them when `scopes` is empty.
    pub fn blackboards(&mut self, scopes: &[&str]) -> Result<Vec<ScopeDump>, ClientError> {
        let ty = RequestType::Blackboard;
        let names = scopes.join(";");
        let body = self.request(ty, &[names.as_bytes()])?;
        check_error(&body)?;
        if body.len() != 1 {
            return Err(ProtocolError::FrameCount {
                request: ty,
                expected: 2,
                actual: body.len() + 1,
            }
            .into());
        }
        Ok(serde_json::from_slice(&body[0]).map_err(ProtocolError::from)?)
    }
}

/// An error reply is `[1, message]`; data replies never start with a 1-byte frame
/// followed by exactly one more.
fn check_error(body: &[Bytes]) -> Result<(), ClientError> {
    match body {
        [code, message] if code.as_ref() == ResultCode::Error.frame().as_slice() => {
            Err(ClientError::Remote(String::from_utf8_lossy(message).into_owned()))
        }
        _ => Ok(()),
    }
}

fn utf8(frame: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(frame).map_err(|_| ProtocolError::NotUtf8)
}

fn parse_us(frame: &[u8]) -> Result<u64, ProtocolError> {
    utf8(frame)?
        .trim()
        .parse()
        .map_err(|_| ProtocolError::BadFrame("timestamp"))
}

/// What arrives on the publish port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Status(Vec<(NodeUid, NodeStatus)>),
    Heartbeat(RunState),
    BreakpointReached(HookAddress),
}

/// Publish side of a remote monitor.
pub struct MonitorSubscriber {
    conn: Connection,
}

impl MonitorSubscriber {
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Connection::connect(addr, timeout)?,
        })
    }

    /// Waits up to `timeout` for the next notification.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Notification>, ClientError> {
        self.conn.set_read_timeout(timeout)?;
        let message = match self.conn.recv() {
            Ok(message) => message,
            Err(TransportError::Timeout) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let [header, payload] = message.as_slice() else {
            return Err(ProtocolError::FrameCount {
                request: RequestType::Undefined,
                expected: 2,
                actual: message.len(),
            }
            .into());
        };
        let header = ReplyHeader::decode(header)?;
        let notification = match header.request.ty {
            RequestType::Status => Notification::Status(decode_statuses(payload)?),
            RequestType::State => Notification::Heartbeat(
                utf8(payload)?
                    .parse()
                    .map_err(|_| ProtocolError::BadFrame("run state"))?,
            ),
            RequestType::BreakpointReached => Notification::BreakpointReached(
                serde_json::from_slice(payload).map_err(ProtocolError::from)?,
            ),
            other => return Err(ProtocolError::UnknownRequest(other.code()).into()),
        };
        Ok(Some(notification))
    }
}
