use super::{config::PublisherConfig, protocol::RequestType};
use crate::{error::StateError, NodeStatus};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum RunState {
    Stopped = 0,
    Running = 1,
    Suspended = 2,
    Success = 3,
    WaitAuth = 4,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Success,
            4 => Self::WaitAuth,
            _ => Self::Stopped,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::Success => "SUCCESS",
            Self::WaitAuth => "WAIT_AUTH",
        }
    }
}

impl Display for RunState {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        fmt.write_str(self.name())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Stopped,
            Self::Running,
            Self::Suspended,
            Self::Success,
            Self::WaitAuth,
        ]
        .into_iter()
        .find(|state| state.name() == s.trim())
        .ok_or_else(|| format!("unknown run state {s:?}"))
    }
}

/// The remotely driven run state of a tree.
///
/// Requests arrive on the server thread while the tick driver reads the state
/// and reports completion, so every transition is a compare-and-swap.
#[derive(Debug)]
pub struct RunControl {
    state: AtomicU8,
    /// Incremented whenever a run starts from scratch, as opposed to resuming.
    generation: AtomicU64,
    auth_token: Option<String>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Stopped as u8),
            generation: AtomicU64::new(0),
            auth_token: None,
        }
    }

    /// Starts in WAIT_AUTH until a client presents `token`.
    pub fn with_auth(token: impl Into<String>) -> Self {
        Self {
            state: AtomicU8::new(RunState::WaitAuth as u8),
            generation: AtomicU64::new(0),
            auth_token: Some(token.into()),
        }
    }

    pub fn from_config(config: &PublisherConfig) -> Self {
        match &config.auth_token {
            Some(token) => Self::with_auth(token.clone()),
            None => Self::new(),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Moves to `to` if the current state is one of `from`. Returns the previous state.
    fn transition(
        &self,
        request: RequestType,
        from: &[RunState],
        to: RunState,
    ) -> Result<RunState, StateError> {
        let mut current = self.state();
        loop {
            if !from.contains(&current) {
                return Err(StateError::InvalidTransition {
                    request,
                    current,
                    expected: from.to_vec(),
                });
            }
            match self.state.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    info!(from = %current, to = %to, "run state changed");
                    return Ok(current);
                }
                Err(actual) => current = RunState::from_u8(actual),
            }
        }
    }

    pub fn start(&self) -> Result<RunState, StateError> {
        let prev = self.transition(
            RequestType::Start,
            &[RunState::Stopped, RunState::Suspended, RunState::Success],
            RunState::Running,
        )?;
        if prev != RunState::Suspended {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        Ok(prev)
    }

    pub fn suspend(&self) -> Result<RunState, StateError> {
        self.transition(RequestType::Suspend, &[RunState::Running], RunState::Suspended)
    }

    pub fn stop(&self) -> Result<RunState, StateError> {
        self.transition(
            RequestType::Stop,
            &[RunState::Running, RunState::Suspended, RunState::Success],
            RunState::Stopped,
        )
    }

    /// Leaves WAIT_AUTH if `token` matches. Authenticating again is a no-op.
    pub fn auth(&self, token: Option<&str>) -> Result<RunState, StateError> {
        let current = self.state();
        if current != RunState::WaitAuth {
            return Ok(current);
        }
        if self.auth_token.as_deref() != token {
            return Err(StateError::Unauthorized);
        }
        self.transition(RequestType::Auth, &[RunState::WaitAuth], RunState::Stopped)
            .map(|_| RunState::Stopped)
    }

    /// Reports the completion of a run. Ignored unless RUNNING, so a STOP that
    /// raced with the last tick wins.
    pub fn finish(&self, status: NodeStatus) -> Option<RunState> {
        let to = match status {
            NodeStatus::Success => RunState::Success,
            NodeStatus::Failure => RunState::Stopped,
            _ => return None,
        };
        self.transition(RequestType::Stop, &[RunState::Running], to)
            .ok()
            .map(|_| to)
    }
}
