use crate::{Lazy, NodeStatus, NodeUid, NumChildren, PortSpec, Symbol, Tree};
use std::time::{Duration, Instant};

static NUM_CYCLES: Lazy<Symbol> = Lazy::new(|| "num_cycles".into());
static NUM_ATTEMPTS: Lazy<Symbol> = Lazy::new(|| "num_attempts".into());
static MSEC: Lazy<Symbol> = Lazy::new(|| "msec".into());

/// Nodes with exactly one child that transform its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecoratorNode {
    Inverter,
    ForceSuccess,
    ForceFailure,
    /// Reruns the child after each SUCCESS until it succeeded `num_cycles` times.
    /// A negative count repeats forever.
    Repeat { count: i64 },
    /// Reruns the child after each FAILURE, up to `num_attempts` attempts in total.
    Retry { count: i64 },
    /// Fails and halts the child if it is still running `msec` milliseconds after
    /// the decorator left IDLE.
    Timeout { started: Option<Instant> },
}

impl DecoratorNode {
    pub(crate) fn repeat() -> Self {
        Self::Repeat { count: 0 }
    }

    pub(crate) fn retry() -> Self {
        Self::Retry { count: 0 }
    }

    pub(crate) fn timeout() -> Self {
        Self::Timeout { started: None }
    }

    pub(crate) fn provided_ports(&self) -> Vec<PortSpec> {
        match self {
            Self::Repeat { .. } => vec![PortSpec::new_in(*NUM_CYCLES)],
            Self::Retry { .. } => vec![PortSpec::new_in(*NUM_ATTEMPTS)],
            Self::Timeout { .. } => vec![PortSpec::new_in(*MSEC)],
            _ => vec![],
        }
    }

    pub(crate) fn max_children(&self) -> NumChildren {
        NumChildren::Finite(1)
    }

    pub(crate) fn reset(&mut self) {
        match self {
            Self::Repeat { count } | Self::Retry { count } => *count = 0,
            Self::Timeout { started } => *started = None,
            Self::Inverter | Self::ForceSuccess | Self::ForceFailure => (),
        }
    }
}

impl Tree {
    pub(crate) fn tick_decorator(&mut self, uid: NodeUid, node: &mut DecoratorNode) -> NodeStatus {
        let Some(child) = self.child(uid, 0) else {
            return NodeStatus::Failure;
        };
        match node {
            DecoratorNode::Inverter => {
                let status = match self.tick_node(child) {
                    NodeStatus::Success => NodeStatus::Failure,
                    NodeStatus::Failure | NodeStatus::Idle => NodeStatus::Success,
                    other => other,
                };
                self.settle_child(child, status)
            }
            DecoratorNode::ForceSuccess => {
                let status = match self.tick_node(child) {
                    NodeStatus::Failure | NodeStatus::Idle => NodeStatus::Success,
                    other => other,
                };
                self.settle_child(child, status)
            }
            DecoratorNode::ForceFailure => {
                let status = match self.tick_node(child) {
                    NodeStatus::Success | NodeStatus::Idle => NodeStatus::Failure,
                    other => other,
                };
                self.settle_child(child, status)
            }
            DecoratorNode::Repeat { count } => {
                let param = self.context(uid).require_parse::<i64>(*NUM_CYCLES);
                let cycles = match param {
                    Ok(cycles) => cycles,
                    Err(err) => {
                        self.record_error(uid, err);
                        return NodeStatus::Failure;
                    }
                };
                if cycles == 0 {
                    return NodeStatus::Success;
                }
                match self.tick_node(child) {
                    NodeStatus::Success => {
                        self.halt_node(child);
                        *count += 1;
                        if cycles < 0 || *count < cycles {
                            // The next cycle starts on the next tick.
                            NodeStatus::Running
                        } else {
                            *count = 0;
                            NodeStatus::Success
                        }
                    }
                    NodeStatus::Running => NodeStatus::Running,
                    NodeStatus::Idle => {
                        *count = 0;
                        self.settle_child(child, NodeStatus::Failure)
                    }
                    other => {
                        *count = 0;
                        self.settle_child(child, other)
                    }
                }
            }
            DecoratorNode::Retry { count } => {
                let param = self.context(uid).require_parse::<i64>(*NUM_ATTEMPTS);
                let attempts = match param {
                    Ok(attempts) => attempts,
                    Err(err) => {
                        self.record_error(uid, err);
                        return NodeStatus::Failure;
                    }
                };
                if attempts == 0 {
                    return NodeStatus::Failure;
                }
                match self.tick_node(child) {
                    NodeStatus::Failure | NodeStatus::Idle => {
                        self.halt_node(child);
                        *count += 1;
                        if attempts < 0 || *count < attempts {
                            NodeStatus::Running
                        } else {
                            *count = 0;
                            NodeStatus::Failure
                        }
                    }
                    NodeStatus::Running => NodeStatus::Running,
                    other => {
                        *count = 0;
                        self.settle_child(child, other)
                    }
                }
            }
            DecoratorNode::Timeout { started } => {
                let param = self.context(uid).require_parse::<u64>(*MSEC);
                let msec = match param {
                    Ok(msec) => msec,
                    Err(err) => {
                        self.record_error(uid, err);
                        return NodeStatus::Failure;
                    }
                };
                let start = *started.get_or_insert_with(Instant::now);
                if start.elapsed() >= Duration::from_millis(msec) {
                    *started = None;
                    self.halt_node(child);
                    return NodeStatus::Failure;
                }
                let status = self.tick_node(child);
                if status != NodeStatus::Running {
                    *started = None;
                }
                self.settle_child(child, status)
            }
        }
    }
}
