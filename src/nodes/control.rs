use crate::{error::TickError, Lazy, NodeStatus, NodeUid, NumChildren, PortSpec, Symbol, Tree};

static SUCCESS_COUNT: Lazy<Symbol> = Lazy::new(|| "success_count".into());
static FAILURE_COUNT: Lazy<Symbol> = Lazy::new(|| "failure_count".into());

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanState {
    current_child: usize,
    skipped: usize,
}

/// Composite nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlNode {
    /// Ticks children in order, resuming at the running one.
    Sequence(ScanState),
    /// Like Sequence, but restarts from the first child on every tick.
    ReactiveSequence,
    Fallback(ScanState),
    ReactiveFallback,
    /// Ticks all children and compares the results to `success_count` / `failure_count`.
    Parallel,
    /// Condition, then-branch and an optional else-branch.
    /// The condition result is remembered while the chosen branch is running.
    IfThenElse { condition: Option<NodeStatus> },
}

impl ControlNode {
    pub(crate) fn sequence() -> Self {
        Self::Sequence(ScanState::default())
    }

    pub(crate) fn fallback() -> Self {
        Self::Fallback(ScanState::default())
    }

    pub(crate) fn provided_ports(&self) -> Vec<PortSpec> {
        match self {
            Self::Parallel => vec![
                PortSpec::new_in(*SUCCESS_COUNT),
                PortSpec::new_in(*FAILURE_COUNT),
            ],
            _ => vec![],
        }
    }

    pub(crate) fn min_children(&self) -> usize {
        match self {
            Self::IfThenElse { .. } => 2,
            _ => 1,
        }
    }

    pub(crate) fn max_children(&self) -> NumChildren {
        match self {
            Self::IfThenElse { .. } => NumChildren::Finite(3),
            _ => NumChildren::Infinite,
        }
    }

    pub(crate) fn reset(&mut self) {
        match self {
            Self::Sequence(state) | Self::Fallback(state) => *state = ScanState::default(),
            Self::IfThenElse { condition } => *condition = None,
            Self::ReactiveSequence | Self::ReactiveFallback | Self::Parallel => (),
        }
    }
}

impl Tree {
    pub(crate) fn tick_control(&mut self, uid: NodeUid, node: &mut ControlNode) -> NodeStatus {
        match node {
            ControlNode::Sequence(state) => self.tick_scan(uid, state, NodeStatus::Failure),
            ControlNode::Fallback(state) => self.tick_scan(uid, state, NodeStatus::Success),
            ControlNode::ReactiveSequence => self.tick_reactive(uid, NodeStatus::Failure),
            ControlNode::ReactiveFallback => self.tick_reactive(uid, NodeStatus::Success),
            ControlNode::Parallel => self.tick_parallel(uid),
            ControlNode::IfThenElse { condition } => self.tick_if(uid, condition),
        }
    }

    /// Sequence and Fallback. `stop_on` is the child status that ends the scan early
    /// (FAILURE for a Sequence, SUCCESS for a Fallback); its opposite moves on to the
    /// next child.
    fn tick_scan(&mut self, uid: NodeUid, state: &mut ScanState, stop_on: NodeStatus) -> NodeStatus {
        let num_children = self.num_children(uid);
        while let Some(child) = self.child(uid, state.current_child) {
            match self.tick_node(child) {
                NodeStatus::Running => return NodeStatus::Running,
                NodeStatus::Skipped => {
                    state.current_child += 1;
                    state.skipped += 1;
                }
                NodeStatus::Idle => {
                    self.halt_children(uid);
                    *state = ScanState::default();
                    return NodeStatus::Failure;
                }
                status if status == stop_on => {
                    self.halt_children(uid);
                    *state = ScanState::default();
                    return stop_on;
                }
                _ => state.current_child += 1,
            }
        }
        let all_skipped = num_children > 0 && state.skipped == num_children;
        self.halt_children(uid);
        *state = ScanState::default();
        if all_skipped {
            NodeStatus::Skipped
        } else {
            opposite(stop_on)
        }
    }

    fn tick_reactive(&mut self, uid: NodeUid, stop_on: NodeStatus) -> NodeStatus {
        let num_children = self.num_children(uid);
        let mut skipped = 0;
        for index in 0..num_children {
            let Some(child) = self.child(uid, index) else {
                break;
            };
            match self.tick_node(child) {
                NodeStatus::Running => {
                    // Everything else restarts from IDLE on the next tick.
                    for other in (0..num_children).filter(|other| *other != index) {
                        self.halt_child(uid, other);
                    }
                    return NodeStatus::Running;
                }
                NodeStatus::Skipped => skipped += 1,
                NodeStatus::Idle => {
                    self.halt_children(uid);
                    return NodeStatus::Failure;
                }
                status if status == stop_on => {
                    self.halt_children(uid);
                    return stop_on;
                }
                _ => (),
            }
        }
        self.halt_children(uid);
        if num_children > 0 && skipped == num_children {
            NodeStatus::Skipped
        } else {
            opposite(stop_on)
        }
    }

    fn tick_parallel(&mut self, uid: NodeUid) -> NodeStatus {
        let (success_count, failure_count) = {
            let ctx = self.context(uid);
            (
                ctx.get_parse::<i32>(*SUCCESS_COUNT),
                ctx.get_parse::<i32>(*FAILURE_COUNT),
            )
        };
        let num_children = self.num_children(uid);

        // Children that completed earlier in this run keep their status until the reset.
        for index in 0..num_children {
            let Some(child) = self.child(uid, index) else {
                break;
            };
            if matches!(
                self.status(child),
                Some(NodeStatus::Idle | NodeStatus::Running)
            ) {
                self.tick_node(child);
            }
        }

        let (mut successes, mut failures, mut skipped) = (0, 0, 0);
        for index in 0..num_children {
            match self.child(uid, index).and_then(|child| self.status(child)) {
                Some(NodeStatus::Success) => successes += 1,
                Some(NodeStatus::Failure) => failures += 1,
                Some(NodeStatus::Skipped) => skipped += 1,
                _ => (),
            }
        }

        let effective = num_children - skipped;
        if num_children > 0 && effective == 0 {
            self.halt_children(uid);
            return NodeStatus::Skipped;
        }
        let success_threshold = threshold(success_count.unwrap_or(-1), effective);
        if success_threshold > effective {
            self.record_error(
                uid,
                TickError::Failed(format!(
                    "success_count {success_threshold} exceeds the {effective} children"
                )),
            );
        }

        // Success is checked first: when both thresholds are reached in the same
        // tick, the parallel node succeeds.
        if successes >= success_threshold {
            self.halt_children(uid);
            return NodeStatus::Success;
        }
        let hopeless = failures + success_threshold > effective;
        let too_many_failures = failure_count
            .map(|count| failures >= threshold(count, effective))
            .unwrap_or(false);
        if hopeless || too_many_failures {
            self.halt_children(uid);
            return NodeStatus::Failure;
        }
        NodeStatus::Running
    }

    fn tick_if(&mut self, uid: NodeUid, condition: &mut Option<NodeStatus>) -> NodeStatus {
        let condition_result = match *condition {
            Some(result) => result,
            None => match self.child(uid, 0) {
                Some(child) => self.tick_node(child),
                None => NodeStatus::Failure,
            },
        };
        if condition_result == NodeStatus::Running {
            return NodeStatus::Running;
        }

        // Remember the last conditional result in case the branch returns Running
        *condition = Some(condition_result);

        let branch_result = match condition_result {
            NodeStatus::Success => match self.child(uid, 1) {
                Some(child) => self.tick_node(child),
                None => NodeStatus::Failure,
            },
            // Be aware that lack of else clause is not an error, so the result is Success.
            NodeStatus::Failure => match self.child(uid, 2) {
                Some(child) => self.tick_node(child),
                None => NodeStatus::Success,
            },
            other => other,
        };

        if branch_result != NodeStatus::Running {
            self.halt_children(uid);
            *condition = None;
        }
        branch_result
    }
}

fn opposite(status: NodeStatus) -> NodeStatus {
    match status {
        NodeStatus::Success => NodeStatus::Failure,
        _ => NodeStatus::Success,
    }
}

/// Negative thresholds count from the number of children: -1 means all of them.
fn threshold(value: i32, num_children: usize) -> usize {
    if value < 0 {
        (num_children as i64 + value as i64 + 1).max(0) as usize
    } else {
        value as usize
    }
}
