use crate::{
    blackboard::ScopeId,
    nodes::{ControlNode, DecoratorNode},
    BBMap, BlackboardValue, Context, NodeKind, NodeStatus, NumChildren, PortSpec, TickResult,
};

/// Identity of a node within a tree. Equal to its index in the node arena,
/// assigned in depth-first pre-order when the tree is loaded.
pub type NodeUid = u16;

/// A leaf node: an action or a condition.
///
/// `tick` returns `Running` for work that does not complete synchronously;
/// the node is then ticked again in the next cycle until it returns a
/// completed status or is halted.
/// An `Err` is reported through [`crate::Tree::take_errors`] and the node
/// counts as `Failure` for this cycle.
pub trait BehaviorNode: Send {
    fn provided_ports(&self) -> Vec<PortSpec> {
        vec![]
    }

    fn tick(&mut self, ctx: &mut Context) -> TickResult;

    /// Abandon the work started by a previous `Running` tick.
    /// Must return promptly, even if the work is carried out by another thread.
    fn halt(&mut self) {}
}

/// What a node does when ticked.
pub(crate) enum Behavior {
    Leaf(Box<dyn BehaviorNode>),
    Control(ControlNode),
    Decorator(DecoratorNode),
    SubTree,
    /// Placeholder while the behavior is taken out of the arena to be ticked.
    Vacant,
}

impl Behavior {
    pub(crate) fn provided_ports(&self) -> Vec<PortSpec> {
        match self {
            Self::Leaf(node) => node.provided_ports(),
            Self::Control(control) => control.provided_ports(),
            Self::Decorator(decorator) => decorator.provided_ports(),
            Self::SubTree | Self::Vacant => vec![],
        }
    }

    pub(crate) fn min_children(&self) -> usize {
        match self {
            Self::Control(control) => control.min_children(),
            Self::Decorator(_) | Self::SubTree => 1,
            Self::Leaf(_) | Self::Vacant => 0,
        }
    }

    pub(crate) fn max_children(&self) -> NumChildren {
        match self {
            Self::Control(control) => control.max_children(),
            Self::Decorator(decorator) => decorator.max_children(),
            Self::SubTree => NumChildren::Finite(1),
            Self::Leaf(_) | Self::Vacant => NumChildren::Finite(0),
        }
    }
}

/// Guards evaluated before a node leaves IDLE.
#[derive(Default, Debug, Clone)]
pub(crate) struct Preconditions {
    pub(crate) failure_if: Option<BlackboardValue>,
    pub(crate) success_if: Option<BlackboardValue>,
    pub(crate) skip_if: Option<BlackboardValue>,
}

impl Preconditions {
    pub(crate) fn is_empty(&self) -> bool {
        self.failure_if.is_none() && self.success_if.is_none() && self.skip_if.is_none()
    }

    /// In evaluation order, with the status each guard forces.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&BlackboardValue, NodeStatus)> {
        [
            (self.failure_if.as_ref(), NodeStatus::Failure),
            (self.success_if.as_ref(), NodeStatus::Success),
            (self.skip_if.as_ref(), NodeStatus::Skipped),
        ]
        .into_iter()
        .filter_map(|(guard, status)| guard.map(|guard| (guard, status)))
    }
}

pub(crate) struct NodeSlot {
    pub(crate) uid: NodeUid,
    pub(crate) name: String,
    pub(crate) registration_name: String,
    pub(crate) kind: NodeKind,
    pub(crate) behavior: Behavior,
    pub(crate) children: Vec<NodeUid>,
    pub(crate) parent: Option<NodeUid>,
    pub(crate) status: NodeStatus,
    pub(crate) ports: Vec<PortSpec>,
    pub(crate) blackboard_map: BBMap,
    pub(crate) scope: ScopeId,
    pub(crate) preconditions: Preconditions,
}

impl NodeSlot {
    pub(crate) fn info(&self) -> NodeInfo<'_> {
        NodeInfo {
            uid: self.uid,
            name: &self.name,
            registration_name: &self.registration_name,
            kind: self.kind,
            status: self.status,
        }
    }
}

/// Read-only view of a node, handed to loggers and tree walkers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo<'a> {
    pub uid: NodeUid,
    pub name: &'a str,
    pub registration_name: &'a str,
    pub kind: NodeKind,
    pub status: NodeStatus,
}
