//! Builtin node types.
//!
//! Control and decorator nodes are a closed set of variants ticked by the tree
//! itself, since they need to tick, halt and reset their children in the arena.
//! Builtin leaves are ordinary [`crate::BehaviorNode`] implementations.

mod control;
mod decorator;
mod leaf;

pub(crate) use self::control::ControlNode;
pub(crate) use self::decorator::DecoratorNode;
pub use self::leaf::{AlwaysFailure, AlwaysSuccess, IsTrue, SetBool};

use crate::{NodeStatus, NodeUid, Tree};

impl Tree {
    /// Resets a child that finished, so it starts from IDLE the next time it is ticked.
    fn settle_child(&mut self, child: NodeUid, status: NodeStatus) -> NodeStatus {
        if status != NodeStatus::Running {
            self.halt_node(child);
        }
        status
    }
}

#[cfg(test)]
mod test;
