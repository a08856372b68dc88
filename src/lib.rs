//! # behavior-tree-monitor (Rust crate)
//!
//! A behavior tree execution engine with a remote monitoring protocol.
//!
//!
//! ## Overview
//!
//! This crate grew out of behavior-tree-lite, inspired by [BehaviorTreeCPP](https://github.com/BehaviorTree/BehaviorTree.CPP.git).
//! On top of the tick engine it implements the observability side of BehaviorTreeCPP:
//! a publisher that lets an external monitor download the tree topology, poll the
//! status of every node, fetch a compact log of status transitions, put breakpoints
//! on nodes and start, suspend or stop the execution remotely.
//!
//! A behavior tree is an extension to finite state machines that makes describing transitional behavior easier.
//! See [BehaviorTreeCPP's documentation](https://www.behaviortree.dev/) for the thorough introduction to the idea.
//!
//!
//! ## How it looks like
//!
//! Leaf nodes are ordinary Rust types implementing [`BehaviorNode`].
//! They talk to each other through the blackboard, by reading and writing ports.
//!
//! ```rust
//! use ::behavior_tree_monitor::{BehaviorNode, Context, NodeStatus, PortSpec, TickResult};
//!
//! struct PrintArm;
//!
//! impl BehaviorNode for PrintArm {
//!     fn provided_ports(&self) -> Vec<PortSpec> {
//!         vec![PortSpec::new_in("arm")]
//!     }
//!
//!     fn tick(&mut self, ctx: &mut Context) -> TickResult {
//!         let arm = ctx.require::<String>("arm")?;
//!         println!("arm: {arm}");
//!         Ok(NodeStatus::Success)
//!     }
//! }
//! ```
//!
//! Node types are registered to a [`Registry`], which is then used to
//! instantiate a tree from a YAML description.
//! Control and decorator nodes (`Sequence`, `Fallback`, `Parallel`, `Repeat`, ...)
//! are registered by default.
//!
//! ```rust
//! # use ::behavior_tree_monitor::*;
//! # struct PrintArm;
//! # impl BehaviorNode for PrintArm { fn tick(&mut self, _: &mut Context) -> TickResult { Ok(NodeStatus::Success) } }
//! let mut registry = Registry::default();
//! registry.register("PrintArm", boxify(|| PrintArm));
//!
//! let source = r#"
//! trees:
//!   main:
//!     root:
//!       type: Sequence
//!       children:
//!       - type: PrintArm
//!         ports:
//!           arm: "{left_arm}"
//!       - type: PrintArm
//!         ports:
//!           arm: "{right_arm}"
//! "#;
//!
//! let mut tree = load_yaml(source, &registry).unwrap();
//! tree.set("left_arm", "leftArm".to_string());
//! tree.set("right_arm", "rightArm".to_string());
//! assert_eq!(tree.tick_once(), NodeStatus::Success);
//! ```
//!
//! ### Port mapping
//!
//! A port value in braces, like `"{left_arm}"`, refers to a blackboard entry.
//! Anything else is a string literal, which can be read with [`Context::get_parse`].
//! `"{=}"` maps the port to the blackboard entry of the same name.
//!
//! ### Subtrees
//!
//! A node whose type names another tree of the source instantiates that tree
//! as a subtree.
//! A subtree has its own blackboard scope; entries of the parent scope are only
//! visible through the ports remapped by the subtree node, unless the tree
//! definition sets `autoremap: true`.
//!
//! ```yaml
//! trees:
//!   main:
//!     root:
//!       type: Sequence
//!       children:
//!       - type: Calculate
//!         ports:
//!           input: "42"
//!           output: "{result}"
//!   Calculate:
//!     ports:
//!     - { name: input, direction: in }
//!     - { name: output, direction: out }
//!     root:
//!       type: Multiply
//!       ports:
//!         lhs: "{input}"
//!         result: "{output}"
//! ```
//!
//! ### Preconditions
//!
//! Any node can carry the guards `_skipIf`, `_failureIf` and `_successIf`,
//! naming a boolean blackboard entry (`"{flag}"`) or a literal.
//! They are evaluated only when the node is about to start, and when one holds
//! the node returns `Skipped`, `Failure` or `Success` without running its logic.
//!
//!
//! ## Remote monitoring
//!
//! A [`monitor::Publisher`] attaches to a tree and serves a binary
//! request/reply protocol on a TCP port, plus a publish port for streamed
//! status and breakpoint notifications.
//! The tree keeps ticking on its own thread; the publisher only ever sees
//! snapshots that the tree pushes through the status change logger bus.
//! See the [`monitor`] module for the message catalog.
//!
//! A [`Runner`] drives the tree according to the remote run state
//! (`STOPPED`, `RUNNING`, `SUSPENDED`, `SUCCESS`, `WAIT_AUTH`).
//!
//!
//! ## Historical notes
//!
//! This is a descendant of behavior-tree-lite, which in turn is a sister project of
//! [tiny-behavior-tree](https://github.com/msakuta/rusty_tiny_behavior_tree).
//! behavior-tree-lite stored nodes as a tree of boxed trait objects, which
//! makes addressing a node from outside (a breakpoint, a status poll) awkward.
//! Here the nodes live in an arena indexed by their uid, control flow nodes are
//! a closed set of variants dispatched by `match`, and only leaf nodes are
//! user-defined trait objects.

mod action;
mod blackboard;
mod context;
pub mod error;
mod logger;
pub mod monitor;
mod node;
mod nodes;
pub mod parser;
mod port;
mod registry;
mod runner;
mod symbol;
mod tree;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

pub use crate::action::{HaltToken, Job, Stateful, StatefulAction, ThreadedAction};
pub use crate::blackboard::{BlackboardMirror, Blackboards, EntryInfo, ScopeId};
pub use crate::context::Context;
pub use crate::error::{LoadError, TickError, TickResult};
pub use crate::logger::{StatusChangeLogger, TracingLogger};
pub use crate::node::{BehaviorNode, NodeInfo, NodeUid};
pub use crate::nodes::{AlwaysFailure, AlwaysSuccess, IsTrue, SetBool};
pub use crate::parser::{load, load_yaml, NodeDef, TreeDef, TreePortDef, TreeSource};
pub use crate::port::{PortSpec, PortType};
pub use crate::registry::{boxify, LeafConstructor, Registry};
pub use crate::runner::Runner;
pub use crate::symbol::Symbol;
pub use crate::tree::Tree;
pub use ::once_cell::sync::*;

/// Status of a node, as stored in the tree and reported on the wire.
///
/// The discriminants are the status bytes of the monitoring protocol.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum NodeStatus {
    /// Not started, or reset by the parent.
    #[default]
    Idle = 0,
    /// The node should keep running in the next tick
    Running = 1,
    Success = 2,
    Failure = 3,
    /// Pruned by a precondition without being evaluated.
    Skipped = 4,
}

impl NodeStatus {
    pub fn is_completed(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failure)
    }

    /// Running, or finished in this cycle. Such a node needs a reset before a new run.
    pub fn is_active(self) -> bool {
        !matches!(self, NodeStatus::Idle)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => NodeStatus::Idle,
            1 => NodeStatus::Running,
            2 => NodeStatus::Success,
            3 => NodeStatus::Failure,
            4 => NodeStatus::Skipped,
            _ => return None,
        })
    }
}

impl Display for NodeStatus {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        fmt.write_str(match self {
            NodeStatus::Idle => "IDLE",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Success => "SUCCESS",
            NodeStatus::Failure => "FAILURE",
            NodeStatus::Skipped => "SKIPPED",
        })
    }
}

/// Capability tag of a node.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Action,
    Condition,
    Control,
    Decorator,
    SubTree,
}

/// A port binding: either a reference to a blackboard entry or a literal string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlackboardValue {
    Ref(Symbol, PortType),
    Literal(String),
}

impl BlackboardValue {
    /// Parses a port value of a tree source.
    /// `{key}` is a reference, `{=}` refers to the port's own name, anything else is a literal.
    pub fn parse(port: &str, value: &str, ty: PortType) -> Self {
        let trimmed = value.trim();
        if let Some(inner) = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
        {
            let key = inner.trim();
            if key == "=" {
                Self::Ref(port.into(), ty)
            } else {
                Self::Ref(key.into(), ty)
            }
        } else {
            Self::Literal(value.to_owned())
        }
    }
}

impl Display for BlackboardValue {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Ref(key, _) => write!(fmt, "{{{key}}}"),
            Self::Literal(value) => fmt.write_str(value),
        }
    }
}

impl From<&str> for BlackboardValue {
    fn from(s: &str) -> Self {
        Self::Literal(s.to_owned())
    }
}

/// Port name to blackboard binding of a single node.
pub type BBMap = HashMap<Symbol, BlackboardValue>;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum NumChildren {
    Finite(usize),
    Infinite,
}

impl PartialOrd for NumChildren {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(match (self, other) {
            (NumChildren::Finite(_), NumChildren::Infinite) => std::cmp::Ordering::Less,
            (NumChildren::Infinite, NumChildren::Finite(_)) => std::cmp::Ordering::Greater,
            (NumChildren::Finite(lhs), NumChildren::Finite(rhs)) => lhs.cmp(rhs),
            (NumChildren::Infinite, NumChildren::Infinite) => return None,
        })
    }
}

#[macro_export]
macro_rules! hash_map {
    () => {
        std::collections::HashMap::default()
    };
    ($($name: literal => $val: expr),+ $(,)?) => {{
        let mut ret = std::collections::HashMap::default();
        $(ret.insert($name.into(), $val.into());)+
        ret
    }};
}
