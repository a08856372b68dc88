use crate::{
    node::Behavior,
    nodes::{AlwaysFailure, AlwaysSuccess, ControlNode, DecoratorNode, IsTrue, SetBool},
    BehaviorNode, NodeKind,
};
use std::collections::HashMap;

/// Creates a fresh instance of a user-defined leaf node.
pub type LeafConstructor = Box<dyn Fn() -> Box<dyn BehaviorNode> + Send + Sync>;

pub fn boxify<T>(cons: impl (Fn() -> T) + Send + Sync + 'static) -> LeafConstructor
where
    T: BehaviorNode + 'static,
{
    Box::new(move || Box::new(cons()))
}

pub(crate) enum Constructor {
    Leaf { kind: NodeKind, build: LeafConstructor },
    Control(fn() -> ControlNode),
    Decorator(fn() -> DecoratorNode),
}

/// Maps node type names of a tree source to constructors.
///
/// The default registry knows the builtin control and decorator nodes and a few
/// utility leaves. Registering a name again replaces the previous constructor.
pub struct Registry {
    node_types: HashMap<String, Constructor>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut ret = Self {
            node_types: HashMap::new(),
        };
        ret.register_control("Sequence", ControlNode::sequence);
        ret.register_control("ReactiveSequence", || ControlNode::ReactiveSequence);
        ret.register_control("Fallback", ControlNode::fallback);
        ret.register_control("ReactiveFallback", || ControlNode::ReactiveFallback);
        ret.register_control("Parallel", || ControlNode::Parallel);
        ret.register_control("IfThenElse", || ControlNode::IfThenElse { condition: None });
        ret.register_control("if", || ControlNode::IfThenElse { condition: None });
        ret.register_decorator("Inverter", || DecoratorNode::Inverter);
        ret.register_decorator("ForceSuccess", || DecoratorNode::ForceSuccess);
        ret.register_decorator("ForceFailure", || DecoratorNode::ForceFailure);
        ret.register_decorator("Repeat", DecoratorNode::repeat);
        ret.register_decorator("Retry", DecoratorNode::retry);
        ret.register_decorator("Timeout", DecoratorNode::timeout);
        ret.register("AlwaysSuccess", boxify(|| AlwaysSuccess));
        ret.register("AlwaysFailure", boxify(|| AlwaysFailure));
        ret.register("SetBool", boxify(|| SetBool));
        ret.register_condition("IsTrue", boxify(|| IsTrue));
        ret
    }
}

impl Registry {
    /// Registers an action node type.
    pub fn register(&mut self, type_name: impl ToString, constructor: LeafConstructor) {
        self.node_types.insert(
            type_name.to_string(),
            Constructor::Leaf {
                kind: NodeKind::Action,
                build: constructor,
            },
        );
    }

    /// Registers a condition node type. Conditions are leaves too; the kind only
    /// shows up in the published topology.
    pub fn register_condition(&mut self, type_name: impl ToString, constructor: LeafConstructor) {
        self.node_types.insert(
            type_name.to_string(),
            Constructor::Leaf {
                kind: NodeKind::Condition,
                build: constructor,
            },
        );
    }

    fn register_control(&mut self, type_name: &str, constructor: fn() -> ControlNode) {
        self.node_types
            .insert(type_name.to_owned(), Constructor::Control(constructor));
    }

    fn register_decorator(&mut self, type_name: &str, constructor: fn() -> DecoratorNode) {
        self.node_types
            .insert(type_name.to_owned(), Constructor::Decorator(constructor));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.node_types.contains_key(type_name)
    }

    /// Registered type names, in no particular order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.node_types.keys().map(String::as_str)
    }

    pub(crate) fn build(&self, type_name: &str) -> Option<(NodeKind, Behavior)> {
        self.node_types
            .get(type_name)
            .map(|constructor| match constructor {
                Constructor::Leaf { kind, build } => (*kind, Behavior::Leaf(build())),
                Constructor::Control(build) => (NodeKind::Control, Behavior::Control(build())),
                Constructor::Decorator(build) => {
                    (NodeKind::Decorator, Behavior::Decorator(build()))
                }
            })
    }
}
