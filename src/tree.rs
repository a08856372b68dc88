use crate::{
    blackboard::{BlackboardMirror, Blackboards, ROOT_SCOPE},
    error::TickError,
    logger::StatusChangeLogger,
    monitor::{HookTable, Position},
    node::{Behavior, NodeSlot},
    BehaviorNode, BlackboardValue, Context, NodeInfo, NodeStatus, NodeUid, Symbol,
};
use std::{
    any::Any,
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{error, warn};

const MAX_PENDING_ERRORS: usize = 256;

/// An instantiated behavior tree.
///
/// The tree owns every node in an arena indexed by uid, the blackboard scopes,
/// the status change loggers and, when a publisher is attached, the hook table
/// consulted before and after each node's tick.
pub struct Tree {
    nodes: Vec<NodeSlot>,
    blackboards: Blackboards,
    loggers: Vec<Arc<dyn StatusChangeLogger>>,
    hooks: Option<Arc<HookTable>>,
    mirror: Option<Arc<BlackboardMirror>>,
    /// Blackboard version last copied into `mirror`.
    mirrored: Option<u64>,
    errors: VecDeque<(NodeUid, TickError)>,
}

impl Tree {
    /// `nodes` must be non-empty, in uid order, with the root at index 0.
    pub(crate) fn from_parts(nodes: Vec<NodeSlot>, blackboards: Blackboards) -> Self {
        debug_assert!(!nodes.is_empty());
        debug_assert!(nodes
            .iter()
            .enumerate()
            .all(|(index, node)| node.uid as usize == index));
        Self {
            nodes,
            blackboards,
            loggers: vec![],
            hooks: None,
            mirror: None,
            mirrored: None,
            errors: VecDeque::new(),
        }
    }

    pub fn root_uid(&self) -> NodeUid {
        0
    }

    pub fn root_status(&self) -> NodeStatus {
        self.nodes[0].status
    }

    /// Number of nodes, which is also one past the greatest uid.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, uid: NodeUid) -> Option<NodeInfo<'_>> {
        self.nodes.get(uid as usize).map(NodeSlot::info)
    }

    /// All nodes in uid order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeInfo<'_>> {
        self.nodes.iter().map(NodeSlot::info)
    }

    pub fn status(&self, uid: NodeUid) -> Option<NodeStatus> {
        self.nodes.get(uid as usize).map(|node| node.status)
    }

    pub fn children(&self, uid: NodeUid) -> &[NodeUid] {
        self.nodes
            .get(uid as usize)
            .map_or(&[], |node| node.children.as_slice())
    }

    pub fn parent(&self, uid: NodeUid) -> Option<NodeUid> {
        self.nodes.get(uid as usize).and_then(|node| node.parent)
    }

    /// First node with the given instance name, in uid order.
    pub fn find_by_name(&self, name: &str) -> Option<NodeUid> {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .map(|node| node.uid)
    }

    pub(crate) fn slots(&self) -> &[NodeSlot] {
        &self.nodes
    }

    pub fn blackboards(&self) -> &Blackboards {
        &self.blackboards
    }

    pub fn blackboards_mut(&mut self) -> &mut Blackboards {
        &mut self.blackboards
    }

    /// Writes to the root blackboard.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<Symbol>, val: T) {
        self.blackboards.set(ROOT_SCOPE, key, val);
        self.sync_mirror();
    }

    /// Reads from the root blackboard.
    pub fn get<T: 'static>(&self, key: impl Into<Symbol>) -> Option<&T> {
        self.blackboards.get(ROOT_SCOPE, key)
    }

    /// Subscribes a logger to status changes. Loggers are called in registration order.
    pub fn add_logger(&mut self, logger: Arc<dyn StatusChangeLogger>) {
        self.loggers.push(logger);
    }

    pub fn loggers(&self) -> &[Arc<dyn StatusChangeLogger>] {
        &self.loggers
    }

    pub fn set_hooks(&mut self, hooks: Option<Arc<HookTable>>) {
        self.hooks = hooks;
    }

    pub fn hooks(&self) -> Option<&Arc<HookTable>> {
        self.hooks.as_ref()
    }

    /// Keeps `mirror` updated with a copy of the blackboards, starting now.
    pub fn set_blackboard_mirror(&mut self, mirror: Option<Arc<BlackboardMirror>>) {
        self.mirror = mirror;
        self.mirrored = None;
        self.sync_mirror();
    }

    pub fn blackboard_mirror(&self) -> Option<&Arc<BlackboardMirror>> {
        self.mirror.as_ref()
    }

    /// Copies the blackboards into the mirror if they changed since the last copy.
    pub fn sync_mirror(&mut self) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        let version = self.blackboards.version();
        if self.mirrored != Some(version) {
            mirror.store(&self.blackboards);
            self.mirrored = Some(version);
        }
    }

    /// Moves loggers, hooks and the blackboard mirror over to a tree replacing this one.
    pub(crate) fn hand_over_observers(&mut self, successor: &mut Tree) {
        successor.loggers = std::mem::take(&mut self.loggers);
        successor.hooks = self.hooks.take();
        successor.set_blackboard_mirror(self.mirror.take());
        self.mirrored = None;
    }

    /// Lets buffered loggers persist what they hold. Safe to call any number of times.
    pub fn flush_loggers(&self) {
        for logger in &self.loggers {
            if catch_unwind(AssertUnwindSafe(|| logger.flush())).is_err() {
                warn!(logger = logger.name(), "status change logger panicked in flush");
            }
        }
    }

    /// Drains the errors raised by nodes since the last call.
    pub fn take_errors(&mut self) -> Vec<(NodeUid, TickError)> {
        self.errors.drain(..).collect()
    }

    /// Ticks the root once.
    ///
    /// If the previous tick completed the tree, the tree is reset to IDLE first,
    /// so every call after a completed one starts a new run.
    pub fn tick_once(&mut self) -> NodeStatus {
        let root = self.root_uid();
        if !matches!(self.root_status(), NodeStatus::Idle | NodeStatus::Running) {
            self.halt_node(root);
        }
        let status = self.tick_node(root);
        self.sync_mirror();
        status
    }

    /// Ticks until the root returns something other than `Running`, sleeping between ticks.
    pub fn tick_while_running(&mut self, sleep: Duration) -> NodeStatus {
        let mut status = self.tick_once();
        while status == NodeStatus::Running {
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
            status = self.tick_once();
        }
        status
    }

    /// Halts every running node and resets the whole tree to IDLE.
    pub fn halt_tree(&mut self) {
        self.halt_node(self.root_uid());
        self.sync_mirror();
    }

    pub(crate) fn tick_node(&mut self, uid: NodeUid) -> NodeStatus {
        let index = uid as usize;
        let prev = self.nodes[index].status;

        if prev == NodeStatus::Idle {
            if let Some(status) = self.check_preconditions(uid) {
                self.set_status(uid, status);
                return status;
            }
        }

        let hooks = self.hooks.clone();
        if hooks.is_some() {
            // A breakpoint may hold this thread; let the monitor see the current values.
            self.sync_mirror();
        }
        if let Some(forced) = hooks.as_ref().and_then(|hooks| hooks.run(Position::PreTick, uid)) {
            if prev == NodeStatus::Running {
                self.halt_node(uid);
            }
            self.set_status(uid, forced);
            return forced;
        }

        let mut behavior = std::mem::replace(&mut self.nodes[index].behavior, Behavior::Vacant);
        let status = match &mut behavior {
            Behavior::Leaf(node) => self.tick_leaf(uid, node.as_mut()),
            Behavior::Control(control) => {
                self.set_status(uid, NodeStatus::Running);
                self.tick_control(uid, control)
            }
            Behavior::Decorator(decorator) => {
                self.set_status(uid, NodeStatus::Running);
                self.tick_decorator(uid, decorator)
            }
            Behavior::SubTree => {
                self.set_status(uid, NodeStatus::Running);
                self.tick_subtree(uid)
            }
            Behavior::Vacant => {
                self.record_error(
                    uid,
                    TickError::Failed("node ticked again from within its own tick".to_owned()),
                );
                NodeStatus::Failure
            }
        };
        self.nodes[index].behavior = behavior;

        if hooks.is_some() {
            self.sync_mirror();
        }
        let status = hooks
            .as_ref()
            .and_then(|hooks| hooks.run(Position::PostTick, uid))
            .unwrap_or(status);
        self.set_status(uid, status);
        status
    }

    fn tick_leaf(&mut self, uid: NodeUid, node: &mut dyn BehaviorNode) -> NodeStatus {
        let result = {
            let slot = &self.nodes[uid as usize];
            let mut ctx = Context::new(
                &mut self.blackboards,
                slot.scope,
                &slot.blackboard_map,
                uid,
                &slot.name,
            );
            catch_unwind(AssertUnwindSafe(|| node.tick(&mut ctx)))
                .unwrap_or_else(|panic| Err(TickError::Panicked(panic_message(panic.as_ref()))))
        };
        match result {
            Ok(NodeStatus::Idle) => {
                let node = self.nodes[uid as usize].name.clone();
                self.record_error(uid, TickError::IdleReturned { node });
                NodeStatus::Failure
            }
            Ok(status) => status,
            Err(err) => {
                self.record_error(uid, err);
                NodeStatus::Failure
            }
        }
    }

    fn tick_subtree(&mut self, uid: NodeUid) -> NodeStatus {
        let Some(&child) = self.nodes[uid as usize].children.first() else {
            return NodeStatus::Failure;
        };
        let status = self.tick_node(child);
        if status.is_completed() || status == NodeStatus::Skipped {
            self.halt_node(child);
        }
        status
    }

    fn check_preconditions(&mut self, uid: NodeUid) -> Option<NodeStatus> {
        let slot = &self.nodes[uid as usize];
        if slot.preconditions.is_empty() {
            return None;
        }
        slot.preconditions.iter().find_map(|(guard, status)| {
            let holds = match guard {
                BlackboardValue::Literal(literal) => parse_bool(literal),
                BlackboardValue::Ref(key, _) => {
                    self.blackboards.get::<bool>(slot.scope, *key).copied().or_else(|| {
                        self.blackboards
                            .get::<String>(slot.scope, *key)
                            .and_then(|text| parse_bool(text))
                    })
                }
            };
            // An unresolvable guard does not hold.
            holds.unwrap_or(false).then_some(status)
        })
    }

    /// Resets the node and everything below it to IDLE, halting running leaves depth first.
    pub(crate) fn halt_node(&mut self, uid: NodeUid) {
        let index = uid as usize;
        for i in 0..self.nodes[index].children.len() {
            let child = self.nodes[index].children[i];
            self.halt_node(child);
        }
        let was_running = self.nodes[index].status == NodeStatus::Running;
        match &mut self.nodes[index].behavior {
            Behavior::Leaf(node) if was_running => {
                if catch_unwind(AssertUnwindSafe(|| node.halt())).is_err() {
                    error!(uid, "node panicked while being halted");
                }
            }
            Behavior::Control(control) => control.reset(),
            Behavior::Decorator(decorator) => decorator.reset(),
            _ => (),
        }
        self.set_status(uid, NodeStatus::Idle);
    }

    pub(crate) fn halt_child(&mut self, uid: NodeUid, index: usize) {
        if let Some(&child) = self.nodes[uid as usize].children.get(index) {
            self.halt_node(child);
        }
    }

    pub(crate) fn halt_children(&mut self, uid: NodeUid) {
        for i in 0..self.nodes[uid as usize].children.len() {
            self.halt_child(uid, i);
        }
    }

    pub(crate) fn child(&self, uid: NodeUid, index: usize) -> Option<NodeUid> {
        self.nodes[uid as usize].children.get(index).copied()
    }

    pub(crate) fn num_children(&self, uid: NodeUid) -> usize {
        self.nodes[uid as usize].children.len()
    }

    /// The blackboard view of a control or decorator node, used to read its parameters.
    pub(crate) fn context(&mut self, uid: NodeUid) -> Context<'_> {
        let slot = &self.nodes[uid as usize];
        Context::new(
            &mut self.blackboards,
            slot.scope,
            &slot.blackboard_map,
            uid,
            &slot.name,
        )
    }

    pub(crate) fn set_status(&mut self, uid: NodeUid, status: NodeStatus) {
        let slot = &mut self.nodes[uid as usize];
        let prev = slot.status;
        if prev == status {
            return;
        }
        slot.status = status;
        if self.loggers.is_empty() {
            return;
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let info = self.nodes[uid as usize].info();
        for logger in &self.loggers {
            if !logger.is_enabled() {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| {
                logger.callback(timestamp, &info, prev, status)
            }))
            .is_err()
            {
                warn!(
                    logger = logger.name(),
                    uid, "status change logger panicked; transition not recorded"
                );
            }
        }
    }

    pub(crate) fn record_error(&mut self, uid: NodeUid, err: TickError) {
        let node = &self.nodes[uid as usize];
        error!(uid, node = %node.name, error = %err, "node tick failed");
        if self.errors.len() >= MAX_PENDING_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back((uid, err));
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "true" | "True" | "TRUE" | "1" => Some(true),
        "false" | "False" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
