//! Breakpoints and status overrides keyed by node uid.
//!
//! The ticking thread consults the table before and after each node's tick.
//! A breakpoint parks that thread on a condition variable until the monitor
//! unlocks it or the hook gets disabled; disabling every hook is therefore the
//! way to release a blocked tree, and is what losing the heartbeat and dropping
//! the publisher do.

use crate::{NodeStatus, NodeUid};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    PreTick,
    PostTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookMode {
    /// Blocks the ticking thread until unlocked.
    #[default]
    Breakpoint,
    /// Forces `desired_status` without blocking.
    Replace,
}

/// A hook as it is inserted and dumped over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    pub position: Position,
    pub uid: NodeUid,
    #[serde(default)]
    pub mode: HookMode,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// IDLE means "run the node's own logic".
    #[serde(default)]
    pub desired_status: NodeStatus,
    #[serde(default)]
    pub remove_when_done: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl HookSpec {
    pub fn breakpoint(position: Position, uid: NodeUid) -> Self {
        Self {
            position,
            uid,
            mode: HookMode::Breakpoint,
            enabled: true,
            desired_status: NodeStatus::Idle,
            remove_when_done: false,
        }
    }

    pub fn replace(position: Position, uid: NodeUid, status: NodeStatus) -> Self {
        Self {
            mode: HookMode::Replace,
            desired_status: status,
            ..Self::breakpoint(position, uid)
        }
    }
}

#[derive(Debug)]
struct HookState {
    enabled: bool,
    /// Set by an unlock, consumed by the blocked thread.
    ready: bool,
    desired_status: NodeStatus,
    remove_when_done: bool,
    waiting: bool,
}

struct Hook {
    mode: HookMode,
    state: Mutex<HookState>,
    wakeup: Condvar,
}

impl Hook {
    fn lock(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type ReachedCallback = Box<dyn Fn(Position, NodeUid) + Send + Sync>;

#[derive(Default)]
pub struct HookTable {
    hooks: Mutex<BTreeMap<(Position, NodeUid), Arc<Hook>>>,
    on_reached: RwLock<Option<ReachedCallback>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<(Position, NodeUid), Arc<Hook>>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, position: Position, uid: NodeUid) -> Option<Arc<Hook>> {
        self.table().get(&(position, uid)).cloned()
    }

    /// Called from the ticking thread whenever a breakpoint is hit, before it blocks.
    pub fn set_on_reached(&self, callback: impl Fn(Position, NodeUid) + Send + Sync + 'static) {
        *self
            .on_reached
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Returns false if a hook already exists at the address.
    pub fn insert(&self, spec: HookSpec) -> bool {
        let mut table = self.table();
        let key = (spec.position, spec.uid);
        if table.contains_key(&key) {
            return false;
        }
        table.insert(
            key,
            Arc::new(Hook {
                mode: spec.mode,
                state: Mutex::new(HookState {
                    enabled: spec.enabled,
                    ready: false,
                    desired_status: spec.desired_status,
                    remove_when_done: spec.remove_when_done,
                    waiting: false,
                }),
                wakeup: Condvar::new(),
            }),
        );
        true
    }

    /// Removes the hook, releasing a thread blocked on it.
    pub fn remove(&self, position: Position, uid: NodeUid) -> bool {
        let removed = self.table().remove(&(position, uid));
        match removed {
            Some(hook) => {
                hook.lock().enabled = false;
                hook.wakeup.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        let removed = std::mem::take(&mut *self.table());
        for hook in removed.values() {
            hook.lock().enabled = false;
            hook.wakeup.notify_all();
        }
    }

    /// Disabling releases every blocked thread, which then runs the node's own logic.
    pub fn enable_all(&self, enabled: bool) {
        let hooks: Vec<_> = self.table().values().cloned().collect();
        for hook in hooks {
            hook.lock().enabled = enabled;
            hook.wakeup.notify_all();
        }
        debug!(enabled, "all hooks toggled");
    }

    /// Releases a breakpoint with the given result. IDLE lets the node run its logic.
    /// Returns false if there is no such hook.
    pub fn unlock(
        &self,
        position: Position,
        uid: NodeUid,
        result: NodeStatus,
        remove_when_done: bool,
    ) -> bool {
        let Some(hook) = self.find(position, uid) else {
            return false;
        };
        {
            let mut state = hook.lock();
            state.ready = true;
            state.desired_status = result;
            state.remove_when_done = remove_when_done;
        }
        hook.wakeup.notify_all();
        true
    }

    pub fn get(&self, position: Position, uid: NodeUid) -> Option<HookSpec> {
        let hook = self.find(position, uid)?;
        let state = hook.lock();
        Some(HookSpec {
            position,
            uid,
            mode: hook.mode,
            enabled: state.enabled,
            desired_status: state.desired_status,
            remove_when_done: state.remove_when_done,
        })
    }

    /// All hooks ordered by position, then uid.
    pub fn dump(&self) -> Vec<HookSpec> {
        let keys: Vec<_> = self.table().keys().copied().collect();
        keys.into_iter()
            .filter_map(|(position, uid)| self.get(position, uid))
            .collect()
    }

    /// Whether a thread is currently parked on the hook.
    pub fn is_blocked(&self, position: Position, uid: NodeUid) -> bool {
        self.find(position, uid)
            .map_or(false, |hook| hook.lock().waiting)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Runs the hook at the address, if any. `Some(status)` replaces the node's own result.
    pub(crate) fn run(&self, position: Position, uid: NodeUid) -> Option<NodeStatus> {
        let hook = self.find(position, uid)?;
        let mut state = hook.lock();
        if !state.enabled {
            return None;
        }
        let (status, remove) = match hook.mode {
            HookMode::Replace => (state.desired_status, state.remove_when_done),
            HookMode::Breakpoint => {
                state.ready = false;
                state.waiting = true;
                drop(state);
                self.notify_reached(position, uid);

                let mut state = hook.lock();
                while !state.ready && state.enabled {
                    state = hook
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                state.waiting = false;
                let unlocked = std::mem::take(&mut state.ready);
                if !unlocked {
                    // Released by disabling: the node runs as if there was no hook.
                    return None;
                }
                (state.desired_status, state.remove_when_done)
            }
        };
        if remove {
            self.remove_if_same(position, uid, &hook);
        }
        (status != NodeStatus::Idle).then_some(status)
    }

    fn notify_reached(&self, position: Position, uid: NodeUid) {
        let callback = self.on_reached.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = callback.as_ref() {
            callback(position, uid);
        }
    }

    /// Removes the hook unless it was replaced in the meantime.
    fn remove_if_same(&self, position: Position, uid: NodeUid, hook: &Arc<Hook>) {
        let mut table = self.table();
        if table
            .get(&(position, uid))
            .map_or(false, |current| Arc::ptr_eq(current, hook))
        {
            table.remove(&(position, uid));
        }
    }
}
