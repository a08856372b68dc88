//! Helpers for actions that do not complete within a single tick.
//!
//! Such an action returns `Running` and is ticked again in the next cycle.
//! Its `halt` may be called at any time between ticks and must return promptly,
//! even while work started by the action is still in flight on another thread.

use crate::{
    tree::panic_message, BehaviorNode, Context, NodeStatus, PortSpec, TickError, TickResult,
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::warn;

/// How long dropping a [`ThreadedAction`] waits for halted workers to exit.
const DROP_GRACE: Duration = Duration::from_secs(1);

/// Cancellation flag shared between a node and the work it started.
#[derive(Clone, Debug, Default)]
pub struct HaltToken(Arc<AtomicBool>);

impl HaltToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn halt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// An action split into the callbacks of its lifecycle.
/// Wrap it in [`Stateful`] to get a [`BehaviorNode`].
pub trait StatefulAction: Send {
    fn provided_ports(&self) -> Vec<PortSpec> {
        vec![]
    }

    /// Called on the first tick out of IDLE.
    fn on_start(&mut self, ctx: &mut Context) -> TickResult;

    /// Called on every tick after `on_start` returned `Running`.
    fn on_running(&mut self, ctx: &mut Context) -> TickResult;

    /// Called when the action is halted while running.
    fn on_halted(&mut self) {}
}

pub struct Stateful<T> {
    action: T,
    running: bool,
}

impl<T> Stateful<T> {
    pub fn new(action: T) -> Self {
        Self {
            action,
            running: false,
        }
    }

    pub fn inner(&self) -> &T {
        &self.action
    }
}

impl<T: StatefulAction> BehaviorNode for Stateful<T> {
    fn provided_ports(&self) -> Vec<PortSpec> {
        self.action.provided_ports()
    }

    fn tick(&mut self, ctx: &mut Context) -> TickResult {
        let result = if self.running {
            self.action.on_running(ctx)
        } else {
            self.action.on_start(ctx)
        };
        self.running = matches!(result, Ok(NodeStatus::Running));
        result
    }

    fn halt(&mut self) {
        if std::mem::take(&mut self.running) {
            self.action.on_halted();
        }
    }
}

/// Work handed to a worker thread. It should poll the token and return early once halted.
pub type Job = Box<dyn FnOnce(HaltToken) -> NodeStatus + Send>;

type Outcome = Result<NodeStatus, String>;

struct Worker {
    token: HaltToken,
    outcome: Arc<Mutex<Option<Outcome>>>,
    handle: JoinHandle<()>,
}

/// Runs the action's work on a thread of its own.
///
/// The first tick calls `prepare` on the ticking thread, where it can read its
/// inputs from the blackboard, and spawns the returned job; the node reports
/// `Running` until the job returns. `halt` only signals the job's [`HaltToken`];
/// the thread is joined later, once it has exited.
pub struct ThreadedAction {
    prepare: Box<dyn FnMut(&mut Context) -> TickResult<Job> + Send>,
    ports: Vec<PortSpec>,
    worker: Option<Worker>,
    halted: Vec<JoinHandle<()>>,
}

impl ThreadedAction {
    pub fn new(prepare: impl FnMut(&mut Context) -> TickResult<Job> + Send + 'static) -> Self {
        Self {
            prepare: Box::new(prepare),
            ports: vec![],
            worker: None,
            halted: vec![],
        }
    }

    pub fn with_ports(mut self, ports: Vec<PortSpec>) -> Self {
        self.ports = ports;
        self
    }

    /// Whether a job is in flight. Halted jobs that have not exited yet do not count.
    pub fn is_busy(&self) -> bool {
        self.worker.is_some()
    }

    fn reap(&mut self) {
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.halted)
            .into_iter()
            .partition(|handle| handle.is_finished());
        self.halted = pending;
        for handle in finished {
            // The outcome of a halted job is discarded.
            let _ = handle.join();
        }
    }

    fn spawn(&mut self, name: &str, job: Job) -> TickResult<()> {
        let token = HaltToken::new();
        let outcome = Arc::new(Mutex::new(None));
        let handle = std::thread::Builder::new()
            .name(format!("bt-{name}"))
            .spawn({
                let token = token.clone();
                let outcome = outcome.clone();
                move || {
                    let result = catch_unwind(AssertUnwindSafe(|| job(token)))
                        .map_err(|panic| panic_message(panic.as_ref()));
                    *outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
                }
            })
            .map_err(|err| TickError::Failed(format!("failed to spawn worker: {err}")))?;
        self.worker = Some(Worker {
            token,
            outcome,
            handle,
        });
        Ok(())
    }
}

impl BehaviorNode for ThreadedAction {
    fn provided_ports(&self) -> Vec<PortSpec> {
        self.ports.clone()
    }

    fn tick(&mut self, ctx: &mut Context) -> TickResult {
        self.reap();
        let done = self.worker.as_ref().map(|worker| {
            worker
                .outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        });
        match done {
            Some(None) => Ok(NodeStatus::Running),
            Some(Some(outcome)) => {
                if let Some(worker) = self.worker.take() {
                    let _ = worker.handle.join();
                }
                outcome.map_err(TickError::Panicked)
            }
            None => {
                let job = (self.prepare)(ctx)?;
                self.spawn(ctx.name(), job)?;
                Ok(NodeStatus::Running)
            }
        }
    }

    fn halt(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.token.halt();
            self.halted.push(worker.handle);
        }
        self.reap();
    }
}

impl Drop for ThreadedAction {
    fn drop(&mut self) {
        self.halt();
        let deadline = Instant::now() + DROP_GRACE;
        while !self.halted.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
            self.reap();
        }
        if !self.halted.is_empty() {
            warn!(
                workers = self.halted.len(),
                "worker threads ignored their halt token; leaving them detached"
            );
        }
    }
}
