use crate::{
    monitor::{Publisher, RunControl, RunState},
    parser::load,
    NodeStatus, Registry, Tree,
};
use std::{sync::Arc, thread, time::Duration};
use tracing::{error, info, warn};

/// Ticks a tree as the remote run state dictates.
///
/// RUNNING ticks the tree once per [`Runner::step`]. SUSPENDED leaves it as it
/// is, RUNNING nodes included. STOPPED and WAIT_AUTH halt it. A completed run
/// moves the run state to SUCCESS or STOPPED.
///
/// A START that does not resume a suspended run begins from scratch, first
/// swapping in a topology accepted by UPDATE_MODE if there is one.
pub struct Runner {
    tree: Tree,
    control: Arc<RunControl>,
    publisher: Option<Publisher>,
    registry: Arc<Registry>,
    tick_period: Duration,
    generation: u64,
}

impl Runner {
    pub fn new(tree: Tree, control: Arc<RunControl>, registry: Arc<Registry>) -> Self {
        let generation = control.generation();
        Self {
            tree,
            control,
            publisher: None,
            registry,
            tick_period: Duration::from_millis(10),
            generation,
        }
    }

    /// The publisher must have been created on this runner's tree.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    pub fn control(&self) -> &Arc<RunControl> {
        &self.control
    }

    /// Does one cycle of work and returns the run state it acted on.
    pub fn step(&mut self) -> RunState {
        let state = self.control.state();
        match state {
            RunState::Running => {
                let generation = self.control.generation();
                if generation != self.generation {
                    self.generation = generation;
                    self.begin_run();
                }
                let status = self.tree.tick_once();
                let outcome = match status {
                    NodeStatus::Running | NodeStatus::Idle => None,
                    // A root pruned by its own precondition has nothing left to do.
                    NodeStatus::Success | NodeStatus::Skipped => Some(NodeStatus::Success),
                    NodeStatus::Failure => Some(NodeStatus::Failure),
                };
                if let Some(outcome) = outcome {
                    if let Some(next) = self.control.finish(outcome) {
                        info!(%status, state = %next, "run finished");
                    }
                    self.tree.flush_loggers();
                }
            }
            RunState::Stopped | RunState::WaitAuth => {
                if self.tree.root_status().is_active() {
                    self.tree.halt_tree();
                    self.tree.flush_loggers();
                }
            }
            RunState::Suspended | RunState::Success => {}
        }
        state
    }

    /// Steps until `keep_going` returns false, sleeping the tick period in between.
    pub fn run(&mut self, mut keep_going: impl FnMut(&Self) -> bool) {
        while keep_going(self) {
            self.step();
            thread::sleep(self.tick_period);
        }
        self.tree.halt_tree();
        self.tree.flush_loggers();
    }

    fn begin_run(&mut self) {
        let pending = self
            .publisher
            .as_ref()
            .and_then(Publisher::take_pending_topology);
        if let Some(source) = pending {
            match load(&source, &self.registry, true) {
                Ok(mut tree) => {
                    self.tree.halt_tree();
                    self.tree.hand_over_observers(&mut tree);
                    self.tree = tree;
                    if let Some(publisher) = &self.publisher {
                        if let Err(err) = publisher.refresh(&self.tree) {
                            warn!(error = %err, "failed to publish the new topology");
                        }
                    }
                    info!(nodes = self.tree.len(), "switched to the updated topology");
                }
                Err(err) => {
                    error!(error = %err, "updated topology no longer loads; keeping the current tree")
                }
            }
        }
        if self.tree.root_status().is_active() {
            self.tree.halt_tree();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::load_yaml;

    const SOURCE: &str = r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: AlwaysSuccess
      - type: IsTrue
        ports:
          input: "{go}"
"#;

    fn runner() -> Runner {
        let registry = Arc::new(Registry::default());
        let tree = load_yaml(SOURCE, &registry).unwrap();
        Runner::new(tree, Arc::new(RunControl::new()), registry)
    }

    #[test]
    fn test_idle_until_started() {
        let mut runner = runner();
        assert_eq!(runner.step(), RunState::Stopped);
        assert_eq!(runner.tree().root_status(), NodeStatus::Idle);
    }

    #[test]
    fn test_success_and_failure_end_the_run() {
        let mut runner = runner();
        runner.tree_mut().set("go", true);
        runner.control().start().unwrap();
        assert_eq!(runner.step(), RunState::Running);
        assert_eq!(runner.control().state(), RunState::Success);
        assert_eq!(runner.tree().root_status(), NodeStatus::Success);

        // SUCCESS keeps the final statuses visible.
        runner.step();
        assert_eq!(runner.tree().root_status(), NodeStatus::Success);

        runner.tree_mut().set("go", false);
        runner.control().start().unwrap();
        runner.step();
        assert_eq!(runner.control().state(), RunState::Stopped);
        assert_eq!(runner.tree().root_status(), NodeStatus::Failure);
        runner.step();
        assert_eq!(runner.tree().root_status(), NodeStatus::Idle);
    }

    #[test]
    fn test_run_stops_when_told() {
        let mut runner = runner();
        runner.tree_mut().set("go", true);
        runner.control().start().unwrap();
        let mut steps = 0;
        runner.run(|_| {
            steps += 1;
            steps <= 3
        });
        assert_eq!(steps, 4);
        assert_eq!(runner.control().state(), RunState::Success);
        assert_eq!(runner.tree().root_status(), NodeStatus::Idle);
    }
}
