use crate::{
    boxify, load_yaml, BehaviorNode, Context, NodeStatus, PortSpec, Registry, TickError,
    TickResult, Tree,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Returns the status named by its `status` port and counts its ticks in `ticks`.
struct Scripted {
    halts: Arc<AtomicUsize>,
}

impl BehaviorNode for Scripted {
    fn provided_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new_in("status"), PortSpec::new_inout("ticks")]
    }

    fn tick(&mut self, ctx: &mut Context) -> TickResult {
        let ticks = ctx.get::<usize>("ticks").copied().unwrap_or(0);
        ctx.set("ticks", ticks + 1)?;
        let status = ctx.require_parse::<String>("status")?;
        Ok(match status.as_str() {
            "SUCCESS" => NodeStatus::Success,
            "FAILURE" => NodeStatus::Failure,
            "RUNNING" => NodeStatus::Running,
            other => return Err(TickError::Failed(format!("bad status {other}"))),
        })
    }

    fn halt(&mut self) {
        self.halts.fetch_add(1, Ordering::Relaxed);
    }
}

struct Fixture {
    tree: Tree,
    halts: Arc<AtomicUsize>,
}

impl Fixture {
    fn new(yaml: &str) -> Self {
        let halts = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::default();
        let shared = halts.clone();
        registry.register(
            "Scripted",
            boxify(move || Scripted {
                halts: shared.clone(),
            }),
        );
        let tree = load_yaml(yaml, &registry).unwrap();
        Self { tree, halts }
    }

    fn ticks(&self, key: &str) -> usize {
        self.tree.get::<usize>(key).copied().unwrap_or(0)
    }

    fn halts(&self) -> usize {
        self.halts.load(Ordering::Relaxed)
    }

    fn set_status(&mut self, key: &str, status: &str) {
        self.tree.set(key, status.to_owned());
    }
}

#[test]
fn test_sequence_resumes_running_child() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: Scripted
        ports: { status: SUCCESS, ticks: "{a}" }
      - type: Scripted
        ports: { status: "{b_status}", ticks: "{b}" }
"#,
    );
    fx.set_status("b_status", "RUNNING");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    assert_eq!((fx.ticks("a"), fx.ticks("b")), (1, 2));

    fx.set_status("b_status", "FAILURE");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert_eq!((fx.ticks("a"), fx.ticks("b")), (1, 3));
    assert!(fx.tree.nodes().skip(1).all(|node| node.status == NodeStatus::Idle));

    // A new run starts over from the first child.
    fx.set_status("b_status", "SUCCESS");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!((fx.ticks("a"), fx.ticks("b")), (2, 4));
}

#[test]
fn test_sequence_stops_at_failure() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: Scripted
        ports: { status: FAILURE, ticks: "{a}" }
      - type: Scripted
        ports: { status: SUCCESS, ticks: "{b}" }
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert_eq!((fx.ticks("a"), fx.ticks("b")), (1, 0));
}

#[test]
fn test_reactive_sequence() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: ReactiveSequence
      children:
      - type: Scripted
        ports: { status: "{condition}", ticks: "{a}" }
      - type: Scripted
        ports: { status: RUNNING, ticks: "{b}" }
"#,
    );
    fx.set_status("condition", "SUCCESS");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    // The condition is re-evaluated every tick.
    assert_eq!((fx.ticks("a"), fx.ticks("b")), (2, 2));

    fx.set_status("condition", "FAILURE");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert_eq!(fx.halts(), 1);
    assert_eq!(fx.tree.status(2), Some(NodeStatus::Idle));
}

#[test]
fn test_reactive_fallback_halts_running_sibling() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: ReactiveFallback
      children:
      - type: Scripted
        ports: { status: "{condition}", ticks: "{a}" }
      - type: Scripted
        ports: { status: RUNNING, ticks: "{b}" }
"#,
    );
    fx.set_status("condition", "FAILURE");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    fx.set_status("condition", "SUCCESS");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!(fx.halts(), 1);
    assert_eq!(fx.ticks("b"), 1);
}

#[test]
fn test_fallback() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Fallback
      children:
      - type: Scripted
        ports: { status: FAILURE, ticks: "{a}" }
      - type: Scripted
        ports: { status: SUCCESS, ticks: "{b}" }
      - type: Scripted
        ports: { status: SUCCESS, ticks: "{c}" }
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!((fx.ticks("a"), fx.ticks("b"), fx.ticks("c")), (1, 1, 0));
}

#[test]
fn test_parallel_success_wins_tie() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Parallel
      ports: { success_count: "1", failure_count: "1" }
      children:
      - type: AlwaysFailure
      - type: AlwaysSuccess
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
}

#[test]
fn test_parallel_does_not_retick_completed_children() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Parallel
      children:
      - type: Scripted
        ports: { status: SUCCESS, ticks: "{a}" }
      - type: Scripted
        ports: { status: "{b_status}", ticks: "{b}" }
"#,
    );
    fx.set_status("b_status", "RUNNING");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    fx.set_status("b_status", "SUCCESS");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!((fx.ticks("a"), fx.ticks("b")), (1, 3));
}

#[test]
fn test_parallel_failure_thresholds() {
    // With the default success_count of all children, one failure is enough.
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Parallel
      children:
      - type: AlwaysFailure
      - type: Scripted
        ports: { status: RUNNING, ticks: "{b}" }
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert_eq!(fx.halts(), 1);

    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Parallel
      ports: { success_count: "1", failure_count: "2" }
      children:
      - type: AlwaysFailure
      - type: Scripted
        ports: { status: "{b_status}", ticks: "{b}" }
      - type: Scripted
        ports: { status: RUNNING, ticks: "{c}" }
"#,
    );
    fx.set_status("b_status", "RUNNING");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    fx.set_status("b_status", "FAILURE");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    // The still running third child was halted.
    assert_eq!(fx.halts(), 1);
}

#[test]
fn test_parallel_without_failure_count() {
    // Only failing once success became unreachable: N - success_count + 1 failures.
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Parallel
      ports: { success_count: "1" }
      children:
      - type: AlwaysFailure
      - type: Scripted
        ports: { status: "{b_status}", ticks: "{b}" }
      - type: Scripted
        ports: { status: "{c_status}", ticks: "{c}" }
"#,
    );
    fx.set_status("b_status", "RUNNING");
    fx.set_status("c_status", "RUNNING");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    fx.set_status("b_status", "FAILURE");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    fx.set_status("c_status", "FAILURE");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert_eq!((fx.ticks("b"), fx.ticks("c")), (2, 3));
}

#[test]
fn test_if_then_else() {
    let source = |condition: &str, with_else: bool| {
        let mut yaml = format!(
            r#"
trees:
  main:
    root:
      type: IfThenElse
      children:
      - type: {condition}
      - type: Scripted
        ports: {{ status: SUCCESS, ticks: "{{then}}" }}
"#
        );
        if with_else {
            yaml += r#"      - type: Scripted
        ports: { status: FAILURE, ticks: "{else}" }
"#;
        }
        yaml
    };

    let mut fx = Fixture::new(&source("AlwaysSuccess", true));
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!((fx.ticks("then"), fx.ticks("else")), (1, 0));

    let mut fx = Fixture::new(&source("AlwaysFailure", true));
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert_eq!((fx.ticks("then"), fx.ticks("else")), (0, 1));

    let mut fx = Fixture::new(&source("AlwaysFailure", false));
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!(fx.ticks("then"), 0);
}

#[test]
fn test_inverter_and_force() {
    for (decorator, child, expected) in [
        ("Inverter", "AlwaysSuccess", NodeStatus::Failure),
        ("Inverter", "AlwaysFailure", NodeStatus::Success),
        ("ForceSuccess", "AlwaysFailure", NodeStatus::Success),
        ("ForceFailure", "AlwaysSuccess", NodeStatus::Failure),
    ] {
        let mut fx = Fixture::new(&format!(
            "trees:\n  main:\n    root:\n      type: {decorator}\n      children:\n      - type: {child}\n"
        ));
        assert_eq!(fx.tree.tick_once(), expected, "{decorator}({child})");
        assert_eq!(fx.tree.status(1), Some(NodeStatus::Idle));
    }

    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Inverter
      children:
      - type: Scripted
        ports: { status: RUNNING }
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
}

#[test]
fn test_repeat_yields_between_cycles() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Repeat
      ports: { num_cycles: "3" }
      children:
      - type: Scripted
        ports: { status: SUCCESS, ticks: "{a}" }
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!(fx.ticks("a"), 3);

    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Repeat
      ports: { num_cycles: "0" }
      children:
      - type: Scripted
        ports: { status: SUCCESS, ticks: "{a}" }
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!(fx.ticks("a"), 0);
}

#[test]
fn test_repeat_without_cycles_fails() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Repeat
      children:
      - type: AlwaysSuccess
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert!(matches!(
        fx.tree.take_errors().as_slice(),
        [(0, TickError::MissingInput { .. })]
    ));
}

#[test]
fn test_retry() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Retry
      ports: { num_attempts: "2" }
      children:
      - type: Scripted
        ports: { status: "{status}", ticks: "{a}" }
"#,
    );
    fx.set_status("status", "FAILURE");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert_eq!(fx.ticks("a"), 2);

    // Success on the second attempt.
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    fx.set_status("status", "SUCCESS");
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
    assert_eq!(fx.ticks("a"), 4);
}

#[test]
fn test_timeout() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Timeout
      ports: { msec: "20" }
      children:
      - type: Scripted
        ports: { status: RUNNING, ticks: "{a}" }
"#,
    );
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);
    assert_eq!(fx.halts(), 1);
    assert_eq!(fx.ticks("a"), 1);

    // The deadline starts over with the next run.
    assert_eq!(fx.tree.tick_once(), NodeStatus::Running);
}

#[test]
fn test_skipped_children() {
    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: AlwaysFailure
        _skipIf: "true"
      - type: AlwaysFailure
        _skipIf: "{skip}"
"#,
    );
    fx.tree.set("skip", true);
    assert_eq!(fx.tree.tick_once(), NodeStatus::Skipped);

    fx.tree.set("skip", false);
    assert_eq!(fx.tree.tick_once(), NodeStatus::Failure);

    let mut fx = Fixture::new(
        r#"
trees:
  main:
    root:
      type: Parallel
      children:
      - type: AlwaysFailure
        _skipIf: "true"
      - type: AlwaysSuccess
"#,
    );
    // The skipped child does not count towards "all children".
    assert_eq!(fx.tree.tick_once(), NodeStatus::Success);
}
