//! Runs a small tree behind a publisher until interrupted.
//!
//! ```text
//! cargo run --example demo_server [publisher.yaml]
//! ```
//!
//! The tree waits for remote commands: connect `demo_client`, or any client of
//! the monitoring protocol, and send START.

use ::behavior_tree_monitor::{
    boxify,
    monitor::{Publisher, PublisherConfig, RunControl},
    load_yaml, BehaviorNode, Context, HaltToken, Job, NodeStatus, PortSpec, Registry, Runner,
    ThreadedAction, TickResult, TracingLogger,
};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::info;

const TREE: &str = r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: SayHello
        name: greet
      - type: Fallback
        children:
        - type: IsTrue
          name: door_open
          ports:
            input: "{door_open}"
        - type: Sequence
          children:
          - type: Sleep
            name: walk_to_door
            ports:
              msec: "500"
          - type: SetBool
            name: open_door
            ports:
              value: "true"
              output: "{door_open}"
      - type: Sleep
        name: pass_door
        ports:
          msec: "1000"
"#;

struct SayHello;

impl BehaviorNode for SayHello {
    fn tick(&mut self, ctx: &mut Context) -> TickResult {
        info!(node = ctx.name(), "hello");
        Ok(NodeStatus::Success)
    }
}

/// Waits `msec` milliseconds on a worker thread.
fn sleep_action() -> ThreadedAction {
    ThreadedAction::new(|ctx: &mut Context| {
        let msec = ctx.require_parse::<u64>("msec")?;
        let job: Job = Box::new(move |token: HaltToken| {
            let deadline = Instant::now() + Duration::from_millis(msec);
            while Instant::now() < deadline {
                if token.is_halted() {
                    return NodeStatus::Failure;
                }
                thread::sleep(Duration::from_millis(10));
            }
            NodeStatus::Success
        });
        Ok(job)
    })
    .with_ports(vec![PortSpec::new_in("msec")])
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PublisherConfig::from_file(path)?,
        None => PublisherConfig::default(),
    };

    let mut registry = Registry::default();
    registry.register("SayHello", boxify(|| SayHello));
    registry.register("Sleep", boxify(sleep_action));
    let registry = Arc::new(registry);

    let mut tree = load_yaml(TREE, &registry)?;
    tree.add_logger(Arc::new(TracingLogger::new()));

    let control = Arc::new(RunControl::from_config(&config));
    let publisher = Publisher::new(&mut tree, config, control.clone(), Some(registry.clone()))?;
    info!(
        reply_port = publisher.reply_port(),
        publish_port = publisher.publish_port(),
        "waiting for a monitor"
    );

    let mut runner = Runner::new(tree, control, registry).with_publisher(publisher);
    runner.run(|_| true);
    Ok(())
}
