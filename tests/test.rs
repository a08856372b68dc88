use behavior_tree_monitor::{
    boxify,
    error::ClientError,
    load_yaml,
    monitor::{
        HookSpec, MonitorClient, MonitorSubscriber, Notification, Position, PortRegistry,
        Publisher, PublisherConfig, RequestHeader, RequestType, ResultCode, RunControl, RunState,
        UnlockRequest,
    },
    BehaviorNode, Context, NodeStatus, Registry, Runner, TickResult, Tree,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct Count(Arc<AtomicUsize>);

impl BehaviorNode for Count {
    fn tick(&mut self, _ctx: &mut Context) -> TickResult {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(NodeStatus::Success)
    }
}

struct Spin;

impl BehaviorNode for Spin {
    fn tick(&mut self, _ctx: &mut Context) -> TickResult {
        Ok(NodeStatus::Running)
    }
}

/// Returns RUNNING a fixed number of times before succeeding.
struct Busy {
    left: usize,
    ticks: Arc<AtomicUsize>,
}

impl BehaviorNode for Busy {
    fn tick(&mut self, _ctx: &mut Context) -> TickResult {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        if self.left == 0 {
            return Ok(NodeStatus::Success);
        }
        self.left -= 1;
        Ok(NodeStatus::Running)
    }
}

fn registry(counter: &Arc<AtomicUsize>) -> Registry {
    let mut registry = Registry::default();
    let counter = counter.clone();
    registry.register("Count", boxify(move || Count(counter.clone())));
    registry.register("Spin", boxify(|| Spin));
    registry
}

fn config() -> PublisherConfig {
    PublisherConfig::default()
        .with_bind_address("127.0.0.1")
        .with_server_port(0)
}

fn publish(tree: &mut Tree, config: PublisherConfig, registry: Option<Arc<Registry>>) -> Publisher {
    Publisher::with_ports(
        tree,
        config,
        Arc::new(RunControl::new()),
        registry,
        &PortRegistry::new(),
    )
    .unwrap()
}

fn client(publisher: &Publisher) -> MonitorClient {
    MonitorClient::connect(("127.0.0.1", publisher.reply_port()), TIMEOUT).unwrap()
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

const THREE_COUNTS: &str = r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: Count
      - type: Count
      - type: Count
"#;

#[test]
fn test_sequence() {
    let counter = Arc::new(AtomicUsize::new(0));
    let registry = registry(&counter);
    let mut tree = load_yaml(THREE_COUNTS, &registry).unwrap();
    assert_eq!(tree.tick_once(), NodeStatus::Success);
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    let failing = r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: Count
      - type: AlwaysFailure
      - type: Count
"#;
    counter.store(0, Ordering::SeqCst);
    let mut tree = load_yaml(failing, &registry).unwrap();
    assert_eq!(tree.tick_once(), NodeStatus::Failure);
    // Children after the failing one are never ticked.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sequence_resumes_at_running_child() {
    let condition_ticks = Arc::new(AtomicUsize::new(0));
    let action_ticks = Arc::new(AtomicUsize::new(0));
    let mut registry = registry(&condition_ticks);
    let ticks = action_ticks.clone();
    registry.register(
        "Busy",
        boxify(move || Busy {
            left: 1,
            ticks: ticks.clone(),
        }),
    );
    let source = r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: Count
      - type: Busy
"#;
    let mut tree = load_yaml(source, &registry).unwrap();
    assert_eq!(tree.tick_once(), NodeStatus::Running);
    assert_eq!(tree.tick_once(), NodeStatus::Success);
    assert_eq!(condition_ticks.load(Ordering::SeqCst), 1);
    assert_eq!(action_ticks.load(Ordering::SeqCst), 2);

    // Halting is idempotent and leaves everything IDLE.
    tree.halt_tree();
    tree.halt_tree();
    assert!(tree.nodes().all(|node| node.status == NodeStatus::Idle));
}

#[test]
fn test_breakpoint_unlock_forces_result() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let registry = registry(&counter);
    let mut tree = load_yaml(THREE_COUNTS, &registry).unwrap();
    let publisher = publish(&mut tree, config(), None);
    let mut client = client(&publisher);
    let mut subscriber =
        MonitorSubscriber::connect(("127.0.0.1", publisher.publish_port()), TIMEOUT).unwrap();
    // The first notification proves the subscription is in place.
    assert!(subscriber.recv(TIMEOUT).unwrap().is_some());

    client
        .insert_hook(&HookSpec::breakpoint(Position::PreTick, 3))
        .unwrap();
    let ticker = thread::spawn(move || {
        let status = tree.tick_once();
        (tree, status)
    });

    let deadline = Instant::now() + TIMEOUT;
    loop {
        assert!(Instant::now() < deadline, "no breakpoint notification");
        if let Some(Notification::BreakpointReached(address)) =
            subscriber.recv(Duration::from_millis(100)).unwrap()
        {
            assert_eq!((address.position, address.uid), (Position::PreTick, 3));
            break;
        }
    }
    assert!(publisher.hooks().is_blocked(Position::PreTick, 3));
    assert!(!ticker.is_finished());

    client
        .unlock(&UnlockRequest {
            position: Position::PreTick,
            uid: 3,
            desired_status: NodeStatus::Success,
            remove_when_done: true,
        })
        .unwrap();
    let (_tree, status) = ticker.join().unwrap();
    assert_eq!(status, NodeStatus::Success);
    // Node 3's own logic never ran.
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(client.hooks().unwrap().is_empty());

    let (records, _) = client.transitions().unwrap();
    assert!(records
        .iter()
        .any(|record| record.uid == 3 && record.status == NodeStatus::Success));
}

#[test]
fn test_blackboard_visible_at_breakpoint() {
    let counter = Arc::new(AtomicUsize::new(0));
    let registry = registry(&counter);
    let source = r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: SetBool
        ports:
          value: "true"
          output: "{flag}"
      - type: Count
"#;
    let mut tree = load_yaml(source, &registry).unwrap();
    tree.set("speed", 2.5f64);
    let publisher = publish(&mut tree, config(), None);
    let mut client = client(&publisher);

    let scopes = client.blackboards(&[]).unwrap();
    assert_eq!(scopes.len(), 1);
    let keys: Vec<_> = scopes[0].entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["speed"]);

    client
        .insert_hook(&HookSpec::breakpoint(Position::PreTick, 2))
        .unwrap();
    let ticker = thread::spawn(move || {
        let status = tree.tick_once();
        (tree, status)
    });
    wait_until("the breakpoint blocks", || {
        publisher.hooks().is_blocked(Position::PreTick, 2)
    });

    // The write made earlier in the same tick is already visible.
    let scopes = client.blackboards(&["main"]).unwrap();
    let flag = scopes[0]
        .entries
        .iter()
        .find(|entry| entry.key == "flag")
        .unwrap();
    assert_eq!(flag.type_name, "bool");
    assert_eq!(flag.value, Some(serde_json::Value::from(true)));
    assert!(!flag.remapped);

    client
        .unlock(&UnlockRequest {
            position: Position::PreTick,
            uid: 2,
            desired_status: NodeStatus::Idle,
            remove_when_done: true,
        })
        .unwrap();
    let (_tree, status) = ticker.join().unwrap();
    assert_eq!(status, NodeStatus::Success);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropped_publisher_leaves_no_hooks() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut tree = load_yaml(THREE_COUNTS, &registry(&counter)).unwrap();
    let publisher = publish(&mut tree, config(), None);
    assert_eq!(publisher.max_heartbeat_delay(), Duration::from_millis(5000));
    publisher.set_max_heartbeat_delay(Duration::from_millis(250));
    assert_eq!(publisher.max_heartbeat_delay(), Duration::from_millis(250));

    let mut client = client(&publisher);
    client
        .insert_hook(&HookSpec::breakpoint(Position::PreTick, 1))
        .unwrap();
    client.enable_all_hooks(true).unwrap();
    drop(client);
    drop(publisher);

    // The table stays attached to the tree but holds nothing that could block.
    assert!(tree.hooks().unwrap().is_empty());
    assert_eq!(tree.tick_once(), NodeStatus::Success);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn test_heartbeat_loss_releases_breakpoints() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let registry = registry(&counter);
    let mut tree = load_yaml(THREE_COUNTS, &registry).unwrap();
    let publisher = publish(
        &mut tree,
        config().with_max_heartbeat_delay(Duration::from_millis(500)),
        None,
    );
    assert!(publisher
        .hooks()
        .insert(HookSpec::breakpoint(Position::PreTick, 2)));

    let started = Instant::now();
    let ticker = thread::spawn(move || tree.tick_once());
    wait_until("the tree is released", || ticker.is_finished());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(ticker.join().unwrap(), NodeStatus::Success);
    // Released hooks let the node run its own logic.
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert!(!publisher.hooks().get(Position::PreTick, 2).unwrap().enabled);
}

#[test]
fn test_status_reflects_one_forced_node() {
    let counter = Arc::new(AtomicUsize::new(0));
    let registry = registry(&counter);
    let source = r#"
trees:
  main:
    root:
      type: Parallel
      ports:
        success_count: "1"
      children:
      - type: Spin
      - type: Spin
"#;
    let mut tree = load_yaml(source, &registry).unwrap();
    let publisher = publish(&mut tree, config(), None);
    let mut client = client(&publisher);

    assert_eq!(tree.tick_once(), NodeStatus::Running);
    let before = client.status().unwrap();
    assert_eq!(
        before,
        vec![
            (0, NodeStatus::Running),
            (1, NodeStatus::Running),
            (2, NodeStatus::Running)
        ]
    );
    let (records, _) = client.transitions().unwrap();
    assert_eq!(records.len(), 3);
    let (records, _) = client.transitions().unwrap();
    assert!(records.is_empty());

    client
        .insert_hook(&HookSpec::replace(
            Position::PreTick,
            2,
            NodeStatus::Failure,
        ))
        .unwrap();
    assert_eq!(tree.tick_once(), NodeStatus::Running);
    let after = client.status().unwrap();
    let changed: Vec<_> = before
        .iter()
        .zip(&after)
        .filter(|(before, after)| before != after)
        .map(|(_, after)| *after)
        .collect();
    assert_eq!(changed, vec![(2, NodeStatus::Failure)]);
}

#[test]
fn test_remote_run_control() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(registry(&counter));
    let mut tree = load_yaml(THREE_COUNTS, &registry).unwrap();
    let control = Arc::new(RunControl::new());
    let publisher = Publisher::with_ports(
        &mut tree,
        config(),
        control.clone(),
        Some(registry.clone()),
        &PortRegistry::new(),
    )
    .unwrap();
    let mut client = client(&publisher);
    let done = Arc::new(AtomicBool::new(false));
    let runner = {
        let done = done.clone();
        let mut runner = Runner::new(tree, control, registry)
            .with_publisher(publisher)
            .with_tick_period(Duration::from_millis(1));
        thread::spawn(move || runner.run(|_| !done.load(Ordering::Acquire)))
    };

    assert_eq!(client.state().unwrap(), RunState::Stopped);
    assert!(matches!(client.suspend(), Err(ClientError::Remote(_))));
    assert_eq!(client.start().unwrap(), RunState::Running);
    wait_until("the run succeeds", || {
        client.state().unwrap() == RunState::Success
    });
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert!(client
        .status()
        .unwrap()
        .iter()
        .all(|(_, status)| *status == NodeStatus::Success || *status == NodeStatus::Idle));

    assert_eq!(client.stop().unwrap(), RunState::Stopped);
    assert_eq!(client.state().unwrap(), RunState::Stopped);

    done.store(true, Ordering::Release);
    runner.join().unwrap();
}

#[test]
fn test_update_mode_swaps_tree_on_start() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(registry(&counter));
    let mut tree = load_yaml(THREE_COUNTS, &registry).unwrap();
    let control = Arc::new(RunControl::new());
    let publisher = Publisher::with_ports(
        &mut tree,
        config(),
        control.clone(),
        Some(registry.clone()),
        &PortRegistry::new(),
    )
    .unwrap();
    let mut client = client(&publisher);
    let old = client.full_tree().unwrap();
    assert_eq!(old.nodes.len(), 4);

    let done = Arc::new(AtomicBool::new(false));
    let runner = {
        let done = done.clone();
        let mut runner = Runner::new(tree, control, registry)
            .with_publisher(publisher)
            .with_tick_period(Duration::from_millis(1));
        thread::spawn(move || runner.run(|_| !done.load(Ordering::Acquire)))
    };

    assert!(matches!(
        client.update_mode("trees: {main: {root: {type: Nope}}}"),
        Err(ClientError::Remote(message)) if message.contains("Nope")
    ));
    client
        .update_mode("trees:\n  main:\n    root:\n      type: Count\n")
        .unwrap();
    // Nothing changes before the next run.
    assert_eq!(client.full_tree().unwrap().tree_id, old.tree_id);

    client.start().unwrap();
    wait_until("the run succeeds", || {
        client.state().unwrap() == RunState::Success
    });
    let new = client.full_tree().unwrap();
    assert_eq!(new.nodes.len(), 1);
    assert_ne!(new.tree_id, old.tree_id);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    client.start().unwrap();
    assert!(matches!(
        client.update_mode("trees:\n  main:\n    root:\n      type: Count\n"),
        Err(ClientError::Remote(message)) if message.contains("expected STOPPED")
    ));

    done.store(true, Ordering::Release);
    runner.join().unwrap();
}

#[test]
fn test_unknown_request_keeps_connection() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut tree = load_yaml(THREE_COUNTS, &registry(&counter)).unwrap();
    let publisher = publish(&mut tree, config(), None);
    let mut client = client(&publisher);

    let body = client.request(RequestType::Unknown(b'?'), &[]).unwrap();
    assert_eq!(body.len(), 2);
    assert_eq!(body[0].as_ref(), ResultCode::Error.frame().as_slice());
    assert!(String::from_utf8_lossy(&body[1]).contains("request type not recognized"));

    assert_eq!(client.state().unwrap(), RunState::Stopped);
    assert_eq!(client.tree_id(), Some(client.full_tree().unwrap().tree_id_bytes()));
}

#[test]
fn test_client_discards_stale_replies() {
    use behavior_tree_monitor::monitor::{Connection, ReplyHeader};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (done, finished) = std::sync::mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut conn = Connection::new(stream, TIMEOUT, TIMEOUT).unwrap();
        let message = conn.recv().unwrap();
        let request = RequestHeader::decode(&message[0]).unwrap();
        let stale = RequestHeader {
            unique_id: request.unique_id.wrapping_add(100),
            ..request
        };
        conn.send(&[
            ReplyHeader::new(stale, [0; 16]).to_bytes(),
            vec![0],
            b"SUSPENDED".to_vec(),
        ])
        .unwrap();
        conn.send(&[
            ReplyHeader::new(request, [7; 16]).to_bytes(),
            vec![0],
            b"RUNNING".to_vec(),
        ])
        .unwrap();
        // Never answer the second request, but keep the connection open
        // until the client has given up on it.
        let _ = conn.recv();
        let _ = finished.recv();
        drop(conn);
    });

    let mut client = MonitorClient::connect(("127.0.0.1", port), Duration::from_millis(300)).unwrap();
    assert_eq!(client.state().unwrap(), RunState::Running);
    assert_eq!(client.tree_id(), Some([7; 16]));
    let second = client.state();
    assert!(matches!(second, Err(ClientError::Stale(_))), "{second:?}");
    done.send(()).unwrap();
    drop(client);
    server.join().unwrap();
}

#[test]
fn test_port_claimed_twice() {
    let counter = Arc::new(AtomicUsize::new(0));
    let registry = registry(&counter);
    let ports = PortRegistry::new();
    let mut first = load_yaml(THREE_COUNTS, &registry).unwrap();
    let publisher = Publisher::with_ports(
        &mut first,
        config(),
        Arc::new(RunControl::new()),
        None,
        &ports,
    )
    .unwrap();
    assert!(ports.is_claimed(publisher.reply_port()));

    let mut second = load_yaml(THREE_COUNTS, &registry).unwrap();
    let clash = config()
        .with_server_port(publisher.reply_port())
        .with_publish_port(0);
    assert!(matches!(
        Publisher::with_ports(&mut second, clash, Arc::new(RunControl::new()), None, &ports),
        Err(behavior_tree_monitor::error::PublisherError::PortInUse(port)) if port == publisher.reply_port()
    ));

    let reply_port = publisher.reply_port();
    drop(publisher);
    assert!(!ports.is_claimed(reply_port));
}
