use super::*;
use crate::{
    load_yaml,
    monitor::{
        blackboard_dump::ScopeDump,
        hooks::Position,
        protocol::{decode_statuses, PROTOCOL_ID},
        topology::TreeDescription,
    },
    Tree,
};

const SOURCE: &str = r#"
trees:
  main:
    root:
      type: Sequence
      children:
      - type: AlwaysSuccess
      - type: SetBool
        ports:
          value: "true"
          output: "{flag}"
      - type: IsTrue
        ports:
          input: "{flag}"
"#;

fn fixture(config: PublisherConfig, control: RunControl) -> (Tree, Shared) {
    let registry = Arc::new(Registry::default());
    let mut tree = load_yaml(SOURCE, &registry).unwrap();
    let mirror = Arc::new(BlackboardMirror::new());
    tree.set_blackboard_mirror(Some(mirror.clone()));
    let shared = Shared::new(
        config,
        Topology::describe(&tree).unwrap(),
        tree.nodes().map(|node| node.status).collect(),
        Arc::new(HookTable::new()),
        mirror,
        Arc::new(control),
        Some(registry),
    );
    (tree, shared)
}

fn shared() -> Shared {
    fixture(PublisherConfig::default(), RunControl::new()).1
}

fn call(shared: &Shared, ty: RequestType, id: u32, payload: &[&[u8]]) -> (ReplyHeader, Vec<Vec<u8>>) {
    let mut message = vec![Bytes::from(RequestHeader::new(ty, id).to_bytes())];
    message.extend(payload.iter().map(|frame| Bytes::copy_from_slice(frame)));
    let mut reply = handle_request(shared, &message);
    let header = ReplyHeader::decode(&reply.remove(0)).unwrap();
    (header, reply)
}

/// The message of a `[code, message]` reply, or the error text.
fn command(shared: &Shared, ty: RequestType, payload: &[&[u8]]) -> Result<String, String> {
    let (_, body) = call(shared, ty, 1, payload);
    assert_eq!(body.len(), 2, "{body:?}");
    let message = String::from_utf8(body[1].clone()).unwrap();
    match body[0].as_slice() {
        [0] => Ok(message),
        [1] => Err(message),
        other => panic!("unexpected code {other:?}"),
    }
}

#[test]
fn test_reply_echoes_header() {
    let shared = shared();
    let request = RequestHeader {
        protocol: 9,
        ..RequestHeader::new(RequestType::State, 0xdead_beef)
    };
    let reply = handle_request(&shared, &[Bytes::from(request.to_bytes())]);
    let header = ReplyHeader::decode(&reply[0]).unwrap();
    assert_eq!(header.request.protocol, PROTOCOL_ID);
    assert_eq!(header.request.unique_id, 0xdead_beef);
    assert_eq!(header.request.ty, RequestType::State);
    assert_eq!(header.tree_id, shared.tree_id());
    assert_eq!(&reply[1..], &[vec![0], b"STOPPED".to_vec()]);
}

#[test]
fn test_unknown_and_malformed_requests() {
    let shared = shared();
    let (header, body) = call(&shared, RequestType::Unknown(b'Z'), 4, &[]);
    assert_eq!(header.request.ty, RequestType::Unknown(b'Z'));
    assert_eq!(body[0], vec![1]);
    assert!(String::from_utf8_lossy(&body[1]).contains("request type not recognized"));

    // A truncated header is echoed as far as it goes.
    let reply = handle_request(&shared, &[Bytes::from_static(&[2, b'S', 1])]);
    let header = ReplyHeader::decode(&reply[0]).unwrap();
    assert_eq!(header.request.ty, RequestType::Status);
    assert_eq!(reply[1], vec![1]);

    let reply = handle_request(&shared, &[]);
    assert_eq!(
        ReplyHeader::decode(&reply[0]).unwrap().request.ty,
        RequestType::Undefined
    );
    assert_eq!(reply[1], vec![1]);

    let err = command(&shared, RequestType::Start, &[b"extra"]).unwrap_err();
    assert!(err.contains("frames"), "{err}");
    assert_eq!(shared.control.state(), RunState::Stopped);
}

#[test]
fn test_full_tree_and_status() {
    let (tree, shared) = fixture(PublisherConfig::default(), RunControl::new());
    let (_, body) = call(&shared, RequestType::FullTree, 1, &[]);
    let description =
        TreeDescription::from_yaml(std::str::from_utf8(&body[0]).unwrap()).unwrap();
    assert_eq!(description.nodes.len(), tree.len());
    assert_eq!(description.tree_id_bytes(), shared.tree_id());

    let (_, body) = call(&shared, RequestType::Status, 2, &[]);
    assert_eq!(
        decode_statuses(&body[0]).unwrap(),
        vec![
            (0, NodeStatus::Idle),
            (1, NodeStatus::Idle),
            (2, NodeStatus::Idle),
            (3, NodeStatus::Idle)
        ]
    );
}

#[test]
fn test_transitions_are_drained_once() {
    let shared = shared();
    let epoch_us = shared.transitions().epoch_us;
    let at = |offset_us: u64| Duration::from_micros(epoch_us + offset_us);
    shared.transitions().push(at(10), 1, NodeStatus::Running);
    shared.transitions().push(at(25), 1, NodeStatus::Success);

    let (_, body) = call(&shared, RequestType::GetTransitions, 1, &[]);
    let records = Transition::decode_all(&body[0]).unwrap();
    assert_eq!(
        records,
        vec![
            Transition {
                timestamp_us: 10,
                uid: 1,
                status: NodeStatus::Running
            },
            Transition {
                timestamp_us: 25,
                uid: 1,
                status: NodeStatus::Success
            },
        ]
    );
    assert_eq!(body[1], epoch_us.to_string().into_bytes());

    let (_, body) = call(&shared, RequestType::GetTransitions, 2, &[]);
    assert!(body[0].is_empty());
}

#[test]
fn test_transition_capacity_and_recording() {
    let (_, shared) = fixture(
        PublisherConfig::default().with_max_transitions(2),
        RunControl::new(),
    );
    let now = Duration::from_micros(now_us());
    for uid in 0..3 {
        shared.transitions().push(now, uid, NodeStatus::Running);
    }
    let uids: Vec<_> = shared.transitions().records.iter().map(|t| t.uid).collect();
    assert_eq!(uids, vec![1, 2]);

    let (_, body) = call(&shared, RequestType::ToggleRecording, 1, &[b"stop"]);
    assert_eq!(body[0], vec![0]);
    shared.transitions().push(now, 0, NodeStatus::Success);
    assert_eq!(shared.transitions().records.len(), 2);

    let (_, body) = call(&shared, RequestType::ToggleRecording, 2, &[b"start"]);
    let start: u64 = String::from_utf8(body[1].clone()).unwrap().parse().unwrap();
    assert_eq!(start, shared.transitions().epoch_us);
    assert!(shared.transitions().records.is_empty());

    assert!(command(&shared, RequestType::ToggleRecording, &[b"pause"]).is_err());
}

#[test]
fn test_run_state_requests() {
    let shared = shared();
    assert_eq!(command(&shared, RequestType::Start, &[]).unwrap(), "RUNNING");
    assert_eq!(command(&shared, RequestType::Suspend, &[]).unwrap(), "SUSPENDED");
    let err = command(&shared, RequestType::Suspend, &[]).unwrap_err();
    assert!(err.contains("expected RUNNING"), "{err}");
    assert_eq!(command(&shared, RequestType::Start, &[]).unwrap(), "RUNNING");
    assert_eq!(command(&shared, RequestType::Stop, &[]).unwrap(), "STOPPED");
    assert_eq!(command(&shared, RequestType::State, &[]).unwrap(), "STOPPED");
}

#[test]
fn test_auth_gates_start() {
    let (_, shared) = fixture(
        PublisherConfig::default().with_auth_token("secret"),
        RunControl::with_auth("secret"),
    );
    assert!(command(&shared, RequestType::Start, &[])
        .unwrap_err()
        .contains("WAIT_AUTH"));
    assert!(command(&shared, RequestType::Auth, &[]).is_err());
    assert!(command(&shared, RequestType::Auth, &[b"guess"]).is_err());
    assert_eq!(command(&shared, RequestType::Auth, &[b"secret"]).unwrap(), "STOPPED");
    assert_eq!(command(&shared, RequestType::Start, &[]).unwrap(), "RUNNING");
}

#[test]
fn test_update_mode_only_when_stopped() {
    let shared = shared();
    let replacement = "trees:\n  main:\n    root:\n      type: AlwaysFailure\n";

    command(&shared, RequestType::Start, &[]).unwrap();
    let err = command(&shared, RequestType::UpdateMode, &[replacement.as_bytes()]).unwrap_err();
    assert!(err.contains("expected STOPPED"), "{err}");
    assert!(shared.pending_topology().is_none());

    command(&shared, RequestType::Stop, &[]).unwrap();
    let err = command(
        &shared,
        RequestType::UpdateMode,
        &[b"trees:\n  main:\n    root:\n      type: NoSuchNode\n"],
    )
    .unwrap_err();
    assert!(err.contains("NoSuchNode"), "{err}");
    assert!(command(&shared, RequestType::UpdateMode, &[b"trees: ["]).is_err());
    assert!(shared.pending_topology().is_none());

    command(&shared, RequestType::UpdateMode, &[replacement.as_bytes()]).unwrap();
    let pending = shared.pending_topology().take().unwrap();
    assert_eq!(pending.trees["main"].root.ty, "AlwaysFailure");
}

#[test]
fn test_hook_requests() {
    let shared = shared();
    let spec = serde_json::to_vec(&HookSpec::breakpoint(Position::PreTick, 3)).unwrap();
    command(&shared, RequestType::HookInsert, &[&spec]).unwrap();
    assert!(command(&shared, RequestType::HookInsert, &[&spec]).is_err());

    let missing = serde_json::to_vec(&HookSpec::breakpoint(Position::PreTick, 4)).unwrap();
    let err = command(&shared, RequestType::HookInsert, &[&missing]).unwrap_err();
    assert!(err.contains("node 4 does not exist"), "{err}");
    assert!(command(&shared, RequestType::HookInsert, &[b"{"]).is_err());

    let (_, body) = call(&shared, RequestType::HooksDump, 1, &[]);
    let dump: Vec<HookSpec> = serde_json::from_slice(&body[0]).unwrap();
    assert_eq!(dump, vec![HookSpec::breakpoint(Position::PreTick, 3)]);

    command(&shared, RequestType::DisableAllHooks, &[]).unwrap();
    assert!(!shared.hooks.get(Position::PreTick, 3).unwrap().enabled);
    command(&shared, RequestType::EnableAllHooks, &[]).unwrap();
    assert!(shared.hooks.get(Position::PreTick, 3).unwrap().enabled);

    let unlock = br#"{"position": "pre_tick", "uid": 3, "desired_status": "SUCCESS"}"#;
    command(&shared, RequestType::BreakpointUnlock, &[unlock]).unwrap();

    let address = br#"{"position": "pre_tick", "uid": 3}"#;
    command(&shared, RequestType::RemoveHook, &[address]).unwrap();
    assert!(command(&shared, RequestType::RemoveHook, &[address]).is_err());
    assert!(shared.hooks.is_empty());
}

#[test]
fn test_stop_disarms_hooks() {
    let shared = shared();
    shared.hooks.insert(HookSpec::breakpoint(Position::PostTick, 1));
    command(&shared, RequestType::Start, &[]).unwrap();
    command(&shared, RequestType::Stop, &[]).unwrap();
    assert!(!shared.hooks.get(Position::PostTick, 1).unwrap().enabled);
    command(&shared, RequestType::Start, &[]).unwrap();
    assert!(shared.hooks.get(Position::PostTick, 1).unwrap().enabled);
}

#[test]
fn test_blackboard_dump() {
    let (mut tree, shared) = fixture(PublisherConfig::default(), RunControl::new());
    let dump = |payload: &[&[u8]]| -> Vec<ScopeDump> {
        let (_, body) = call(&shared, RequestType::Blackboard, 1, payload);
        assert_eq!(body.len(), 1, "{body:?}");
        serde_json::from_slice(&body[0]).unwrap()
    };

    assert!(dump(&[]).iter().all(|scope| scope.entries.is_empty()));

    assert_eq!(tree.tick_once(), NodeStatus::Success);
    tree.set("name", "robot".to_string());
    let scopes = dump(&[b"main"]);
    assert_eq!(scopes.len(), 1);
    assert_eq!(scopes[0].scope, "main");
    let entries: Vec<_> = scopes[0]
        .entries
        .iter()
        .map(|entry| (entry.key.as_str(), entry.value.clone()))
        .collect();
    assert_eq!(
        entries,
        vec![
            ("flag", Some(serde_json::Value::from(true))),
            ("name", Some(serde_json::Value::from("robot"))),
        ]
    );
    assert_eq!(scopes[0].entries[0].type_name, "bool");
    assert!(!scopes[0].entries[0].remapped);

    assert!(dump(&[b" nowhere ; "]).is_empty());
    let err = command(&shared, RequestType::Blackboard, &[b"main", b"extra"]).unwrap_err();
    assert!(err.contains("frames"), "{err}");
}
