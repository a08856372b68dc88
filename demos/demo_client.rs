//! Drives `demo_server` remotely.
//!
//! ```text
//! cargo run --example demo_client [host] [port]
//! ```
//!
//! Prints the topology, puts a breakpoint on `open_door`, starts the tree,
//! releases the breakpoint when it is hit and prints what happened.

use ::behavior_tree_monitor::{
    monitor::{
        HookSpec, MonitorClient, MonitorSubscriber, Notification, Position, RunState,
        UnlockRequest,
    },
    NodeStatus,
};
use std::time::{Duration, Instant};
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_owned());
    let port: u16 = args.next().map_or(Ok(1667), |port| port.parse())?;
    let timeout = Duration::from_secs(2);

    let mut client = MonitorClient::connect((host.as_str(), port), timeout)?;
    let mut subscriber = MonitorSubscriber::connect((host.as_str(), port + 1), timeout)?;

    if client.state()? == RunState::WaitAuth {
        let token = std::env::var("BT_AUTH_TOKEN").ok();
        info!(state = %client.auth(token.as_deref())?, "authenticated");
    }

    let tree = client.full_tree()?;
    info!(tree_id = %tree.tree_id, "topology");
    for node in &tree.nodes {
        info!(uid = node.uid, name = %node.name, kind = ?node.kind, children = ?node.children);
    }

    let target = tree
        .nodes
        .iter()
        .find(|node| node.name == "open_door")
        .map(|node| node.uid);
    if let Some(uid) = target {
        client.insert_hook(&HookSpec::breakpoint(Position::PreTick, uid))?;
        info!(uid, "breakpoint set");
    }

    if client.state()? != RunState::Stopped {
        client.stop()?;
    }
    client.toggle_recording(true)?;
    info!(state = %client.start()?, "started");

    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        match subscriber.recv(Duration::from_millis(200))? {
            Some(Notification::BreakpointReached(address)) => {
                info!(uid = address.uid, position = ?address.position, "breakpoint reached");
                client.unlock(&UnlockRequest {
                    position: address.position,
                    uid: address.uid,
                    desired_status: NodeStatus::Idle,
                    remove_when_done: true,
                })?;
            }
            Some(Notification::Status(statuses)) => {
                let running: Vec<_> = statuses
                    .iter()
                    .filter(|(_, status)| *status == NodeStatus::Running)
                    .map(|(uid, _)| uid)
                    .collect();
                info!(?running, "status");
            }
            Some(Notification::Heartbeat(state)) => {
                info!(%state, "heartbeat");
                if matches!(state, RunState::Success | RunState::Stopped) {
                    break;
                }
            }
            None => {}
        }
    }

    let (transitions, start_us) = client.transitions()?;
    for transition in transitions {
        info!(
            at_us = start_us + transition.timestamp_us,
            uid = transition.uid,
            status = %transition.status
        );
    }
    for scope in client.blackboards(&[])? {
        for entry in scope.entries {
            info!(scope = %scope.scope, key = %entry.key, value = ?entry.value, "blackboard");
        }
    }
    info!(state = %client.state()?, "done");
    Ok(())
}
