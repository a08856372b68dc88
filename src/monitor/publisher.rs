use super::{
    config::PublisherConfig,
    hooks::HookTable,
    ports::{PortClaim, PortRegistry},
    protocol::{HookAddress, RequestType},
    run_state::RunControl,
    server::{heartbeat_loop, server_loop, Shared},
    topology::Topology,
};
use crate::{
    blackboard::BlackboardMirror, error::PublisherError, logger::StatusChangeLogger,
    parser::TreeSource, NodeInfo, NodeStatus, Registry, Tree,
};
use std::{
    net::TcpListener,
    sync::{atomic::Ordering, Arc, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Serves the monitoring protocol for one tree.
///
/// Creating a publisher binds the reply and publish ports, attaches a status
/// change logger and the hook table to the tree, and starts the server and
/// heartbeat threads. Dropping it releases any held breakpoint and joins both
/// threads.
pub struct Publisher {
    shared: Arc<Shared>,
    server: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reply_port: u16,
    publish_port: u16,
    _claims: Vec<PortClaim>,
}

impl Publisher {
    /// Claims the ports in the process-wide [`PortRegistry`].
    pub fn new(
        tree: &mut Tree,
        config: PublisherConfig,
        control: Arc<RunControl>,
        registry: Option<Arc<Registry>>,
    ) -> Result<Self, PublisherError> {
        Self::with_ports(tree, config, control, registry, PortRegistry::process())
    }

    /// `registry` is used to validate UPDATE_MODE requests; without one only the
    /// syntax of a new topology is checked.
    pub fn with_ports(
        tree: &mut Tree,
        config: PublisherConfig,
        control: Arc<RunControl>,
        registry: Option<Arc<Registry>>,
        ports: &PortRegistry,
    ) -> Result<Self, PublisherError> {
        let mut claims = vec![];
        let reply = bind(&config.bind_address, config.server_port, ports, &mut claims)?;
        let publish = bind(
            &config.bind_address,
            config.resolved_publish_port(),
            ports,
            &mut claims,
        )?;
        let reply_port = local_port(&reply)?;
        let publish_port = local_port(&publish)?;

        let topology = Topology::describe(tree)?;
        let hooks = tree
            .hooks()
            .cloned()
            .unwrap_or_else(|| Arc::new(HookTable::new()));
        tree.set_hooks(Some(hooks.clone()));
        let blackboards = tree
            .blackboard_mirror()
            .cloned()
            .unwrap_or_else(|| Arc::new(BlackboardMirror::new()));
        tree.set_blackboard_mirror(Some(blackboards.clone()));

        let statuses = tree.nodes().map(|node| node.status).collect();
        let shared = Arc::new(Shared::new(
            config,
            topology,
            statuses,
            hooks.clone(),
            blackboards,
            control,
            registry,
        ));

        let weak = Arc::downgrade(&shared);
        hooks.set_on_reached(move |position, uid| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            info!(?position, uid, "breakpoint reached");
            match serde_json::to_vec(&HookAddress { position, uid }) {
                Ok(payload) => shared.publish(&[
                    shared.notification_header(RequestType::BreakpointReached),
                    payload,
                ]),
                Err(err) => warn!(error = %err, "failed to encode a breakpoint notification"),
            }
        });
        tree.add_logger(Arc::new(PublisherLogger {
            shared: Arc::downgrade(&shared),
        }));

        let mut publisher = Self {
            shared,
            server: None,
            heartbeat: None,
            reply_port,
            publish_port,
            _claims: claims,
        };
        publisher.server = Some(spawn("server", publisher.shared.clone(), move |shared| {
            server_loop(shared, reply)
        })?);
        publisher.heartbeat = Some(spawn("heartbeat", publisher.shared.clone(), move |shared| {
            heartbeat_loop(shared, publish)
        })?);
        info!(reply_port, publish_port, "publisher started");
        Ok(publisher)
    }

    pub fn reply_port(&self) -> u16 {
        self.reply_port
    }

    pub fn publish_port(&self) -> u16 {
        self.publish_port
    }

    pub fn hooks(&self) -> &Arc<HookTable> {
        &self.shared.hooks
    }

    pub fn control(&self) -> &Arc<RunControl> {
        &self.shared.control
    }

    pub fn set_max_heartbeat_delay(&self, delay: Duration) {
        self.shared
            .max_heartbeat_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn max_heartbeat_delay(&self) -> Duration {
        Duration::from_millis(self.shared.max_heartbeat_delay_ms.load(Ordering::Relaxed))
    }

    /// The topology accepted by UPDATE_MODE and not yet applied.
    pub fn take_pending_topology(&self) -> Option<TreeSource> {
        self.shared.pending_topology().take()
    }

    /// Re-describes the tree after it was replaced. Hooks refer to uids of the
    /// old tree, so they are all removed.
    pub fn refresh(&self, tree: &Tree) -> Result<(), PublisherError> {
        let topology = Topology::describe(tree)?;
        *self
            .shared
            .topology
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = topology;
        {
            let mut status = self.shared.status();
            status.statuses = tree.nodes().map(|node| node.status).collect();
            status.dirty = true;
        }
        self.shared.transitions().records.clear();
        self.shared.hooks.remove_all();
        info!(nodes = tree.len(), "publisher refreshed the topology");
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.hooks.enable_all(false);
        for handle in [self.server.take(), self.heartbeat.take()].into_iter().flatten() {
            let name = handle.thread().name().unwrap_or("publisher").to_owned();
            if handle.join().is_err() {
                warn!(thread = name, "publisher thread panicked");
            }
        }
        // The heartbeat thread may have re-enabled hooks before it saw `active`
        // cleared. The tree keeps the table, so nothing may stay armed.
        self.shared.hooks.remove_all();
        debug!(reply_port = self.reply_port, "publisher stopped");
    }
}

fn bind(
    address: &str,
    port: u16,
    ports: &PortRegistry,
    claims: &mut Vec<PortClaim>,
) -> Result<TcpListener, PublisherError> {
    if port != 0 {
        claims.push(ports.claim(port)?);
    }
    let listener = TcpListener::bind((address, port))
        .and_then(|listener| listener.set_nonblocking(true).map(|_| listener))
        .map_err(|source| PublisherError::Bind { port, source })?;
    if port == 0 {
        claims.push(ports.claim(local_port(&listener)?)?);
    }
    Ok(listener)
}

fn local_port(listener: &TcpListener) -> Result<u16, PublisherError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|source| PublisherError::Bind { port: 0, source })
}

fn spawn(
    name: &'static str,
    shared: Arc<Shared>,
    body: impl FnOnce(Arc<Shared>) + Send + 'static,
) -> Result<JoinHandle<()>, PublisherError> {
    thread::Builder::new()
        .name(format!("bt-monitor-{name}"))
        .spawn(move || body(shared))
        .map_err(|source| PublisherError::Spawn { name, source })
}

/// Feeds the status buffer and the transition queue from the ticking thread.
struct PublisherLogger {
    shared: Weak<Shared>,
}

impl StatusChangeLogger for PublisherLogger {
    fn callback(&self, timestamp: Duration, node: &NodeInfo, _prev: NodeStatus, status: NodeStatus) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut buffer = shared.status();
            if let Some(slot) = buffer.statuses.get_mut(node.uid as usize) {
                *slot = status;
                buffer.dirty = true;
            }
        }
        shared.transitions().push(timestamp, node.uid, status);
    }

    fn is_enabled(&self) -> bool {
        self.shared
            .upgrade()
            .map_or(false, |shared| shared.is_active())
    }

    fn name(&self) -> &str {
        "publisher"
    }
}
