use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use concord_core::app::{
    ClusterNode, ClusterNodeBuilder, Handler, HandlerError, HandlerRegistry, PeriodicTask,
    TypedTask, WorkerGroup,
};
use concord_core::config::ConcordConfig;
use concord_core::consensus::{InMemoryNetwork, MemStorage, Membership};
use concord_core::discovery::{Discovery, NodeAddress, RegistryDiscovery};
use concord_core::domain::NodeId;
use concord_core::impls::{InMemoryLockStore, InMemoryTaskStore};
use concord_core::session::SessionRequest;

const CLUSTER_SIZE: usize = 3;
const SESSIONS: [&str; 2] = ["session-a", "session-b"];

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

impl TypedTask for Greet {
    const TYPE: &'static str = "demo.greet.say.v1";
}

/// Fails the first `failures` calls to show retries.
struct GreetHandler {
    failures: AtomicU32,
}

#[async_trait]
impl Handler<Greet> for GreetHandler {
    async fn handle(&self, task: Greet) -> Result<Option<Vec<u8>>, HandlerError> {
        if let Ok(left) = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }
        Ok(Some(format!("Hello, {}!", task.name).into_bytes()))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config() -> Result<ConcordConfig, Box<dyn Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ConcordConfig::load(path)?,
        None => ConcordConfig::default(),
    };
    Ok(config.with_env()?)
}

async fn start_cluster(config: &ConcordConfig) -> Result<Vec<ClusterNode>, Box<dyn Error>> {
    let network = InMemoryNetwork::new();
    let registry = RegistryDiscovery::new();
    // durable tables are shared by every node
    let tasks = Arc::new(InMemoryTaskStore::new());
    let locks = Arc::new(InMemoryLockStore::new());

    let ids: Vec<NodeId> = (1..=CLUSTER_SIZE).map(|i| NodeId::new(format!("node-{i}"))).collect();
    let membership = Membership::new(ids.iter().map(|id| (id.clone(), format!("mem://{id}"))));

    let mut nodes = Vec::with_capacity(CLUSTER_SIZE);
    for id in &ids {
        let addr = format!("mem://{id}");
        let node = ClusterNodeBuilder::new(id.clone(), addr.clone())
            .raft_config(config.raft_config())
            .queue_config(config.queue_config())
            .session_config(config.session_config())
            .sweep_intervals(config.claim_sweep_interval(), config.lock_cleanup_interval())
            .storage(Arc::new(MemStorage::new()))
            .transport(network.transport(id.clone()))
            .bootstrap(membership.clone())
            .task_store(tasks.clone())
            .lock_store(locks.clone())
            .discovery(Arc::new(registry.clone()), true)
            .build()
            .await?;
        network.register(id.clone(), node.consensus().endpoint());
        registry.register(NodeAddress::new(id.clone(), addr)).await?;
        nodes.push(node);
    }
    Ok(nodes)
}

async fn wait_for_leader(nodes: &[ClusterNode]) -> Option<&ClusterNode> {
    for _ in 0..500 {
        if let Some(leader) = nodes.iter().find(|n| n.consensus().is_leader()) {
            return Some(leader);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let config = load_config()?;
    let nodes = start_cluster(&config).await?;

    let Some(leader) = wait_for_leader(&nodes).await else {
        for node in &nodes {
            node.shutdown().await;
        }
        return Err("no leader elected".into());
    };
    info!(leader = %leader.id(), "cluster ready");

    for name in SESSIONS {
        leader
            .sessions()
            .register_session(SessionRequest::new(name, "standard", "local"))
            .await?;
    }
    let sessions = leader.sessions().clone();
    if let Some(session) = sessions.available_session() {
        info!(session = %session.session_name, "least loaded session");
    }
    let heartbeats = PeriodicTask::every("heartbeat", Duration::from_secs(1), move || {
        let sessions = sessions.clone();
        async move {
            for name in SESSIONS {
                if let Err(err) = sessions.record_heartbeat(name).await {
                    warn!(session = name, error = %err, "heartbeat failed");
                }
            }
        }
    });

    let queue = leader.queue().clone();
    for (i, name) in ["ada", "grace", "edsger", "barbara", "ken", "margaret"].iter().enumerate() {
        let new = Greet { name: name.to_string() }.to_new_task()?.priority(i as i32);
        let task = queue.enqueue_with(new).await?;
        info!(task_id = %task.id, priority = task.priority, "enqueued");
    }

    let mut handlers = HandlerRegistry::new();
    handlers.register_typed::<Greet, _>(GreetHandler {
        failures: AtomicU32::new(2),
    })?;
    let workers = WorkerGroup::spawn(
        SESSIONS.iter().map(|s| s.to_string()).collect(),
        queue.clone(),
        Arc::new(handlers),
        Duration::from_millis(50),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !queue.task_counts().await?.is_drained() {
        if tokio::time::Instant::now() >= deadline {
            warn!("tasks did not drain in time");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    workers.shutdown_and_join().await;
    heartbeats.stop().await;

    for node in &nodes {
        let status = node.status().await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    if let Some(manager) = leader.discovery() {
        println!("known peers of {}: {:?}", leader.id(), manager.known().await);
    }

    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
