//! flotilla: orchestrator daemon
//!
//! Loads configuration, opens the stores, and runs task workers until
//! interrupted. Lifecycle requests reach the daemon through the shared
//! task store.
//!
//! ## Configuration
//! ```yaml
//! storage:
//!   type: sqlite
//!   path: ./data/flotilla.db
//! queue:
//!   workers: 4
//!   poll_interval_ms: 5000
//! session:
//!   management_port: 4999
//! registry:
//!   services_file: ./services.yaml
//! containers:
//!   docker_binary: docker
//! ```
//!
//! Usage: `flotilla [config.yaml]`

use std::sync::Arc;

use tracing::{info, warn};

use flotilla::config::Config;
use flotilla::container::DockerCliBackend;
use flotilla::queue::{spawn_workers, TaskContext, TaskQueue};
use flotilla::resolver::ConnectionResolver;
use flotilla::session::{DnsAddressResolver, ProcessController, SessionManager};
use flotilla::storage::{init_storage, MemoryServiceRegistry};
use flotilla::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let stores = init_storage(&config.storage).await?;

    let services = Arc::new(match &config.registry.services_file {
        Some(path) => MemoryServiceRegistry::from_yaml_file(path)?,
        None => {
            warn!("No service catalog configured, no process can be created");
            MemoryServiceRegistry::new()
        }
    });

    let queue = Arc::new(TaskQueue::new(stores.tasks.clone(), &config.queue));
    // Failed tasks stay for operators; only leases from a previous run are freed.
    queue.recover_leases().await?;

    let addresses = Arc::new(DnsAddressResolver::new(config.session.management_port));
    let sessions = Arc::new(SessionManager::new(
        stores.processes.clone(),
        addresses,
        config.session.clone(),
    ));
    let controller = Arc::new(ProcessController::new(
        sessions,
        stores.processes.clone(),
        services.clone(),
    ));
    let resolver = Arc::new(ConnectionResolver::new(
        stores.processes.clone(),
        stores.connections.clone(),
        services.clone(),
        queue.clone(),
        config.connections.clone(),
    ));
    let ctx = TaskContext {
        processes: stores.processes.clone(),
        connections: stores.connections.clone(),
        services,
        containers: Arc::new(DockerCliBackend::new(&config.containers)),
        controller,
        resolver,
        queue: queue.clone(),
    };

    let workers = spawn_workers(
        queue,
        ctx,
        config.queue.workers,
        config.queue.poll_interval(),
    );
    info!(workers = config.queue.workers, "flotilla started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    workers.stop();
    workers.join().await;

    Ok(())
}
