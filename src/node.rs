use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Cluster, ProcessHandle, ProcessTable};
use crate::config::{DatabaseConfig, KernelConfig};
use crate::database::{DatabaseActor, DbClient, DocumentStore, FileStore, MemoryStore};
use crate::error::{KernelError, Result};
use crate::registry::{ChannelOwner, PortClient, RegistryActor};
use crate::rpc::{Responder, RpcClient, Server};
use crate::scheduler::{SchedulerActor, SchedulerClient};
use crate::transport::{Backoff, ChannelHub};

/// Process identities the kernel actors run under.
#[derive(Debug, Clone)]
pub struct KernelProcesses {
    pub registry: ProcessHandle,
    pub database: ProcessHandle,
    pub scheduler: ProcessHandle,
}

/// Typed clients bound to one caller process.
#[derive(Debug, Clone)]
pub struct KernelClient {
    pub rpc: RpcClient,
    pub db: DbClient,
    pub scheduler: SchedulerClient,
}

/// A running kernel: registry, database and scheduler actors on one host.
pub struct KernelHandle {
    config: KernelConfig,
    hub: Arc<ChannelHub>,
    backoff: Backoff,
    store: Arc<dyn DocumentStore>,
    processes: KernelProcesses,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Durable store for the configured state path, or an in-memory one.
pub fn store_for(config: &DatabaseConfig) -> Arc<dyn DocumentStore> {
    match &config.state_path {
        Some(path) => Arc::new(FileStore::new(path.clone())),
        None => Arc::new(MemoryStore::new()),
    }
}

impl KernelHandle {
    /// Start the kernel.
    ///
    /// Each actor is first registered as a process on the home host so
    /// liveness checks treat it like any other lock holder or channel owner.
    /// Actors start in dependency order: registry, database, scheduler.
    ///
    /// # Errors
    ///
    /// Fails if an actor process cannot be registered or the database
    /// refuses to start (wrong host, unreadable state).
    pub async fn start<C>(
        config: KernelConfig,
        cluster: Arc<C>,
        store: Arc<dyn DocumentStore>,
        shutdown: CancellationToken,
    ) -> Result<Self>
    where
        C: Cluster + 'static,
    {
        let hub = Arc::new(ChannelHub::new(config.channels.capacity));
        let backoff = Backoff::from_config(&config.backoff);
        let table: Arc<dyn ProcessTable> = cluster.clone();
        let nodes: Arc<dyn Cluster> = cluster.clone();

        let processes = KernelProcesses {
            registry: register(nodes.as_ref(), &config.hostname, "registry")?,
            database: register(nodes.as_ref(), &config.hostname, "database")?,
            scheduler: register(nodes.as_ref(), &config.hostname, "scheduler")?,
        };
        let responder = Responder::new(hub.clone(), backoff.clone());
        let mut tasks = Vec::new();

        let registry = RegistryActor::new(
            hub.clone(),
            config.channels.first_dynamic,
            config.channels.port_feed,
            config.channels.feed_size,
            table.clone(),
            std::time::Duration::from_millis(config.registry.sweep_interval_ms.max(1)),
        );
        tasks.push(spawn_server(
            Server::new(
                hub.clone(),
                config.channels.registry,
                registry,
                responder.clone(),
                shutdown.clone(),
            )
            .with_time_slice(config.time_slice()),
        ));

        let database = match DatabaseActor::open(
            &processes.database,
            &config.database,
            store.clone(),
            table.clone(),
            responder.clone(),
        )
        .await
        {
            Ok(database) => database,
            Err(e) => {
                shutdown.cancel();
                return Err(e);
            }
        };
        tasks.push(spawn_server(
            Server::new(
                hub.clone(),
                config.channels.database,
                database,
                responder.clone(),
                shutdown.clone(),
            )
            .with_time_slice(config.time_slice()),
        ));

        let scheduler_db = db_client(&config, &hub, &backoff, processes.scheduler.clone())
            .with_local_store(store.clone());
        let scheduler = SchedulerActor::new(nodes, scheduler_db, responder.clone(), config.scheduler.clone());
        tasks.push(spawn_server(
            Server::new(
                hub.clone(),
                config.channels.scheduler,
                scheduler,
                responder,
                shutdown.clone(),
            )
            .with_time_slice(config.time_slice()),
        ));

        tracing::info!(
            host = %config.hostname,
            registry = config.channels.registry,
            database = config.channels.database,
            scheduler = config.channels.scheduler,
            "Kernel started"
        );

        Ok(Self {
            config,
            hub,
            backoff,
            store,
            processes,
            shutdown,
            tasks,
        })
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn processes(&self) -> &KernelProcesses {
        &self.processes
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Clients acting on behalf of `process`. Callers on the home host read
    /// the document straight from the store.
    pub fn connect(&self, process: ProcessHandle) -> KernelClient {
        let co_located = process.hostname == self.config.database.home_host;
        let mut db = db_client(&self.config, &self.hub, &self.backoff, process.clone());
        if co_located {
            db = db.with_local_store(self.store.clone());
        }
        let rpc = rpc_client(&self.config, &self.hub, &self.backoff, &process);
        let scheduler = SchedulerClient::new(rpc.clone(), self.config.channels.scheduler, self.config.rpc_timeout());
        KernelClient { rpc, db, scheduler }
    }

    /// Cancel every actor loop and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Actor task failed");
            }
        }
        tracing::info!("Kernel stopped");
    }
}

fn register(cluster: &dyn Cluster, host: &str, actor: &str) -> Result<ProcessHandle> {
    let executable = format!("portmesh-{actor}");
    cluster.copy_executable(&executable, host);
    cluster
        .spawn(&executable, host, 1, &[])
        .map_err(|e| KernelError::Misconfigured(format!("cannot register {actor} on {host}: {e}")))
}

fn rpc_client(config: &KernelConfig, hub: &Arc<ChannelHub>, backoff: &Backoff, process: &ProcessHandle) -> RpcClient {
    let ports = PortClient::new(
        hub.clone(),
        &config.channels,
        ChannelOwner::new(process.hostname.clone(), process.pid),
        backoff.clone(),
        config.rpc_timeout(),
    );
    RpcClient::new(hub.clone(), ports, backoff.clone())
}

fn db_client(config: &KernelConfig, hub: &Arc<ChannelHub>, backoff: &Backoff, process: ProcessHandle) -> DbClient {
    let rpc = rpc_client(config, hub, backoff, &process);
    DbClient::new(rpc, config.channels.database, process, config.rpc_timeout())
}

fn spawn_server<A: crate::rpc::Actor>(server: Server<A>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let actor = server.run().await;
        tracing::debug!(actor = actor.name(), "Actor loop exited");
    })
}
