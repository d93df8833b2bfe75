//! Component wiring.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use jobforge_core::{SystemClock, WorkerId};
use jobforge_events::InMemoryEventBus;
use jobforge_queue::{MaintenanceSweeper, QueueClient, QueueEngine, SweeperHandle};
use jobforge_store::{InMemoryJobStore, JobStore, PostgresJobStore};
use jobforge_supervisor::{
    CommandSpawner, DispatcherConfig, DispatcherHandle, JobDispatcher, ProcessSpawner,
    WorkerSupervisor,
};

use crate::config::RuntimeConfig;

/// Postgres when `database_url` is set, otherwise in-memory.
pub async fn build_store(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url)
                .await
                .context("failed to connect to the job database")?;
            info!("using postgres job store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory job store (jobs are lost on exit)");
            Ok(InMemoryJobStore::arc())
        }
    }
}

/// A running job runner.
pub struct Runtime {
    engine: Arc<QueueEngine>,
    supervisor: Arc<WorkerSupervisor>,
    sweeper: Option<SweeperHandle>,
    dispatchers: Vec<DispatcherHandle>,
}

impl Runtime {
    /// Connect the store and start every component with the default
    /// worker process spawner.
    pub async fn start(config: RuntimeConfig) -> anyhow::Result<Self> {
        let spawner = Arc::new(CommandSpawner::new(&config.worker_program));
        let store = build_store(&config).await?;
        Self::start_with(config, store, spawner).await
    }

    pub async fn start_with(
        config: RuntimeConfig,
        store: Arc<dyn JobStore>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> anyhow::Result<Self> {
        let engine = Arc::new(QueueEngine::new(
            store,
            Arc::new(InMemoryEventBus::new()),
            Arc::new(SystemClock),
            config.queue.clone(),
        ));

        let supervisor = Arc::new(WorkerSupervisor::new(spawner, config.supervisor.clone()));
        supervisor
            .start()
            .await
            .context("failed to start worker process")?;

        let sweeper = MaintenanceSweeper::new(engine.clone(), config.sweeper.clone())
            .spawn(config.queues.clone());

        let dispatchers = config
            .queues
            .iter()
            .map(|queue| {
                let dispatcher_config = DispatcherConfig {
                    queue: queue.clone(),
                    worker_id: WorkerId::generate(&format!("dispatcher-{queue}")),
                    lease_duration: config.queue.lease_duration,
                    poll_interval: config.queue.poll_interval,
                    execute_timeout: config.supervisor.request_timeout,
                    ..DispatcherConfig::default()
                };
                JobDispatcher::new(engine.clone(), supervisor.clone(), dispatcher_config).spawn()
            })
            .collect();

        info!(queues = ?config.queues, "job runner started");
        Ok(Self {
            engine,
            supervisor,
            sweeper: Some(sweeper),
            dispatchers,
        })
    }

    pub fn engine(&self) -> &Arc<QueueEngine> {
        &self.engine
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    pub fn client(&self, queue: &str) -> QueueClient {
        QueueClient::new(self.engine.clone(), queue)
    }

    /// Stop claiming, stop the sweeper, then stop the worker.
    pub async fn shutdown(mut self) {
        for dispatcher in self.dispatchers.drain(..) {
            dispatcher.shutdown().await;
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown().await;
        }
        self.supervisor.stop().await;
        info!("job runner stopped");
    }
}
