//! Composition root: startup sequencing, signal handling, shutdown orchestration.

use std::sync::Arc;

use g2_channels::ChannelRegistry;
use g2_container::{CliContainerRuntime, ContainerRunner, ContainerRuntime, MountAllowlist, MountBuilder};
use g2_core::{config::Config, Result};
use g2_store::StateStore;
use tokio_util::sync::CancellationToken;

use crate::agent_executor::AgentExecutor;
use crate::group_queue::GroupQueue;
use crate::ipc::IpcWatcher;
use crate::pipeline::MessagePipeline;
use crate::scheduler::TaskScheduler;

pub struct Orchestrator {
    config: Config,
    store: StateStore,
    channels: Arc<ChannelRegistry>,
    queue: Arc<GroupQueue>,
    runtime: Arc<CliContainerRuntime>,
    pipeline: MessagePipeline,
    scheduler: TaskScheduler,
    ipc: IpcWatcher,
}

impl Orchestrator {
    /// Opens its own store at `config.store_path()`. Prefer `with_store` when
    /// the caller (e.g. the binary) already opened one to wire into an
    /// `InboundSink` for its channel adapters, so both share one connection.
    pub fn new(config: Config, channels: Arc<ChannelRegistry>) -> Result<Self> {
        let store = StateStore::open(&config.store_path())?;
        Self::with_store(config, channels, store)
    }

    pub fn with_store(config: Config, channels: Arc<ChannelRegistry>, store: StateStore) -> Result<Self> {
        let queue = GroupQueue::new(config.max_concurrent_containers);

        let runtime = Arc::new(CliContainerRuntime::new(config.container_binary.clone()));
        let allowlist = MountAllowlist::load(config.mount_allowlist_path.as_deref())?;
        let mount_builder = Arc::new(MountBuilder::new(config.clone(), allowlist));
        let runner = ContainerRunner::new(
            runtime.clone(),
            config.container_image.clone(),
            config.container_max_output_size,
            config.data_dir.join("logs"),
            config.container_name_prefix.clone(),
            config.secrets_file.clone(),
            false,
        );

        let executor = AgentExecutor::new(config.clone(), store.clone(), mount_builder, runner);

        let pipeline = MessagePipeline::new(
            store.clone(),
            queue.clone(),
            executor.clone(),
            channels.clone(),
            config.clone(),
        );
        let scheduler = TaskScheduler::new(
            store.clone(),
            queue.clone(),
            executor.clone(),
            channels.clone(),
            config.clone(),
        );
        let ipc = IpcWatcher::new(config.clone(), store.clone(), channels.clone(), queue.clone());

        Ok(Self {
            config,
            store,
            channels,
            queue,
            runtime,
            pipeline,
            scheduler,
            ipc,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Runs a single pass of the pipeline, scheduler and IPC watcher, then
    /// returns without entering the recurring loop. Debug mode (`--once`).
    pub async fn run_once(self) -> Result<()> {
        self.runtime.ensure_running().await?;
        self.channels.connect_all().await?;

        self.pipeline.run_once().await?;
        self.scheduler.run_once().await?;
        self.ipc.run_once().await;

        self.channels.disconnect_all().await;
        Ok(())
    }

    /// Runs until `SIGTERM`/`SIGINT`, then performs graceful shutdown.
    pub async fn run(self) -> Result<()> {
        self.runtime.ensure_running().await?;
        let orphaned = self.runtime.cleanup_orphans(&self.config.container_name_prefix).await?;
        for name in &orphaned {
            log(&format!("stopped orphaned container {name}"));
        }

        self.channels.connect_all().await?;

        let cancel = CancellationToken::new();
        let pipeline_handle = self.pipeline.clone().spawn(cancel.clone());
        let scheduler_handle = self.scheduler.clone().spawn(cancel.clone());
        let ipc_handle = self.ipc.spawn(cancel.clone());

        wait_for_shutdown_signal().await;
        log("shutdown signal received");

        cancel.cancel();
        let _ = pipeline_handle.await;
        let _ = scheduler_handle.await;
        let _ = ipc_handle.await;

        self.queue.shutdown(std::time::Duration::from_millis(10_000)).await;
        self.channels.disconnect_all().await;

        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn log(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::info!("{msg}");
    #[cfg(not(feature = "tracing"))]
    let _ = msg;
}
