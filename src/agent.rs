//! Agent wiring: device session, reconcile engine and watchers as tasks

use std::sync::Arc;

use kube::Client;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::controller::{
    establish_session, run_endpoints_watcher, run_pod_counter, run_service_watcher,
    AgentConfigHandler, AgentStatePublisher, ClusterLookup, ConfigDispatcher, KubeLookup,
    NotificationReceiver, ReconcileEngine, ReconcileHandle, TransactionBatcher,
};
use crate::device::{
    DeviceSession, RouteTableReader, RouteTableSource, TelemetryClient, TelemetryStore,
};
use crate::error::{Error, Result};

type TaskResult = (&'static str, Result<()>);

/// A configured agent, ready to register with the device and start watching
pub struct Agent {
    config: AgentConfig,
    session: Arc<dyn DeviceSession>,
    telemetry: TelemetryClient,
    routes: RouteTableReader,
    publisher: Arc<AgentStatePublisher>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        session: Arc<dyn DeviceSession>,
        store: Arc<dyn TelemetryStore>,
        routes: Arc<dyn RouteTableSource>,
    ) -> Self {
        let telemetry = TelemetryClient::new(store);
        let routes = RouteTableReader::new(routes, config.network_instance.clone());
        let publisher = Arc::new(AgentStatePublisher::new(
            config.yang_root.clone(),
            telemetry.clone(),
            config.node_name.as_deref().unwrap_or_default(),
        ));
        Self {
            config,
            session,
            telemetry,
            routes,
            publisher,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Base-state publisher, shared with the HTTP surface
    pub fn publisher(&self) -> Arc<AgentStatePublisher> {
        self.publisher.clone()
    }

    /// Register with the device, then run every task until shutdown.
    ///
    /// Returns the first fatal error of any task. A task that finishes
    /// cleanly (e.g. the device ending the notification stream) does not
    /// stop the others.
    pub async fn run(self, client: Client) -> Result<()> {
        let retry = self.config.stream_retry();
        let ids =
            establish_session(self.session.as_ref(), self.config.register_timeout, &retry).await?;
        info!(
            "Agent {} registered (app id {}, stream {})",
            self.config.agent_name, ids.app_id, ids.stream_id
        );

        if let Err(e) = self.publisher.publish().await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Failed to publish initial agent state: {:?}", e);
        }

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        let (handle, rx) = ReconcileHandle::channel(self.config.queue_capacity);
        let engine = ReconcileEngine::new(
            self.config.yang_root.clone(),
            self.telemetry.clone(),
            self.routes.clone(),
        );
        tasks.spawn(async move { ("reconcile engine", engine.run(rx).await) });

        let dispatcher = ConfigDispatcher::new(
            TransactionBatcher::new(self.config.effective_roots()),
            Arc::new(AgentConfigHandler::new(self.publisher.clone())),
        );
        let mut receiver =
            NotificationReceiver::new(self.session.clone(), ids.stream_id, dispatcher, retry);
        tasks.spawn(async move { ("notification receiver", receiver.run().await) });

        let lookup: Arc<dyn ClusterLookup> = Arc::new(KubeLookup::new(client.clone()));

        let (watch_client, watch_lookup, watch_handle) =
            (client.clone(), lookup.clone(), handle.clone());
        tasks.spawn(async move {
            (
                "service watcher",
                run_service_watcher(watch_client, watch_lookup, watch_handle).await,
            )
        });

        let (watch_client, watch_lookup) = (client, lookup.clone());
        tasks.spawn(async move {
            (
                "endpoints watcher",
                run_endpoints_watcher(watch_client, watch_lookup, handle).await,
            )
        });

        let publisher = self.publisher.clone();
        let node_name = self.config.node_name.clone();
        let interval = self.config.pod_count_interval;
        tasks.spawn(async move {
            (
                "pod counter",
                run_pod_counter(lookup, publisher, node_name, interval).await,
            )
        });

        supervise(tasks).await
    }
}

/// Wait for shutdown or the first failing task
async fn supervise(mut tasks: JoinSet<TaskResult>) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping {} tasks", tasks.len());
                tasks.shutdown().await;
                return Ok(());
            }
            joined = tasks.join_next() => match joined {
                None => {
                    info!("All agent tasks finished");
                    return Ok(());
                }
                Some(Ok((name, Ok(())))) => info!("{} finished", name),
                Some(Ok((name, Err(e)))) => {
                    error!("{} failed: {:?}", name, e);
                    tasks.shutdown().await;
                    return Err(e);
                }
                Some(Err(e)) => {
                    error!("Agent task aborted: {:?}", e);
                    tasks.shutdown().await;
                    return Err(Error::TaskFailed(e.to_string()));
                }
            }
        }
    }
}
