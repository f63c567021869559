//! Service reachability reconciler
//!
//! A single [`ReconcileEngine`] owns the published-endpoint bookkeeping and
//! consumes [`ReconcileRequest`]s from a queue, one at a time. Watchers only
//! hold a [`ReconcileHandle`]; they never touch the bookkeeping directly.
//!
//! A pass publishes every endpoint state, then the service state, then
//! deletes endpoints the service no longer has. An observer therefore never
//! sees an aggregate state without its endpoint detail.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::endpoint_set::{GcReport, ServiceEndpointSet};
use super::reachability::{compute_pass, lookup_external_route, ExternalRoute, ServicePass};
use crate::device::{paths, RouteTableReader, TelemetryClient};
use crate::error::{Error, Result};
use crate::model::{ServiceIdentity, ServiceState};

#[cfg(feature = "metrics")]
use super::metrics;

const CONTROLLER: &str = "service";

/// Work item for the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileRequest {
    /// Evaluate and publish a service
    Pass(ServicePass),
    /// The service is gone; remove everything published for it
    Remove(ServiceIdentity),
}

impl ReconcileRequest {
    pub fn service(&self) -> &ServiceIdentity {
        match self {
            ReconcileRequest::Pass(pass) => &pass.service,
            ReconcileRequest::Remove(service) => service,
        }
    }
}

/// What a pass did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassReport {
    /// The service has no external address; nothing was touched
    Skipped,
    Completed {
        service: ServiceState,
        published_endpoints: usize,
        gc: GcReport,
    },
}

/// Sending side of the reconcile queue
#[derive(Clone, Debug)]
pub struct ReconcileHandle {
    tx: mpsc::Sender<ReconcileRequest>,
}

impl ReconcileHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ReconcileRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a request; fails only when the engine has stopped
    pub async fn submit(&self, request: ReconcileRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|e| Error::ChannelClosed(format!("reconcile queue dropped {}", e.0.service())))
    }
}

/// Reconciles services against the device's forwarding state
pub struct ReconcileEngine {
    root: String,
    telemetry: TelemetryClient,
    routes: RouteTableReader,
    endpoints: ServiceEndpointSet,
}

impl ReconcileEngine {
    pub fn new(root: impl Into<String>, telemetry: TelemetryClient, routes: RouteTableReader) -> Self {
        Self {
            root: root.into(),
            telemetry,
            routes,
            endpoints: ServiceEndpointSet::new(),
        }
    }

    pub fn endpoint_sets(&self) -> &ServiceEndpointSet {
        &self.endpoints
    }

    /// Run one reconciliation pass.
    ///
    /// Only fatal errors are returned. Device failures on individual
    /// publishes or deletes are logged and the pass carries on.
    #[instrument(skip(self, pass), fields(name = %pass.service.name, namespace = %pass.service.namespace))]
    pub async fn reconcile_service(&mut self, pass: ServicePass) -> Result<PassReport> {
        let ServicePass {
            service,
            external_address,
            backends,
        } = pass;

        let Some(external_address) = external_address else {
            debug!("Service {} has no external address, skipping", service);
            return Ok(PassReport::Skipped);
        };

        let route = match self.routes.fetch().await {
            Ok(snapshot) => lookup_external_route(&snapshot, &external_address),
            Err(e) => {
                warn!(
                    "Failed to read route table of {}: {:?}",
                    self.routes.network_instance(),
                    e
                );
                #[cfg(feature = "metrics")]
                metrics::inc_device_call_failure("route_table");
                ExternalRoute::Unknown
            }
        };
        debug!("External address {} route: {:?}", external_address, route);

        let outcome = compute_pass(&external_address, &backends, &route);

        let mut published_endpoints = 0;
        for (endpoint, state) in outcome.published() {
            let path = paths::endpoint_path(&self.root, &service, endpoint);
            match self.telemetry.publish(&path, state).await {
                Ok(()) => published_endpoints += 1,
                Err(e) => tolerate(e, "telemetry_publish", &path)?,
            }
        }

        let path = paths::service_path(&self.root, &service);
        if let Err(e) = self.telemetry.publish(&path, &outcome.service).await {
            tolerate(e, "telemetry_publish", &path)?;
        }

        let new_set = outcome.published_identities();
        let gc = self
            .endpoints
            .reconcile(&self.telemetry, &self.root, &service, new_set)
            .await;

        #[cfg(feature = "metrics")]
        {
            metrics::set_service_state(
                &service.namespace,
                &service.name,
                outcome.service.state(),
                published_endpoints,
            );
            metrics::inc_stale_endpoint_deletes("deleted", gc.deleted.len());
            metrics::inc_stale_endpoint_deletes("failed", gc.failed.len());
        }

        info!(
            "Service {} is {} ({} endpoints published, {} stale removed)",
            service,
            outcome.service.state(),
            published_endpoints,
            gc.deleted.len()
        );

        Ok(PassReport::Completed {
            service: outcome.service,
            published_endpoints,
            gc,
        })
    }

    /// Delete a service's telemetry and forget its endpoints.
    ///
    /// Deleting the service path removes its endpoint subtree on the device.
    /// A service no pass ever completed for was never published and is left
    /// alone.
    #[instrument(skip(self), fields(name = %service.name, namespace = %service.namespace))]
    pub async fn remove_service(&mut self, service: &ServiceIdentity) -> Result<()> {
        if self.endpoints.forget(service).is_none() {
            debug!("Service {} was never published, nothing to remove", service);
            return Ok(());
        }

        let path = paths::service_path(&self.root, service);
        if let Err(e) = self.telemetry.delete(&path).await {
            tolerate(e, "telemetry_delete", &path)?;
        }

        #[cfg(feature = "metrics")]
        metrics::remove_service(&service.namespace, &service.name);

        info!("Removed service {}", service);
        Ok(())
    }

    pub async fn handle(&mut self, request: ReconcileRequest) -> Result<()> {
        match request {
            ReconcileRequest::Pass(pass) => self.reconcile_service(pass).await.map(|_| ()),
            ReconcileRequest::Remove(service) => self.remove_service(&service).await,
        }
    }

    /// Consume requests until every handle is dropped or a fatal error occurs
    pub async fn run(mut self, mut rx: mpsc::Receiver<ReconcileRequest>) -> Result<()> {
        info!("Starting reconcile engine under {}", self.root);

        while let Some(request) = rx.recv().await {
            let started = Instant::now();
            let result = self.handle(request).await;

            #[cfg(feature = "metrics")]
            metrics::observe_reconcile_duration_seconds(
                CONTROLLER,
                started.elapsed().as_secs_f64(),
            );
            #[cfg(not(feature = "metrics"))]
            debug!("{} pass took {:?}", CONTROLLER, started.elapsed());

            if let Err(e) = result {
                #[cfg(feature = "metrics")]
                metrics::inc_reconcile_error(CONTROLLER, e.kind());
                error!("Reconcile engine stopping: {:?}", e);
                return Err(e);
            }
        }

        info!("Reconcile queue closed, engine stopping");
        Ok(())
    }
}

/// Log a non-fatal device failure; pass fatal ones up
fn tolerate(e: Error, operation: &str, path: &str) -> Result<()> {
    if e.is_fatal() {
        return Err(e);
    }
    warn!("Failed {} for {}: {:?}", operation, path, e);
    #[cfg(feature = "metrics")]
    metrics::inc_device_call_failure(operation);
    Ok(())
}
