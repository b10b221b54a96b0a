//! Background worker of the banking core.
//!
//! Runs the outbox dispatcher and the Pix saga reaper as background tasks
//! over one store, with the saga subscribed to its own outbox topic, and
//! serves `/health` and `/metrics` for operators.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use dispatcher::{InMemoryBroker, OutboxDispatcher};
use domain::{RegulatoryRegistry, topics};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemorySettlementGateway, PixSagaOrchestrator, PixSagaSubscriber, SagaReaper};
use store::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use config::Config;

/// Orchestrator type run by the worker.
pub type Orchestrator<S> = PixSagaOrchestrator<S, InMemorySettlementGateway>;

/// Creates the Axum router with the operational endpoints.
pub fn create_app(metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

/// Dispatcher, saga orchestrator and reaper wired over one store.
pub struct Pipeline<S: Store> {
    orchestrator: Arc<Orchestrator<S>>,
    dispatcher: Arc<OutboxDispatcher<S, InMemoryBroker>>,
    reaper: Arc<SagaReaper<S, InMemorySettlementGateway>>,
    broker: InMemoryBroker,
    gateway: InMemorySettlementGateway,
}

impl<S: Store + Clone + 'static> Pipeline<S> {
    /// Wires the pipeline; nothing runs until [`Pipeline::spawn`].
    pub fn new(store: S, config: &Config) -> Self {
        let gateway = InMemorySettlementGateway::new();
        let orchestrator = Arc::new(PixSagaOrchestrator::new(
            store.clone(),
            gateway.clone(),
            RegulatoryRegistry::with_defaults(),
            config.orchestrator_config(),
        ));

        let broker = InMemoryBroker::new();
        broker.subscribe(
            topics::PIX_SAGA,
            Arc::new(PixSagaSubscriber::new(Arc::clone(&orchestrator))),
        );

        let dispatcher = Arc::new(OutboxDispatcher::new(
            store,
            broker.clone(),
            config.dispatcher_config(),
        ));
        let reaper = Arc::new(SagaReaper::new(
            Arc::clone(&orchestrator),
            config.reaper_config(),
        ));

        Self {
            orchestrator,
            dispatcher,
            reaper,
            broker,
            gateway,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<S>> {
        &self.orchestrator
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn gateway(&self) -> &InMemorySettlementGateway {
        &self.gateway
    }

    /// Starts the dispatcher and reaper loops.
    pub fn spawn(&self) -> BackgroundTasks {
        let (shutdown, rx) = watch::channel(false);

        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatcher_rx = rx.clone();
        let dispatcher_task = tokio::spawn(async move { dispatcher.run(dispatcher_rx).await });

        let reaper = Arc::clone(&self.reaper);
        let reaper_task = tokio::spawn(async move { reaper.run(rx).await });

        tracing::info!("background tasks started");
        BackgroundTasks {
            shutdown,
            handles: vec![dispatcher_task, reaper_task],
        }
    }
}

/// Handles of the running background loops.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signals every loop to stop and waits for them to finish their cycle.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("background tasks already stopped");
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background task panicked");
            }
        }
        tracing::info!("background tasks stopped");
    }
}
