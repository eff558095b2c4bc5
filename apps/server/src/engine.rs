//! Engine lifecycle
//!
//! Wires configuration into a running engine: plugins, connectors, the
//! dead-letter store, the orchestrator's worker pool, listeners and the HTTP
//! surface. Shutdown runs in the reverse order: stop intake, drain workers
//! up to the drain deadline, then release plugins and connectors.

use crate::api::create_router;
use crate::config::{Config, DestinationTransport, SourceConfig};
use crate::connectors::{Connector, ConnectorRegistry};
use crate::error::{Error, Result};
use crate::listeners::{FilePoller, MllpListener};
use crate::pipeline::{
    DeadLetterStore, FileDeadLetterStore, InboundUnit, InMemoryDeadLetterStore, Intake,
    LogNotifier, Orchestrator, QuarantineNotifier,
};
use crate::plugins::{PluginRegistry, PluginRegistryBuilder};
use crate::state::AppState;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Components supplied in code rather than configuration.
#[derive(Default)]
pub struct EngineOptions {
    pub plugins: PluginRegistryBuilder,
    pub connectors: Vec<Arc<dyn Connector>>,
    pub dead_letters: Option<Arc<dyn DeadLetterStore>>,
    pub notifier: Option<Arc<dyn QuarantineNotifier>>,
}

pub struct Engine {
    config: Arc<Config>,
    intake: Intake,
    orchestrator: Arc<Orchestrator>,
    plugins: Arc<PluginRegistry>,
    connectors: ConnectorRegistry,
    http_addr: SocketAddr,
    mllp_addrs: HashMap<String, SocketAddr>,
    listeners_token: CancellationToken,
    pipeline_token: CancellationToken,
    listener_tasks: Vec<JoinHandle<()>>,
    pipeline_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
    maintenance_task: JoinHandle<()>,
}

impl Engine {
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with(config, EngineOptions::default()).await
    }

    pub async fn start_with(config: Config, options: EngineOptions) -> Result<Self> {
        let extra_destinations: Vec<String> = options
            .connectors
            .iter()
            .map(|c| c.destination().to_string())
            .collect();
        config
            .validate_with(&options.plugins.registered(), &extra_destinations)
            .map_err(Error::Config)?;
        let config = Arc::new(config);

        let mut connectors = ConnectorRegistry::from_config(&config.destinations)?;
        for connector in options.connectors {
            connectors.insert(connector);
        }

        let dead_letters: Arc<dyn DeadLetterStore> = match (options.dead_letters, &config.dead_letter.directory) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileDeadLetterStore::open(dir).await?),
            (None, None) => Arc::new(InMemoryDeadLetterStore::new()),
        };
        let notifier = options
            .notifier
            .unwrap_or_else(|| Arc::new(LogNotifier) as Arc<dyn QuarantineNotifier>);

        let plugins = PluginRegistryBuilder::from_configs(&config.plugins)?
            .merge(options.plugins)?
            .initialize()
            .await?;
        let plugins = Arc::new(plugins);

        // Nothing is spawned until every fallible step has passed, so a
        // failed start only has plugins and connectors to release.
        let prepared = match prepare(&config, &plugins, &connectors, dead_letters, notifier).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(error = %e, "Engine failed to start");
                plugins.shutdown_all().await;
                connectors.shutdown_all().await;
                return Err(e);
            }
        };
        let Prepared {
            orchestrator,
            intake,
            rx,
            mllp_listeners,
            pollers,
            mllp_addrs,
            tcp,
            http_addr,
        } = prepared;

        let pipeline_token = CancellationToken::new();
        let pipeline_task = tokio::spawn(Arc::clone(&orchestrator).run(
            rx,
            config.pipeline.workers,
            pipeline_token.clone(),
            config.pipeline.drain_timeout(),
        ));

        let listeners_token = CancellationToken::new();
        let mut listener_tasks = Vec::new();
        for listener in mllp_listeners {
            listener_tasks.push(tokio::spawn(listener.run(listeners_token.clone())));
        }
        for poller in pollers {
            listener_tasks.push(tokio::spawn(poller.run(listeners_token.clone())));
        }

        let app = create_router(AppState::new(
            Arc::clone(&config),
            intake.clone(),
            Arc::clone(&orchestrator),
        ));
        let http_shutdown = listeners_token.clone();
        let http_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(tcp, app)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await
            {
                tracing::error!(error = %e, "HTTP server terminated unexpectedly");
            }
        });

        let maintenance_task =
            connectors.spawn_maintenance(keepalive_interval(&config), pipeline_token.clone());

        tracing::info!(
            http = %http_addr,
            routes = config.routes.len(),
            destinations = connectors.destinations().len(),
            workers = config.pipeline.workers,
            "Engine started"
        );

        Ok(Self {
            config,
            intake,
            orchestrator,
            plugins,
            connectors,
            http_addr,
            mllp_addrs,
            listeners_token,
            pipeline_token,
            listener_tasks,
            pipeline_task,
            http_task,
            maintenance_task,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Bound address of a route's MLLP listener.
    pub fn mllp_addr(&self, route: &str) -> Option<SocketAddr> {
        self.mllp_addrs.get(route).copied()
    }

    pub fn intake(&self) -> &Intake {
        &self.intake
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Stop accepting, drain in-flight envelopes up to the drain deadline,
    /// then release plugins and connectors.
    pub async fn shutdown(self) {
        tracing::info!("Engine shutting down");
        self.listeners_token.cancel();
        for task in self.listener_tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Listener task failed");
            }
        }

        self.pipeline_token.cancel();
        if let Err(e) = self.pipeline_task.await {
            tracing::error!(error = %e, "Pipeline task failed");
        }

        // Requests still waiting were answered when the pipeline closed.
        if let Err(e) = self.http_task.await {
            tracing::warn!(error = %e, "HTTP server task failed");
        }
        if let Err(e) = self.maintenance_task.await {
            tracing::warn!(error = %e, "Connector maintenance task failed");
        }

        self.plugins.shutdown_all().await;
        self.connectors.shutdown_all().await;
        tracing::info!("Engine stopped");
    }
}

/// Everything a running engine needs that can still fail, built before any
/// task is spawned.
struct Prepared {
    orchestrator: Arc<Orchestrator>,
    intake: Intake,
    rx: mpsc::Receiver<InboundUnit>,
    mllp_listeners: Vec<MllpListener>,
    pollers: Vec<FilePoller>,
    mllp_addrs: HashMap<String, SocketAddr>,
    tcp: tokio::net::TcpListener,
    http_addr: SocketAddr,
}

async fn prepare(
    config: &Arc<Config>,
    plugins: &PluginRegistry,
    connectors: &ConnectorRegistry,
    dead_letters: Arc<dyn DeadLetterStore>,
    notifier: Arc<dyn QuarantineNotifier>,
) -> Result<Prepared> {
    let orchestrator = Arc::new(Orchestrator::new(
        &config.routes,
        &config.retry,
        plugins,
        connectors.clone(),
        dead_letters,
        notifier,
    )?);

    let (intake, rx) = Intake::channel(
        config.pipeline.intake_capacity,
        config.pipeline.handoff_timeout(),
    );

    let mut mllp_listeners = Vec::new();
    let mut pollers = Vec::new();
    let mut mllp_addrs = HashMap::new();
    for route in &config.routes {
        match &route.source {
            SourceConfig::Mllp(mllp) => {
                let listener = MllpListener::bind(&route.name, mllp, intake.clone())
                    .await
                    .map_err(|e| {
                        Error::Config(format!(
                            "route '{}': cannot bind MLLP listener on {}: {}",
                            route.name, mllp.bind, e
                        ))
                    })?;
                mllp_addrs.insert(route.name.clone(), listener.local_addr()?);
                mllp_listeners.push(listener);
            }
            SourceConfig::File(file) => {
                let poller = FilePoller::new(&route.name, file, intake.clone())?;
                poller.prepare().await?;
                pollers.push(poller);
            }
            // Served by the shared HTTP router
            SourceConfig::Http(_) => {}
        }
    }

    let addr = config
        .socket_addr()
        .map_err(|e| Error::Config(format!("invalid server address: {}", e)))?;
    let tcp = tokio::net::TcpListener::bind(addr).await?;
    let http_addr = tcp.local_addr()?;

    Ok(Prepared {
        orchestrator,
        intake,
        rx,
        mllp_listeners,
        pollers,
        mllp_addrs,
        tcp,
        http_addr,
    })
}

/// Shortest keep-alive interval among pooled MLLP destinations.
fn keepalive_interval(config: &Config) -> Duration {
    config
        .destinations
        .iter()
        .filter_map(|d| match &d.transport {
            DestinationTransport::Mllp(mllp) => Some(Duration::from_secs(mllp.keepalive_interval_secs.max(1))),
            DestinationTransport::Fhir(_) => None,
        })
        .min()
        .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL)
}
