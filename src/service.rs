use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use metrics::init_provider;
use processor::{
    cancellation::RunCanceller,
    dispatcher::Dispatcher,
    engine::EngineClient,
    logs::RunLogsReader,
    reconciler::Reconciler,
    run_locks::RunLocks,
    runner::ProcessorRunner,
};
use state_store::SparkPilotState;
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state: Arc<SparkPilotState>,
    pub engine: Arc<EngineClient>,
    pub locks: Arc<RunLocks>,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciler: Arc<Reconciler>,
    pub canceller: Arc<RunCanceller>,
    pub logs: Arc<RunLogsReader>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let engine = Arc::new(
            EngineClient::from_config(&config.engine).context("error initializing job engine")?,
        );
        let logs = Arc::new(
            RunLogsReader::from_config(&config.logs, config.engine.dry_run)
                .context("error initializing log source")?,
        );
        Self::with_components(config, engine, logs).await
    }

    /// Builds the service around an existing engine and log reader.
    pub async fn with_components(
        config: ServerConfig,
        engine: Arc<EngineClient>,
        logs: Arc<RunLogsReader>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let state = SparkPilotState::new(PathBuf::from(&config.state_store_path))
            .await
            .context("error initializing state store")?;
        let locks = Arc::new(RunLocks::new());
        let resolver = config.logs.resolver();

        let dispatcher = Arc::new(Dispatcher::new(
            state.clone(),
            engine.clone(),
            locks.clone(),
            resolver.clone(),
            config.dispatcher.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            state.clone(),
            engine.clone(),
            locks.clone(),
            resolver,
            config.reconciler.clone(),
        ));
        let canceller = Arc::new(RunCanceller::new(state.clone(), engine.clone()));
        info!(
            engine = engine.engine_name(),
            dry_run = config.engine.dry_run,
            "control plane initialized"
        );

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state,
            engine,
            locks,
            dispatcher,
            reconciler,
            canceller,
            logs,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            state: self.state.clone(),
            canceller: self.canceller.clone(),
            logs: self.logs.clone(),
            metrics: Arc::new(metrics::api::Metrics::new()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            self.config.telemetry.metrics_interval(),
            env!("CARGO_PKG_VERSION"),
        )?;

        let dispatcher_runner = ProcessorRunner::new(
            self.dispatcher.clone(),
            Duration::from_millis(self.config.dispatcher.interval_ms),
        )
        .with_change_watcher(self.state.get_change_watcher());
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { dispatcher_runner.start(shutdown_rx).await });

        let reconciler_runner = ProcessorRunner::new(
            self.reconciler.clone(),
            Duration::from_millis(self.config.reconciler.interval_ms),
        );
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { reconciler_runner.start(shutdown_rx).await });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state());
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
    // processors may already be gone
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
