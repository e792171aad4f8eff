//! Control plane assembly and background task supervision.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info};

use crate::beacons::connection_manager::ConnectionManager;
use crate::beacons::listener::BeaconListener;
use crate::beacons::registry::BeaconRegistry;
use crate::configuration::config::Config;
use crate::dispatch::correlator::ResultCorrelator;
use crate::dispatch::service::DispatchService;
use crate::error_handling::types::ControllerError;
use crate::security::judge::{HeuristicJudge, SemanticJudge};
use crate::security::pipeline::AnalysisPipeline;
use crate::storage::database_storage::DatabaseStore;

/// Cadence of the retention purge pass.
const RETENTION_SWEEP_SECS: u64 = 3600;

/// Owns every long-lived component and the background sweep tasks.
///
/// All cross-component handles are `Arc`s over the same instances, so a
/// command observed by the dispatch service and a result arriving on a
/// beacon channel always meet in the same correlator and the same store.
pub struct Controller {
    config: Config,
    pub store: Arc<DatabaseStore>,
    pub registry: Arc<BeaconRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub correlator: Arc<ResultCorrelator>,
    pub dispatch: Arc<DispatchService>,
    listener: Arc<BeaconListener>,
}

impl Controller {
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        let store =
            Arc::new(DatabaseStore::new_file(Path::new(&config.storage.database_path)).await?);
        let judge: Option<Arc<dyn SemanticJudge>> = if config.security.judge_enabled {
            Some(Arc::new(HeuristicJudge))
        } else {
            None
        };
        let pipeline = Arc::new(AnalysisPipeline::new(
            store.clone(),
            judge,
            config.security.approval_threshold,
            Duration::from_secs(config.security.judge_timeout_secs),
        ));
        let registry = Arc::new(BeaconRegistry::new(store.clone()));
        let connections = Arc::new(ConnectionManager::new(
            store.clone(),
            config.sweeps.heartbeat_timeout_secs,
            config.sweeps.grace_multiplier,
        ));
        let correlator = Arc::new(ResultCorrelator::new(store.clone()));
        let dispatch = Arc::new(DispatchService::new(
            store.clone(),
            pipeline,
            connections.clone(),
            correlator.clone(),
            config.security.default_timeout_secs,
        ));
        let listener = Arc::new(BeaconListener::new(
            registry.clone(),
            connections.clone(),
            correlator.clone(),
        ));
        Ok(Self {
            config,
            store,
            registry,
            connections,
            correlator,
            dispatch,
            listener,
        })
    }

    /// Starts the listener and the background sweeps, then runs until the
    /// listener task ends.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let bind_ip: IpAddr = self
            .config
            .server
            .bind_address
            .parse()
            .map_err(|_| ControllerError::InitializationFailed("bad bind address".into()))?;
        let addr = SocketAddr::new(bind_ip, self.config.server.port);

        self.spawn_heartbeat_sweep();
        self.spawn_reconcile_sweep();
        self.spawn_command_sweep();
        self.spawn_retention_sweep();

        info!("control plane starting on {}", addr);
        self.listener.clone().listen(addr).await?;
        Ok(())
    }

    fn spawn_heartbeat_sweep(&self) {
        let connections = self.connections.clone();
        let period = Duration::from_secs(self.config.sweeps.heartbeat_sweep_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = connections.sweep_once(Utc::now()).await {
                    error!("heartbeat sweep failed: {}", err);
                }
            }
        });
    }

    fn spawn_reconcile_sweep(&self) {
        let connections = self.connections.clone();
        let period = Duration::from_secs(self.config.sweeps.reconcile_sweep_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = connections.reconcile_once(Utc::now()).await {
                    error!("reconciliation sweep failed: {}", err);
                }
            }
        });
    }

    fn spawn_command_sweep(&self) {
        let dispatch = self.dispatch.clone();
        let period = Duration::from_secs(self.config.sweeps.command_sweep_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match dispatch.sweep_stale_once().await {
                    Ok(0) => {}
                    Ok(closed) => info!("force-closed {} overdue commands", closed),
                    Err(err) => error!("command sweep failed: {}", err),
                }
            }
        });
    }

    fn spawn_retention_sweep(&self) {
        let dispatch = self.dispatch.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_SECS));
            loop {
                ticker.tick().await;
                match dispatch.purge_retention_once().await {
                    Ok(0) => {}
                    Ok(purged) => info!("retention purge removed {} command rows", purged),
                    Err(err) => error!("retention purge failed: {}", err),
                }
            }
        });
    }
}
