//! # Orchestration Core
//!
//! Wires the store, collaborators, controller, dispatcher, aggregator and
//! recovery manager together and owns their background tasks.
//!
//! ## Lifecycle
//!
//! 1. [`OrchestrationCore::new`] builds every component (nothing runs yet).
//! 2. [`OrchestrationCore::start`] runs startup recovery, then spawns the
//!    dispatcher workers, the sweeper and the periodic recovery pass.
//! 3. [`OrchestrationCore::shutdown`] signals every loop and waits for them.
//!    In-flight remote tasks are not cancelled; their items stay PROCESSING
//!    and the next startup recovery requeues them.

use super::active_tasks::ActiveTaskRegistry;
use super::progress_aggregator::ProgressAggregator;
use super::recovery_manager::{RecoveryManager, RecoveryReport};
use super::work_dispatcher::WorkDispatcher;
use crate::config::OrchestratorConfig;
use crate::database::BatchStore;
use crate::error::{BatchflowError, BatchflowResult};
use crate::events::EventPublisher;
use crate::inference::InferenceClient;
use crate::services::BatchQueryService;
use crate::staging::ConfigurationResolver;
use crate::state_machine::StateMachineController;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Running state of the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestrationStatus {
    pub running: bool,
    pub active_tasks: usize,
    pub available_slots: usize,
    pub max_in_flight: usize,
    pub background_tasks: usize,
}

#[derive(Debug)]
pub struct OrchestrationCore {
    config: Arc<OrchestratorConfig>,
    controller: StateMachineController,
    aggregator: ProgressAggregator,
    dispatcher: WorkDispatcher,
    recovery: RecoveryManager,
    query_service: BatchQueryService,
    registry: Arc<ActiveTaskRegistry>,
    shutdown_sender: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl OrchestrationCore {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn BatchStore>,
        inference: Arc<dyn InferenceClient>,
        resolver: Arc<dyn ConfigurationResolver>,
    ) -> BatchflowResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let events = if config.events.enabled {
            EventPublisher::new(config.events.channel_capacity)
        } else {
            EventPublisher::disabled()
        };

        let controller = StateMachineController::new(
            Arc::clone(&store),
            resolver,
            events,
            config.state_machine.clone(),
        );
        let aggregator = ProgressAggregator::new(controller.clone());
        let registry = Arc::new(ActiveTaskRegistry::new(config.dispatcher.max_in_flight));
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        let dispatcher = WorkDispatcher::new(
            controller.clone(),
            inference,
            aggregator.clone(),
            Arc::clone(&registry),
            config.dispatcher.clone(),
            shutdown_receiver,
        );
        let recovery = RecoveryManager::new(
            controller.clone(),
            aggregator.clone(),
            Arc::clone(&registry),
            config.recovery.clone(),
        );
        let query_service = BatchQueryService::new(store);

        Ok(Self {
            config,
            controller,
            aggregator,
            dispatcher,
            recovery,
            query_service,
            registry,
            shutdown_sender,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Connect to PostgreSQL as configured and build the engine on it
    #[cfg(feature = "postgres")]
    pub async fn bootstrap_postgres(
        config: OrchestratorConfig,
        inference: Arc<dyn InferenceClient>,
        resolver: Arc<dyn ConfigurationResolver>,
    ) -> BatchflowResult<Self> {
        info!("🚀 BOOTSTRAP: Connecting PostgreSQL batch store");
        let store = crate::database::PgBatchStore::connect(&config.database).await?;
        Self::new(config, Arc::new(store), inference, resolver)
    }

    /// Run startup recovery, then start the background loops
    ///
    /// Returns the startup recovery report when recovery is enabled.
    pub async fn start(&self) -> BatchflowResult<Option<RecoveryReport>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BatchflowError::Orchestration(
                "orchestration core already started".to_string(),
            ));
        }

        let report = if self.config.recovery.run_on_startup {
            match self.recovery.recover_on_startup().await {
                Ok(report) => Some(report),
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut handles = self.dispatcher.spawn_workers();
        handles.push(self.dispatcher.spawn_sweeper());
        if let Some(handle) = self
            .recovery
            .spawn_periodic(self.shutdown_sender.subscribe())
        {
            handles.push(handle);
        }

        let spawned = handles.len();
        self.handles.lock().extend(handles);
        info!(background_tasks = spawned, "✅ Orchestration core started");
        Ok(report)
    }

    /// Signal every loop to stop and wait for them
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestration core already stopped");
            return;
        }

        info!("🛑 Orchestration core shutdown requested");
        let _ = self.shutdown_sender.send(true);
        self.registry.close();

        let handles = std::mem::take(&mut *self.handles.lock());
        for (idx, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = result {
                warn!(task_index = idx, error = %e, "Background task ended abnormally");
            }
        }
        info!(
            abandoned_tasks = self.registry.len(),
            "Orchestration core stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> OrchestrationStatus {
        OrchestrationStatus {
            running: self.is_running(),
            active_tasks: self.registry.len(),
            available_slots: self.registry.available_slots(),
            max_in_flight: self.registry.max_in_flight(),
            background_tasks: self.handles.lock().len(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn controller(&self) -> &StateMachineController {
        &self.controller
    }

    pub fn aggregator(&self) -> &ProgressAggregator {
        &self.aggregator
    }

    pub fn dispatcher(&self) -> &WorkDispatcher {
        &self.dispatcher
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn query_service(&self) -> &BatchQueryService {
        &self.query_service
    }

    pub fn events(&self) -> &EventPublisher {
        self.controller.events()
    }

    pub fn active_tasks(&self) -> &Arc<ActiveTaskRegistry> {
        &self.registry
    }
}
