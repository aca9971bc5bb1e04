//! Rule graph automation server
//!
//! Wires the engine crates into a running service:
//!
//! - [`dispatcher::TriggerDispatcher`] turns device events and cron ticks
//!   into run requests
//! - [`engine::AutomationEngine`] coordinates runs per rule and owns the
//!   rule, plan and history stores
//! - [`api`] exposes the engine over REST
//! - [`collaborators`] holds the default device, notification and data
//!   sink implementations

pub mod api;
pub mod collaborators;
pub mod dispatcher;
pub mod engine;
mod error;

pub use api::{create_router, start_server, AppState};
pub use dispatcher::TriggerDispatcher;
pub use engine::{AutomationEngine, Deletion, EngineOptions, RunHandle, RunSubmission};
pub use error::{EngineError, EngineResult};

use collaborators::{BusDeviceCommander, LogDataSink, LogNotifier};
use rulegraph_config::{ConfigResult, EngineConfig, RuleStorage};
use rulegraph_event_bus::EventBus;
use rulegraph_executor::Collaborators;
use rulegraph_state_store::DeviceStateStore;
use std::sync::Arc;

/// A fully wired engine instance
pub struct RuleGraph {
    pub bus: Arc<EventBus>,
    pub states: Arc<DeviceStateStore>,
    pub engine: AutomationEngine,
}

impl RuleGraph {
    /// Build with the default collaborators and file storage from `config`
    pub fn from_config(config: &EngineConfig) -> ConfigResult<Self> {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(DeviceStateStore::new(bus.clone()));
        let collaborators = Collaborators::new(
            Arc::new(BusDeviceCommander::new(bus.clone())),
            Arc::new(LogNotifier),
            Arc::new(LogDataSink),
            states.clone(),
        );
        let engine = AutomationEngine::new(
            bus.clone(),
            collaborators,
            Some(RuleStorage::from_config(&config.storage)),
            EngineOptions::from_config(config)?,
        );

        Ok(Self {
            bus,
            states,
            engine,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
            states: self.states.clone(),
        }
    }
}
