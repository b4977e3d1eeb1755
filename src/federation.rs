//! The single coordinator that owns the orchestration core.
//!
//! Components are built in a fixed order and receive explicit handles:
//! [`StateManager`] and [`EventBus`], then the [`DelegationProtocol`], the
//! [`WorkerDispatcher`], the [`ToolExecutor`] and finally the [`MasterLoop`].
//! The presentation layer talks to the federation only through `run`, event
//! subscription and state queries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::completion::CompletionService;
use crate::config::AppConfig;
use crate::error::FederationError;
use crate::master::system_prompt::build_master_prompt;
use crate::master::tools::tool_descriptions;
use crate::master::{MasterLoop, MasterSettings, ToolExecutor};
use crate::orchestration::delegation::DelegationProtocol;
use crate::orchestration::dispatcher::{DispatchSettings, WorkerDispatcher};
use crate::orchestration::events::{Event, EventBus, EventFeed, SubscriptionToken};
use crate::orchestration::state::StateManager;
use crate::orchestration::types::{WorkerConfig, WorkerRow};
use crate::worker::WorkspaceTools;

/// Tunables for a federation instance.
#[derive(Clone, Debug)]
pub struct FederationOptions {
    /// Model name shown to the master in its system prompt.
    pub model: String,
    pub master: MasterSettings,
    pub dispatch: DispatchSettings,
    pub max_chain_depth: usize,
    pub event_feed_capacity: usize,
}

impl Default for FederationOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            master: MasterSettings::default(),
            dispatch: DispatchSettings::default(),
            max_chain_depth: 8,
            event_feed_capacity: 500,
        }
    }
}

impl FederationOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            model: config.model.clone(),
            master: MasterSettings {
                max_iterations: config.max_master_iterations,
                turn_timeout: secs(config.turn_timeout_secs),
            },
            dispatch: DispatchSettings {
                max_iterations: config.max_worker_iterations,
                run_timeout: secs(config.worker_timeout_secs),
                ..DispatchSettings::default()
            },
            max_chain_depth: config.max_chain_depth,
            event_feed_capacity: config.event_feed_capacity,
        }
    }
}

pub struct Federation {
    state: StateManager,
    events: EventBus,
    dispatcher: WorkerDispatcher,
    master: Mutex<MasterLoop>,
    feed: EventFeed,
}

impl Federation {
    /// Build the federation and register `templates`.
    pub fn new(
        service: Arc<dyn CompletionService>,
        tools: WorkspaceTools,
        templates: Vec<WorkerConfig>,
        options: FederationOptions,
    ) -> Result<Self, FederationError> {
        let state = StateManager::new();
        let events = EventBus::new();
        for template in templates {
            state.register_template(template)?;
        }
        let feed = EventFeed::attach(&events, options.event_feed_capacity);

        let protocol = DelegationProtocol::new(state.clone(), events.clone(), options.max_chain_depth);

        let workspace_root = tools.root().to_path_buf();
        let dispatcher = WorkerDispatcher::new(
            state.clone(),
            events.clone(),
            protocol,
            service.clone(),
            Arc::new(tools),
            options.dispatch,
        );

        let executor = ToolExecutor::new(state.clone(), events.clone(), dispatcher.clone());

        let system_prompt = build_master_prompt(
            &options.model,
            &workspace_root,
            &tool_descriptions(),
            &state.list_templates(),
        );
        let master = MasterLoop::new(
            state.clone(),
            events.clone(),
            service,
            executor,
            system_prompt,
            options.master,
        );

        tracing::info!(
            templates = state.list_templates().len(),
            workspace = %workspace_root.display(),
            "Federation initialized"
        );

        Ok(Self {
            state,
            events,
            dispatcher,
            master: Mutex::new(master),
            feed,
        })
    }

    /// Handle one inbound message and return the master's final text.
    /// Turns are serialized; concurrent callers wait their turn.
    pub async fn run(&self, message: &str) -> Result<String, FederationError> {
        let mut master = self.master.lock().await;
        master.run(message).await
    }

    /// Forget the master's conversation. Workers are unaffected.
    pub async fn reset_conversation(&self) {
        self.master.lock().await.reset();
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.events.unsubscribe(token)
    }

    pub fn worker_table(&self) -> Vec<WorkerRow> {
        self.state.worker_table()
    }

    /// Recent events for display, oldest first.
    pub fn event_feed(&self) -> &EventFeed {
        &self.feed
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn dispatcher(&self) -> &WorkerDispatcher {
        &self.dispatcher
    }

    /// Cancel all worker units and wait for them to stop.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        tracing::info!("Federation shut down");
    }
}
