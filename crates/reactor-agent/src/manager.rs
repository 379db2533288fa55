use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use reactor_core::config::AppConfig;
use reactor_core::error::{ReactorError, Result};
use reactor_core::{
    AgentEvent, ChatMessage, Checkpointer, EventBus, ExecutionState, Lifecycle, ProgressCallback,
};

use crate::graph::GraphDefinition;
use crate::instance::{AgentInstance, Delivery, InstanceConfig, InstanceSummary};

/// Per-spawn settings. Unset fields fall back to the manager's config.
#[derive(Clone, Default)]
pub struct SpawnOptions {
    pub agent_name: Option<String>,
    pub skills: Vec<String>,
    pub step_limit: Option<usize>,
    pub initial_state: Option<ExecutionState>,
    /// Subscribers for this instance only, after the manager-wide ones.
    pub callbacks: Vec<Arc<dyn ProgressCallback>>,
}

impl SpawnOptions {
    pub fn named(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            ..Default::default()
        }
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = Some(limit);
        self
    }

    pub fn with_initial_state(mut self, state: ExecutionState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }
}

/// Instance counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub total: usize,
    pub by_lifecycle: BTreeMap<Lifecycle, usize>,
}

impl ManagerStats {
    pub fn count(&self, lifecycle: Lifecycle) -> usize {
        self.by_lifecycle.get(&lifecycle).copied().unwrap_or(0)
    }
}

/// Registry of agent instances.
///
/// Passed around explicitly; there is no process-wide instance. The registry
/// lock covers registration, removal and lookup only, never a running session.
pub struct AgentManager {
    instances: RwLock<HashMap<String, Arc<AgentInstance>>>,
    checkpointer: Arc<dyn Checkpointer>,
    events: Arc<EventBus>,
    callbacks: RwLock<Vec<Arc<dyn ProgressCallback>>>,
    step_limit: usize,
    stop_grace: Duration,
}

impl AgentManager {
    pub fn new(checkpointer: Arc<dyn Checkpointer>, config: &AppConfig) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            checkpointer,
            events: Arc::new(EventBus::new(config.manager.event_capacity)),
            callbacks: RwLock::new(vec![]),
            step_limit: config.executor.step_limit,
            stop_grace: config.manager.stop_grace(),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    /// Register a subscriber for every instance spawned from now on.
    pub fn on_progress(&self, callback: Arc<dyn ProgressCallback>) {
        if let Ok(mut cbs) = self.callbacks.write() {
            cbs.push(callback);
        }
    }

    /// Create, register and start an instance. Returns its id without waiting
    /// for the session to make progress.
    pub fn spawn(
        &self,
        graph: Arc<GraphDefinition>,
        task: impl Into<String>,
        options: SpawnOptions,
    ) -> Result<String> {
        let agent_name = options
            .agent_name
            .unwrap_or_else(|| graph.name().to_string());
        let config = InstanceConfig {
            agent_name: agent_name.clone(),
            skills: options.skills,
            step_limit: options.step_limit.unwrap_or(self.step_limit),
            stop_grace: self.stop_grace,
            initial_state: options.initial_state,
        };
        let instance = AgentInstance::new(
            graph,
            self.checkpointer.clone(),
            self.events.clone(),
            task,
            config,
        );

        let shared: Vec<Arc<dyn ProgressCallback>> = self
            .callbacks
            .read()
            .map(|cbs| cbs.clone())
            .unwrap_or_default();
        for callback in shared.into_iter().chain(options.callbacks) {
            instance.on_progress(callback);
        }

        let id = instance.id().to_string();
        self.write_registry().insert(id.clone(), instance.clone());
        self.events.publish(AgentEvent::InstanceSpawned {
            instance_id: id.clone(),
            agent_name: agent_name.clone(),
        });

        if let Err(e) = instance.start() {
            self.write_registry().remove(&id);
            return Err(e);
        }
        info!(instance = %id, agent = %agent_name, "Spawned agent instance");
        Ok(id)
    }

    /// Look up by exact id, then by unambiguous id prefix.
    pub fn get(&self, id_or_prefix: &str) -> Result<Arc<AgentInstance>> {
        let instances = self.read_registry();
        if let Some(instance) = instances.get(id_or_prefix) {
            return Ok(instance.clone());
        }
        if id_or_prefix.is_empty() {
            return Err(ReactorError::NotFound(id_or_prefix.to_string()));
        }

        let matches: Vec<&Arc<AgentInstance>> = instances
            .iter()
            .filter(|(id, _)| id.starts_with(id_or_prefix))
            .map(|(_, inst)| inst)
            .collect();
        match matches.as_slice() {
            [one] => Ok((*one).clone()),
            [] => Err(ReactorError::NotFound(id_or_prefix.to_string())),
            many => Err(ReactorError::AmbiguousId {
                prefix: id_or_prefix.to_string(),
                matches: many.len(),
            }),
        }
    }

    pub async fn stop(&self, id_or_prefix: &str) -> Result<bool> {
        let instance = self.get(id_or_prefix)?;
        instance.stop().await
    }

    pub fn send_message(&self, id_or_prefix: &str, text: &str) -> Result<Delivery> {
        self.get(id_or_prefix)?.send_message(text)
    }

    pub fn resume(&self, id_or_prefix: &str, value: serde_json::Value) -> Result<()> {
        self.get(id_or_prefix)?.resume(value)
    }

    pub async fn history(&self, id_or_prefix: &str) -> Result<Vec<ChatMessage>> {
        let instance = self.get(id_or_prefix)?;
        instance.history().await
    }

    /// Stop (if needed) and unregister an instance. Its checkpoint is kept.
    pub async fn remove(&self, id_or_prefix: &str) -> Result<InstanceSummary> {
        let instance = self.get(id_or_prefix)?;
        instance.stop().await?;
        self.write_registry().remove(instance.id());
        Ok(instance.summary())
    }

    /// Summaries of every instance, oldest first.
    pub fn list(&self) -> Vec<InstanceSummary> {
        let mut summaries: Vec<InstanceSummary> =
            self.read_registry().values().map(|i| i.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn stats(&self) -> ManagerStats {
        let instances = self.read_registry();
        let mut by_lifecycle = BTreeMap::new();
        for instance in instances.values() {
            *by_lifecycle.entry(instance.lifecycle()).or_insert(0) += 1;
        }
        ManagerStats {
            total: instances.len(),
            by_lifecycle,
        }
    }

    /// Stop every running instance concurrently and wait for all of them.
    /// Paused sessions are left alone; their checkpoints can be resumed later.
    pub async fn shutdown(&self) {
        let running: Vec<Arc<AgentInstance>> = self
            .read_registry()
            .values()
            .filter(|i| matches!(i.lifecycle(), Lifecycle::Initializing | Lifecycle::Running))
            .cloned()
            .collect();
        info!(count = running.len(), "Shutting down agent instances");

        let stops = running.iter().map(|i| i.stop());
        let results = futures::future::join_all(stops).await;
        for (instance, result) in running.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(instance = %instance.id(), error = %e, "Stop failed during shutdown");
            }
        }
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<AgentInstance>>> {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<AgentInstance>>> {
        self.instances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
