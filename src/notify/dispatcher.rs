//! Per-service up/down tracking and notification fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Event, Notifier, NotifyError};
use crate::db::{NotifierConfig, Service};
use crate::probe::ProbeOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Unknown,
    Up,
    Down,
}

/// Derived availability of one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceState {
    pub status: Status,
    pub consecutive_failures: u32,
    pub last_change: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
}

/// A state change worth telling someone about.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Down { issue: String },
    Recovered { downtime_secs: Option<i64> },
}

impl ServiceState {
    pub fn online(&self) -> bool {
        self.status == Status::Up
    }

    /// Fold one probe outcome into the state.
    ///
    /// Goes down once `threshold` consecutive failures have been seen and
    /// comes back up on the first success. `Unknown -> Up` is silent.
    pub fn apply(&mut self, outcome: &ProbeOutcome, threshold: u32) -> Option<Transition> {
        let time = outcome.time;
        self.last_check = Some(time);

        match &outcome.result {
            Ok(_) => {
                self.consecutive_failures = 0;
                match self.status {
                    Status::Up => None,
                    Status::Unknown => {
                        self.status = Status::Up;
                        self.last_change = Some(time);
                        None
                    }
                    Status::Down => {
                        let downtime_secs = self.last_change.map(|since| (time - since).num_seconds());
                        self.status = Status::Up;
                        self.last_change = Some(time);
                        Some(Transition::Recovered { downtime_secs })
                    }
                }
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.status != Status::Down && self.consecutive_failures >= threshold.max(1) {
                    self.status = Status::Down;
                    self.last_change = Some(time);
                    Some(Transition::Down { issue: e.to_string() })
                } else {
                    None
                }
            }
        }
    }
}

/// Tracks state per service and delivers transition events.
pub struct Dispatcher {
    states: RwLock<HashMap<i64, Arc<Mutex<ServiceState>>>>,
    catalog: Vec<Arc<dyn Notifier>>,
    configs: RwLock<Vec<NotifierConfig>>,
    threshold: u32,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(catalog: Vec<Arc<dyn Notifier>>, threshold: u32, timeout: Duration) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            catalog,
            configs: RwLock::new(Vec::new()),
            threshold: threshold.max(1),
            timeout,
        }
    }

    pub fn catalog(&self) -> &[Arc<dyn Notifier>] {
        &self.catalog
    }

    pub fn notifier(&self, method: &str) -> Option<Arc<dyn Notifier>> {
        self.catalog.iter().find(|n| n.method() == method).cloned()
    }

    /// Replace the delivery configuration. Takes effect for the next event.
    pub async fn load_configs(&self, configs: Vec<NotifierConfig>) {
        let enabled = configs.iter().filter(|c| c.enabled).count();
        *self.configs.write().await = configs;
        debug!("Loaded notifier configuration, {} enabled", enabled);
    }

    /// Insert or replace one method's configuration.
    pub async fn reload_config(&self, config: NotifierConfig) {
        let mut configs = self.configs.write().await;
        match configs.iter_mut().find(|c| c.method == config.method) {
            Some(existing) => *existing = config,
            None => configs.push(config),
        }
    }

    pub async fn state(&self, service_id: i64) -> ServiceState {
        let entry = self.states.read().await.get(&service_id).cloned();
        match entry {
            Some(state) => state.lock().await.clone(),
            None => ServiceState::default(),
        }
    }

    /// Drop the state of a deleted service.
    pub async fn forget(&self, service_id: i64) {
        self.states.write().await.remove(&service_id);
    }

    async fn state_handle(&self, service_id: i64) -> Arc<Mutex<ServiceState>> {
        if let Some(state) = self.states.read().await.get(&service_id) {
            return state.clone();
        }
        self.states
            .write()
            .await
            .entry(service_id)
            .or_default()
            .clone()
    }

    /// Update a service's state with a probe outcome and notify on transitions.
    ///
    /// Returns the spawned delivery tasks; callers on the probe path drop them.
    pub async fn observe(&self, service: &Service, outcome: &ProbeOutcome) -> Vec<JoinHandle<()>> {
        let state = self.state_handle(service.id).await;
        let transition = state.lock().await.apply(outcome, self.threshold);

        let Some(transition) = transition else {
            return Vec::new();
        };

        let event = match transition {
            Transition::Down { issue } => {
                warn!("Service {} ({}) is down: {}", service.name, service.id, issue);
                Event::down(service, outcome.time, issue)
            }
            Transition::Recovered { downtime_secs } => {
                info!("Service {} ({}) is back online", service.name, service.id);
                Event::recovered(service, outcome.time, downtime_secs)
            }
        };

        if !service.notify {
            debug!("Notifications disabled for service {}", service.id);
            return Vec::new();
        }

        self.fan_out(event).await
    }

    /// Deliver `event` to every enabled channel, each on its own task.
    pub async fn fan_out(&self, event: Event) -> Vec<JoinHandle<()>> {
        let mut targets: Vec<NotifierConfig> = self
            .configs
            .read()
            .await
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect();
        targets.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.method.cmp(&b.method)));

        let event = Arc::new(event);
        let mut handles = Vec::with_capacity(targets.len());

        for config in targets {
            let Some(notifier) = self.notifier(&config.method) else {
                warn!("No notifier registered for method {:?}", config.method);
                continue;
            };
            let event = event.clone();
            let limit = self.timeout;

            handles.push(tokio::spawn(async move {
                match tokio::time::timeout(limit, notifier.send(&config, &event)).await {
                    Ok(Ok(())) => debug!("Sent {} notification via {}", event.kind.as_str(), config.method),
                    Ok(Err(e)) => warn!("Notifier {} failed: {}", config.method, e),
                    Err(_) => warn!("Notifier {} timed out after {:?}", config.method, limit),
                }
            }));
        }

        handles
    }

    /// Send a test event through `method` using `config`, bounded by the delivery timeout.
    pub async fn test(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        let notifier = self
            .notifier(&config.method)
            .ok_or_else(|| NotifyError::UnknownMethod(config.method.clone()))?;

        tokio::time::timeout(self.timeout, notifier.test(config))
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))?
    }
}
