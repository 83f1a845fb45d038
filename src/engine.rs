//! Typed entry points used by the HTTP layer.
//!
//! The engine ties the store, the scheduler and the dispatcher together so
//! that creating, changing or deleting a service keeps its probe worker and
//! state in step, and enforces visibility of private services.

use crate::aggregate::{self, Bucket, SeriesKind, Uptime};
use crate::db::{Failure, NotifierConfig, ProbeType, Service, Store};
use crate::error::CoreError;
use crate::notify::{strip_secrets, Dispatcher, FieldSpec, ServiceState};
use crate::scheduler::Scheduler;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    Admin,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }
}

/// A service together with its live availability.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub service: Service,
    pub online: bool,
    pub state: ServiceState,
}

/// Service fields accepted on create and update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSpec {
    pub name: Option<String>,
    #[serde(alias = "domain")]
    pub address: Option<String>,
    #[serde(rename = "type", alias = "probe_type")]
    pub probe_type: Option<ProbeType>,
    pub port: Option<u16>,
    pub method: Option<String>,
    pub post_data: Option<String>,
    pub expected: Option<String>,
    pub expected_status: Option<u16>,
    pub check_interval: Option<f64>,
    pub timeout: Option<f64>,
    pub public: Option<bool>,
    pub order_id: Option<i64>,
    pub enabled: Option<bool>,
    pub notify: Option<bool>,
    pub group_id: Option<i64>,
}

impl ServiceSpec {
    fn apply(self, mut service: Service) -> Service {
        if let Some(v) = self.name {
            service.name = v.trim().to_string();
        }
        if let Some(v) = self.address {
            service.address = v.trim().to_string();
        }
        if let Some(v) = self.probe_type {
            service.probe_type = v;
        }
        if let Some(v) = self.port {
            service.port = v;
        }
        if let Some(v) = self.method {
            service.method = v.trim().to_ascii_uppercase();
        }
        if let Some(v) = self.post_data {
            service.post_data = v;
        }
        if let Some(v) = self.expected {
            service.expected = v;
        }
        if let Some(v) = self.expected_status {
            service.expected_status = v;
        }
        if let Some(v) = self.check_interval {
            service.check_interval = v;
        }
        if let Some(v) = self.timeout {
            service.timeout = v;
        }
        if let Some(v) = self.public {
            service.public = v;
        }
        if let Some(v) = self.order_id {
            service.order_id = v;
        }
        if let Some(v) = self.enabled {
            service.enabled = v;
        }
        if let Some(v) = self.notify {
            service.notify = v;
        }
        if let Some(v) = self.group_id {
            service.group_id = v;
        }
        service
    }
}

/// Upper bound for `check_interval` and `timeout`, in seconds.
const MAX_SERVICE_SECONDS: f64 = 366.0 * 86400.0;

fn validate_service(service: &Service) -> Result<(), CoreError> {
    let invalid = |msg: String| Err(CoreError::Validation(msg));

    if service.name.is_empty() {
        return invalid("name is required".to_string());
    }
    if service.address.is_empty() {
        return invalid("address is required".to_string());
    }
    if !service.check_interval.is_finite() || service.check_interval <= 0.0 {
        return invalid(format!("check_interval must be positive, got {}", service.check_interval));
    }
    if service.check_interval > MAX_SERVICE_SECONDS {
        return invalid(format!("check_interval must be at most {} seconds", MAX_SERVICE_SECONDS));
    }
    if !service.timeout.is_finite() || service.timeout <= 0.0 {
        return invalid(format!("timeout must be positive, got {}", service.timeout));
    }
    if service.timeout > MAX_SERVICE_SECONDS {
        return invalid(format!("timeout must be at most {} seconds", MAX_SERVICE_SECONDS));
    }
    if service.expected_status != 0 && !(100..=599).contains(&service.expected_status) {
        return invalid(format!("expected_status {} is not an HTTP status", service.expected_status));
    }
    if !service.expected.is_empty() {
        if let Err(e) = Regex::new(&service.expected) {
            return invalid(format!("expected is not a valid pattern: {}", e));
        }
    }
    if service.probe_type == ProbeType::Http && reqwest::Method::from_bytes(service.method.as_bytes()).is_err() {
        return invalid(format!("{:?} is not an HTTP method", service.method));
    }
    Ok(())
}

/// A notifier's stored configuration joined with its catalog entry.
#[derive(Debug, Clone, Serialize)]
pub struct NotifierView {
    #[serde(flatten)]
    pub config: NotifierConfig,
    pub title: &'static str,
    pub form: &'static [FieldSpec],
}

/// Partial notifier configuration. A field set to an empty string is removed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifierUpdate {
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl NotifierUpdate {
    fn merge_onto(self, mut config: NotifierConfig) -> NotifierConfig {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(priority) = self.priority {
            config.priority = priority;
        }
        for (key, value) in self.fields {
            if value.trim().is_empty() {
                config.fields.remove(&key);
            } else {
                config.fields.insert(key, value);
            }
        }
        config
    }
}

/// Core façade.
pub struct Engine {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    pub fn new(store: Arc<Store>, scheduler: Arc<Scheduler>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            scheduler,
            dispatcher,
        }
    }

    /// Load notifier configuration and start probing every enabled service.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.dispatcher.load_configs(self.store.get_notifiers()?).await;
        self.scheduler.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn running_workers(&self) -> usize {
        self.scheduler.running_count().await
    }

    async fn view(&self, service: Service) -> ServiceView {
        let state = self.dispatcher.state(service.id).await;
        ServiceView {
            online: state.online(),
            service,
            state,
        }
    }

    /// Fetch a service the caller is allowed to see.
    fn visible_service(&self, id: i64, caller: Caller) -> Result<Service, CoreError> {
        let service = self
            .store
            .get_service(id)
            .map_err(|e| match CoreError::from(e) {
                CoreError::NotFound(_) => CoreError::NotFound(format!("service {}", id)),
                other => other,
            })?;
        if !service.public && !caller.is_admin() {
            return Err(CoreError::NotAuthenticated);
        }
        Ok(service)
    }

    // --- Services ---

    /// Services in display order. Anonymous callers only see public ones.
    pub async fn list_services(&self, caller: Caller) -> Result<Vec<ServiceView>, CoreError> {
        let services = self.store.get_services()?;
        let mut views = Vec::with_capacity(services.len());
        for service in services {
            if service.public || caller.is_admin() {
                views.push(self.view(service).await);
            }
        }
        Ok(views)
    }

    pub async fn get_service(&self, id: i64, caller: Caller) -> Result<ServiceView, CoreError> {
        let service = self.visible_service(id, caller)?;
        Ok(self.view(service).await)
    }

    pub async fn create_service(&self, spec: ServiceSpec) -> Result<Service, CoreError> {
        let mut service = spec.apply(Service::default());
        service.created_at = Utc::now();
        validate_service(&service)?;

        self.store.add_service(&mut service)?;
        tracing::info!("Created service {} ({})", service.name, service.id);

        self.scheduler.start_service(service.clone()).await;
        Ok(service)
    }

    pub async fn update_service(&self, id: i64, spec: ServiceSpec) -> Result<Service, CoreError> {
        let existing = self.visible_service(id, Caller::Admin)?;
        let service = spec.apply(existing);
        validate_service(&service)?;

        self.store.update_service(&service)?;
        self.scheduler.replace_service(service.clone()).await;
        Ok(service)
    }

    /// Stop probing and remove a service with all its events.
    pub async fn delete_service(&self, id: i64) -> Result<(), CoreError> {
        self.scheduler.remove_service(id).await;
        self.store.delete_service(id).map_err(|e| match CoreError::from(e) {
            CoreError::NotFound(_) => CoreError::NotFound(format!("service {}", id)),
            other => other,
        })?;
        self.dispatcher.forget(id).await;
        tracing::info!("Deleted service {}", id);
        Ok(())
    }

    /// Apply `(service id, order)` pairs atomically.
    pub fn reorder(&self, orders: &[(i64, i64)]) -> Result<(), CoreError> {
        self.store.reorder_services(orders)?;
        Ok(())
    }

    // --- Events ---

    /// Failures, most recent first.
    pub fn failures(
        &self,
        id: i64,
        limit: Option<usize>,
        offset: usize,
        caller: Caller,
    ) -> Result<Vec<Failure>, CoreError> {
        self.visible_service(id, caller)?;
        Ok(self.store.get_failures(id, limit, offset)?)
    }

    /// Purge a service's failures, returning how many were removed.
    pub fn delete_failures(&self, id: i64) -> Result<usize, CoreError> {
        self.visible_service(id, Caller::Admin)?;
        let removed = self.store.delete_failures(id)?;
        tracing::info!("Deleted {} failures for service {}", removed, id);
        Ok(removed)
    }

    pub fn aggregate(
        &self,
        id: i64,
        kind: SeriesKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        group: Option<&str>,
        caller: Caller,
    ) -> Result<Vec<Bucket>, CoreError> {
        self.visible_service(id, caller)?;
        Ok(aggregate::aggregate(&self.store, id, kind, start, end, group)?)
    }

    pub fn uptime(
        &self,
        id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        caller: Caller,
    ) -> Result<Uptime, CoreError> {
        self.visible_service(id, caller)?;
        Ok(aggregate::uptime(&self.store, id, start, end)?)
    }

    // --- Notifiers ---

    fn stored_notifier(&self, method: &str) -> Result<NotifierConfig, CoreError> {
        if self.dispatcher.notifier(method).is_none() {
            return Err(CoreError::NotFound(format!("notifier {}", method)));
        }
        Ok(self
            .store
            .get_notifier(method)?
            .unwrap_or_else(|| NotifierConfig::new(method)))
    }

    fn notifier_view(&self, config: NotifierConfig) -> Option<NotifierView> {
        let notifier = self.dispatcher.notifier(&config.method)?;
        Some(NotifierView {
            config: strip_secrets(notifier.as_ref(), &config),
            title: notifier.title(),
            form: notifier.fields(),
        })
    }

    /// Every known channel with secrets removed, by priority then method.
    pub fn list_notifiers(&self) -> Result<Vec<NotifierView>, CoreError> {
        let mut views = Vec::new();
        for notifier in self.dispatcher.catalog() {
            let config = self.stored_notifier(notifier.method())?;
            views.extend(self.notifier_view(config));
        }
        views.sort_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| a.config.method.cmp(&b.config.method))
        });
        Ok(views)
    }

    pub fn get_notifier(&self, method: &str) -> Result<NotifierView, CoreError> {
        let config = self.stored_notifier(method)?;
        self.notifier_view(config)
            .ok_or_else(|| CoreError::NotFound(format!("notifier {}", method)))
    }

    /// Merge `update` onto the stored configuration, validate, save and reload delivery.
    pub async fn update_notifier(&self, method: &str, update: NotifierUpdate) -> Result<NotifierView, CoreError> {
        let mut config = update.merge_onto(self.stored_notifier(method)?);
        config.updated_at = Utc::now();

        if config.enabled {
            if let Some(notifier) = self.dispatcher.notifier(method) {
                notifier.validate(&config)?;
            }
        }

        self.store.save_notifier(&config)?;
        self.dispatcher.reload_config(config.clone()).await;
        tracing::info!("Updated notifier {} (enabled: {})", method, config.enabled);

        self.notifier_view(config)
            .ok_or_else(|| CoreError::NotFound(format!("notifier {}", method)))
    }

    /// Try a candidate configuration without saving it.
    pub async fn test_notifier(&self, method: &str, candidate: NotifierUpdate) -> Result<(), CoreError> {
        let config = candidate.merge_onto(self.stored_notifier(method)?);
        self.dispatcher.test(&config).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{sample_service, temp_store};
    use crate::db::{FailureKind, Hit};
    use crate::notify::default_catalog;
    use crate::probe::{ProbeOutcome, Prober, Reading};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct InstantProber;

    #[async_trait]
    impl Prober for InstantProber {
        async fn probe(&self, _service: &Service) -> ProbeOutcome {
            ProbeOutcome::success(Utc::now(), Reading::new(Duration::from_millis(3)))
        }
    }

    fn engine() -> (NamedTempFile, Engine) {
        let (tmp, store) = temp_store();
        let store = Arc::new(store);
        let dispatcher = Arc::new(Dispatcher::new(default_catalog(), 1, Duration::from_secs(5)));
        let scheduler = Arc::new(Scheduler::new(store.clone(), Arc::new(InstantProber), dispatcher.clone()));
        (tmp, Engine::new(store, scheduler, dispatcher))
    }

    fn spec(name: &str, public: bool) -> ServiceSpec {
        ServiceSpec {
            name: Some(name.to_string()),
            address: Some("https://example.com".to_string()),
            check_interval: Some(3600.0),
            public: Some(public),
            ..Default::default()
        }
    }

    fn add_failures(store: &Store, id: i64, count: i64) {
        let base = Utc::now() - ChronoDuration::hours(1);
        for i in 0..count {
            store
                .record_failure(&Failure {
                    id: 0,
                    service_id: id,
                    time: base + ChronoDuration::seconds(i),
                    kind: FailureKind::Timeout,
                    issue: format!("failure {}", i),
                    status_code: None,
                    snippet: None,
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_delete_visibility_counts() {
        let (_tmp, engine) = engine();

        let public = engine.create_service(spec("public", true)).await.unwrap();
        assert_eq!(engine.list_services(Caller::Admin).await.unwrap().len(), 1);

        let private = engine.create_service(spec("private", false)).await.unwrap();
        assert_eq!(engine.list_services(Caller::Admin).await.unwrap().len(), 2);
        let anonymous = engine.list_services(Caller::Anonymous).await.unwrap();
        assert_eq!(anonymous.len(), 1);
        assert_eq!(anonymous[0].service.id, public.id);
        assert!(engine.scheduler.is_running(private.id).await);

        engine.delete_service(private.id).await.unwrap();
        assert_eq!(engine.list_services(Caller::Admin).await.unwrap().len(), 1);
        assert!(!engine.scheduler.is_running(private.id).await);
        assert!(matches!(
            engine.delete_service(private.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_private_service_not_authenticated() {
        let (_tmp, engine) = engine();
        let private = engine.create_service(spec("private", false)).await.unwrap();

        assert!(matches!(
            engine.get_service(private.id, Caller::Anonymous).await,
            Err(CoreError::NotAuthenticated)
        ));
        assert!(engine.get_service(private.id, Caller::Admin).await.is_ok());
        assert!(matches!(
            engine.get_service(9999, Caller::Anonymous).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            engine.failures(private.id, None, 0, Caller::Anonymous),
            Err(CoreError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_service_validation() {
        let (_tmp, engine) = engine();

        let cases = vec![
            ServiceSpec { check_interval: Some(0.0), ..spec("a", true) },
            ServiceSpec { timeout: Some(-1.0), ..spec("a", true) },
            ServiceSpec { check_interval: Some(1e20), ..spec("a", true) },
            ServiceSpec { timeout: Some(1e20), ..spec("a", true) },
            ServiceSpec { address: Some("  ".into()), ..spec("a", true) },
            ServiceSpec { expected: Some("(open".into()), ..spec("a", true) },
            ServiceSpec { expected_status: Some(42), ..spec("a", true) },
            ServiceSpec { method: Some("GE T".into()), ..spec("a", true) },
            ServiceSpec { name: None, ..spec("a", true) },
        ];
        for case in cases {
            assert!(matches!(
                engine.create_service(case.clone()).await,
                Err(CoreError::Validation(_))
            ), "{:?} should be rejected", case);
        }
        assert!(engine.list_services(Caller::Admin).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let (_tmp, engine) = engine();
        let created = engine.create_service(spec("api", true)).await.unwrap();

        let updated = engine
            .update_service(
                created.id,
                ServiceSpec {
                    name: Some("api v2".into()),
                    expected_status: Some(204),
                    group_id: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "api v2");
        assert_eq!(updated.expected_status, 204);
        assert_eq!(updated.group_id, 2);
        assert_eq!(updated.address, "https://example.com");
        assert_eq!(engine.store().get_service(created.id).unwrap().name, "api v2");

        assert!(matches!(
            engine.update_service(4242, ServiceSpec::default()).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_spec_accepts_legacy_names() {
        let parsed: ServiceSpec = serde_json::from_str(
            r#"{"name": "db", "domain": "db.local", "type": "tcp", "port": 5432, "check_interval": 30}"#,
        )
        .unwrap();
        let service = parsed.apply(Service::default());
        assert_eq!(service.address, "db.local");
        assert_eq!(service.probe_type, ProbeType::Tcp);
        assert_eq!(service.port, 5432);
        assert_eq!(service.check_interval, 30.0);
    }

    #[tokio::test]
    async fn test_failures_limit_and_delete() {
        let (_tmp, engine) = engine();
        let a = engine.create_service(spec("a", true)).await.unwrap();
        let b = engine.create_service(spec("b", true)).await.unwrap();
        add_failures(engine.store(), a.id, 125);
        add_failures(engine.store(), b.id, 4);

        let latest = engine.failures(a.id, Some(1), 0, Caller::Anonymous).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].issue, "failure 124");
        assert_eq!(engine.failures(a.id, None, 0, Caller::Anonymous).unwrap().len(), 125);

        assert_eq!(engine.delete_failures(a.id).unwrap(), 125);
        assert_eq!(engine.store().count_failures(a.id).unwrap(), 0);
        assert_eq!(engine.store().count_failures(b.id).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_reorder_is_atomic() {
        let (_tmp, engine) = engine();
        let a = engine.create_service(spec("a", true)).await.unwrap();
        let b = engine.create_service(spec("b", true)).await.unwrap();

        engine.reorder(&[(a.id, 2), (b.id, 1)]).unwrap();
        let names: Vec<_> = engine
            .list_services(Caller::Admin)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.service.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);

        assert!(matches!(
            engine.reorder(&[(a.id, 7), (999, 8)]),
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(engine.store().get_service(a.id).unwrap().order_id, 2);
    }

    #[tokio::test]
    async fn test_aggregate_through_engine() {
        let (_tmp, engine) = engine();
        let mut service = sample_service("graph");
        service.public = false;
        engine.store().add_service(&mut service).unwrap();

        let end = Utc::now();
        let start = end - ChronoDuration::hours(2);
        engine
            .store()
            .record_hit(&Hit {
                id: 0,
                service_id: service.id,
                time: end - ChronoDuration::minutes(5),
                latency_ns: 1_000,
                ping_ns: 500,
            })
            .unwrap();

        let buckets = engine
            .aggregate(service.id, SeriesKind::Hits, start, end, Some("1h"), Caller::Admin)
            .unwrap();
        assert!(buckets.len() == 2 || buckets.len() == 3);
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 1);

        assert!(matches!(
            engine.aggregate(service.id, SeriesKind::Hits, end, start, None, Caller::Admin),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            engine.aggregate(service.id, SeriesKind::Hits, start, end, Some("soon"), Caller::Admin),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            engine.aggregate(service.id, SeriesKind::Hits, start, end, None, Caller::Anonymous),
            Err(CoreError::NotAuthenticated)
        ));

        let up = engine.uptime(service.id, start, end, Caller::Admin).unwrap();
        assert_eq!(up.percent, Some(100.0));
    }

    #[tokio::test]
    async fn test_notifier_update_and_listing() {
        let (_tmp, engine) = engine();

        let listed = engine.list_notifiers().unwrap();
        assert_eq!(listed.len(), 4);
        assert!(listed.iter().all(|n| !n.config.enabled));

        // Enabling without the required URL fails validation and saves nothing
        let err = engine
            .update_notifier("slack", NotifierUpdate { enabled: Some(true), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(engine.store().get_notifier("slack").unwrap().is_none());

        let mut fields = BTreeMap::new();
        fields.insert("webhook_url".to_string(), "https://hooks.slack.com/services/T/B/X".to_string());
        fields.insert("username".to_string(), "uptrail".to_string());
        let view = engine
            .update_notifier(
                "slack",
                NotifierUpdate { enabled: Some(true), priority: Some(-1), fields },
            )
            .await
            .unwrap();
        assert!(view.config.enabled);
        assert!(!view.config.fields.contains_key("webhook_url"));

        // Secret survives a partial update that omits it
        let mut fields = BTreeMap::new();
        fields.insert("username".to_string(), String::new());
        engine
            .update_notifier("slack", NotifierUpdate { fields, ..Default::default() })
            .await
            .unwrap();
        let stored = engine.store().get_notifier("slack").unwrap().unwrap();
        assert!(stored.field("webhook_url").is_some());
        assert!(stored.field("username").is_none());

        let listed = engine.list_notifiers().unwrap();
        assert_eq!(listed[0].config.method, "slack");
        assert!(listed.iter().all(|n| !n.config.fields.contains_key("webhook_url")));

        assert!(matches!(engine.get_notifier("carrier-pigeon"), Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_notifier_test_path() {
        let (_tmp, engine) = engine();

        let mut fields = BTreeMap::new();
        fields.insert("command".to_string(), "exit 0".to_string());
        tokio_test::assert_ok!(
            engine
                .test_notifier("command", NotifierUpdate { fields, ..Default::default() })
                .await
        );

        let mut fields = BTreeMap::new();
        fields.insert("command".to_string(), "exit 1".to_string());
        assert!(matches!(
            engine
                .test_notifier("command", NotifierUpdate { fields, ..Default::default() })
                .await,
            Err(CoreError::NotifierDelivery(_))
        ));

        // Candidate is never saved
        assert!(engine.store().get_notifier("command").unwrap().is_none());
        assert!(matches!(
            engine.test_notifier("fax", NotifierUpdate::default()).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
