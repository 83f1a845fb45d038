//! Scheduler module for running probes on each service's cadence.
//!
//! One worker per enabled service, kept in an explicit registry keyed by
//! service id. A service never has more than one probe in flight: a tick that
//! finds the previous probe still running is skipped, not queued. The permit
//! belongs to the service, not the worker, so it outlives a restart.

mod retention;

pub use retention::*;

use crate::db::{DbError, Failure, Hit, Service, Store};
use crate::notify::Dispatcher;
use crate::probe::{ProbeOutcome, Prober};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct Worker {
    stop_tx: broadcast::Sender<()>,
    /// Cleared on stop so an in-flight probe's result is dropped
    active: Arc<AtomicBool>,
}

/// Shared pieces a worker needs to run and record probes.
#[derive(Clone)]
struct ProbeContext {
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    dispatcher: Arc<Dispatcher>,
}

/// Owns the per-service probe workers.
pub struct Scheduler {
    ctx: ProbeContext,
    workers: Arc<RwLock<HashMap<i64, Worker>>>,
    /// One permit per service id, kept across stop/start until the service is removed
    in_flight: Arc<RwLock<HashMap<i64, Arc<Semaphore>>>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, prober: Arc<dyn Prober>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            ctx: ProbeContext {
                store,
                prober,
                dispatcher,
            },
            workers: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a worker for every enabled service in the store.
    pub async fn start(&self) -> Result<(), DbError> {
        let services = self.ctx.store.get_services()?;

        info!("Starting scheduler with {} services", services.len());

        for service in services {
            self.start_service(service).await;
        }

        Ok(())
    }

    /// Begin monitoring `service`. No-op when disabled or already running.
    pub async fn start_service(&self, service: Service) {
        if !service.enabled {
            debug!("Scheduler: Service {} is disabled, not starting", service.name);
            return;
        }

        let mut workers = self.workers.write().await;
        if workers.contains_key(&service.id) {
            return;
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let active = Arc::new(AtomicBool::new(true));
        workers.insert(
            service.id,
            Worker {
                stop_tx,
                active: active.clone(),
            },
        );
        drop(workers);

        let in_flight = self
            .in_flight
            .write()
            .await
            .entry(service.id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        info!("Scheduler: Monitoring {} every {}s", service.name, service.check_interval);

        tokio::spawn(run_service_loop(
            Arc::new(service),
            self.ctx.clone(),
            in_flight,
            active,
            stop_rx,
        ));
    }

    /// Restart monitoring with an updated service definition.
    pub async fn replace_service(&self, service: Service) {
        self.stop_service(service.id).await;
        self.start_service(service).await;
    }

    /// Stop monitoring a service. Returns whether a worker was running.
    ///
    /// An in-flight probe finishes but its result is discarded.
    pub async fn stop_service(&self, id: i64) -> bool {
        let Some(worker) = self.workers.write().await.remove(&id) else {
            return false;
        };

        worker.active.store(false, Ordering::SeqCst);
        let _ = worker.stop_tx.send(());
        info!("Scheduler: Stopped service {}", id);
        true
    }

    /// Stop monitoring a deleted service and forget its probe permit.
    pub async fn remove_service(&self, id: i64) -> bool {
        let stopped = self.stop_service(id).await;
        self.in_flight.write().await.remove(&id);
        stopped
    }

    pub async fn is_running(&self, id: i64) -> bool {
        self.workers.read().await.contains_key(&id)
    }

    pub async fn running_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Stop every worker.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.write().await;
        for (_, worker) in workers.drain() {
            worker.active.store(false, Ordering::SeqCst);
            let _ = worker.stop_tx.send(());
        }
    }
}

fn tick_interval(service: &Service) -> Duration {
    match Duration::try_from_secs_f64(service.check_interval) {
        Ok(d) if service.check_interval > 0.0 => d.max(MIN_INTERVAL),
        _ => Duration::from_secs(60),
    }
}

/// Run the probe loop for a single service until stopped.
async fn run_service_loop(
    service: Arc<Service>,
    ctx: ProbeContext,
    in_flight: Arc<Semaphore>,
    active: Arc<AtomicBool>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tick_interval(&service));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = ticker.tick() => {
                let permit = match in_flight.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        debug!("Skipping tick for {}: previous probe still running", service.name);
                        continue;
                    }
                };

                let service = service.clone();
                let ctx = ctx.clone();
                let active = active.clone();

                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until done

                    let outcome = ctx.prober.probe(&service).await;

                    if !active.load(Ordering::SeqCst) {
                        debug!("Discarding probe result for stopped service {}", service.name);
                        return;
                    }

                    record_outcome(&ctx.store, &service, &outcome);
                    // Deliveries run on their own tasks
                    let _ = ctx.dispatcher.observe(&service, &outcome).await;
                });
            }
        }
    }

    debug!("Probe loop for {} exited", service.name);
}

fn duration_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Persist one outcome. Storage errors are logged, never propagated.
fn record_outcome(store: &Store, service: &Service, outcome: &ProbeOutcome) {
    let written = match &outcome.result {
        Ok(reading) => store.record_hit(&Hit {
            id: 0,
            service_id: service.id,
            time: outcome.time,
            latency_ns: duration_ns(reading.latency),
            ping_ns: duration_ns(reading.ping),
        }),
        Err(e) => {
            warn!("Probe failed for {}: {}", service.name, e);
            store.record_failure(&Failure {
                id: 0,
                service_id: service.id,
                time: outcome.time,
                kind: e.kind(),
                issue: e.to_string(),
                status_code: e.status_code(),
                snippet: e.snippet().map(str::to_string),
            })
        }
    };

    if let Err(e) = written {
        error!("Failed to record probe result for {}: {}", service.name, e);
    }
}
