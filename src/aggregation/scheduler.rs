//! Periodic aggregation runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{AggregationEngine, RunReport};

/// Owns the timer task that runs [`AggregationEngine::run_all`] for each
/// tenant. Starting a running scheduler or stopping a stopped one is a no-op.
pub struct AggregationScheduler {
    engine: Arc<AggregationEngine>,
    tenants: Arc<Vec<String>>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AggregationScheduler {
    pub fn new(engine: Arc<AggregationEngine>, tenants: Vec<String>, interval: Duration) -> Self {
        Self {
            engine,
            tenants: Arc::new(tenants),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Run every tenant once, in order.
    pub async fn run_once(&self) -> Vec<RunReport> {
        run_tenants(&self.engine, &self.tenants).await
    }

    /// Spawn the timer task. The first run happens immediately.
    ///
    /// Returns false when already running.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let engine = self.engine.clone();
        let tenants = self.tenants.clone();
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                run_tenants(&engine, &tenants).await;
            }
        }));
        info!(
            tenants = self.tenants.len(),
            interval_secs = self.interval.as_secs(),
            "Aggregation scheduler started"
        );
        true
    }

    /// Abort the timer task. Returns false when not running.
    pub async fn stop(&self) -> bool {
        match self.task.lock().await.take() {
            Some(handle) => {
                handle.abort();
                info!("Aggregation scheduler stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

async fn run_tenants(engine: &AggregationEngine, tenants: &[String]) -> Vec<RunReport> {
    let mut reports = Vec::with_capacity(tenants.len());
    for tenant in tenants {
        let report = engine.run_all(tenant).await;
        if report.failed() > 0 {
            warn!(tenant = %tenant, failed = report.failed(), "Aggregation run had failures");
        }
        reports.push(report);
    }
    reports
}
