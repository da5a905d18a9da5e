//! Cron triggers for manifest-declared jobs.

use std::str::FromStr;
use std::sync::{Arc, Weak};

use chrono::Utc;
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ExtensionBootstrapError;
use crate::instance::ExtensionInstance;

/// Running job loops for one extension.
#[derive(Debug)]
pub struct ExtensionSchedulerHandle {
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ExtensionSchedulerHandle {
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Starts one trigger loop per declared job. Jobs begin firing at their
/// next scheduled time.
pub fn start_extension_scheduler(
    instance: &Arc<ExtensionInstance>,
) -> Result<ExtensionSchedulerHandle, ExtensionBootstrapError> {
    let runtime =
        tokio::runtime::Handle::try_current().map_err(|_| ExtensionBootstrapError::NoRuntime)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::with_capacity(instance.manifest().jobs.len());
    for (index, job) in instance.manifest().jobs.iter().enumerate() {
        let schedule = Schedule::from_str(&job.cron).map_err(|error| {
            ExtensionBootstrapError::InvalidCron {
                cron: job.cron.clone(),
                job: job.handler.clone(),
                message: error.to_string(),
            }
        })?;
        let weak = Arc::downgrade(instance);
        let handler = job.handler.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(runtime.spawn(async move {
            run_job_loop(weak, index, handler, schedule, shutdown_rx).await;
        }));
    }

    Ok(ExtensionSchedulerHandle {
        shutdown_tx: Some(shutdown_tx),
        tasks,
    })
}

async fn run_job_loop(
    instance: Weak<ExtensionInstance>,
    index: usize,
    handler: String,
    schedule: Schedule,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            debug!(job = %handler, "cron schedule has no further occurrences");
            return;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }
        if *shutdown_rx.borrow() {
            return;
        }

        let Some(instance) = instance.upgrade() else {
            return;
        };
        debug!(extension = %instance.name(), job = %handler, "running scheduled job");
        if let Err(error) = instance.run_job(index).await {
            warn!(
                extension = %instance.name(),
                job = %handler,
                error = %error,
                "scheduled job failed"
            );
        }
    }
}
