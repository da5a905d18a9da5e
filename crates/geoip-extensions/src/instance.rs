//! A bootstrapped extension: manifest, worker handle, and scheduler.

use std::sync::{mpsc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{ExtensionBootstrapError, ExtensionCallError};
use crate::loader::ExtensionPackage;
use crate::manifest::ExtensionManifest;
use crate::registrar::{ExtensionRequest, ExtensionResponse};
use crate::sandbox::{spawn_sandbox, Invocation, SandboxLimits, WorkerMessage};
use crate::scheduler::ExtensionSchedulerHandle;

/// How long a caller waits past the worker's own deadline before giving up.
const CALL_REPLY_GRACE: Duration = Duration::from_millis(500);

pub struct ExtensionInstance {
    package: ExtensionPackage,
    manifest: ExtensionManifest,
    sender: mpsc::Sender<WorkerMessage>,
    call_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
    scheduler: tokio::sync::Mutex<Option<ExtensionSchedulerHandle>>,
}

impl std::fmt::Debug for ExtensionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionInstance")
            .field("dir", &self.package.dir_name())
            .field("name", &self.manifest.name)
            .finish_non_exhaustive()
    }
}

impl ExtensionInstance {
    /// Brings the package's interpreter up and returns the running
    /// instance. Blocks the calling thread for the bootstrap duration.
    pub(crate) fn bootstrap(
        package: ExtensionPackage,
        http: reqwest::Client,
        runtime: Handle,
        limits: SandboxLimits,
    ) -> Result<Self, ExtensionBootstrapError> {
        let worker = spawn_sandbox(&package, http, runtime, limits)?;
        info!(
            extension = %worker.manifest.name,
            dir = %package.dir_name(),
            endpoints = worker.manifest.endpoints.len(),
            jobs = worker.manifest.jobs.len(),
            has_lookup = worker.manifest.has_lookup,
            "extension bootstrapped"
        );
        Ok(Self {
            package,
            manifest: worker.manifest,
            sender: worker.sender,
            call_timeout: limits.call_timeout,
            worker: Mutex::new(Some(worker.thread)),
            scheduler: tokio::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    pub fn has_lookup(&self) -> bool {
        self.manifest.has_lookup
    }

    pub(crate) async fn attach_scheduler(&self, scheduler: ExtensionSchedulerHandle) {
        *self.scheduler.lock().await = Some(scheduler);
    }

    fn unavailable(&self) -> ExtensionCallError {
        ExtensionCallError::Unavailable {
            extension: self.manifest.name.clone(),
        }
    }

    async fn dispatch<T>(
        &self,
        invocation: impl FnOnce(oneshot::Sender<Result<T, ExtensionCallError>>) -> Invocation,
    ) -> Result<T, ExtensionCallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Invoke(invocation(reply_tx)))
            .map_err(|_| self.unavailable())?;
        match tokio::time::timeout(self.call_timeout + CALL_REPLY_GRACE, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.unavailable()),
            Err(_) => Err(ExtensionCallError::Timeout {
                extension: self.manifest.name.clone(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }

    /// Runs the handler of `self.manifest().endpoints[index]`.
    pub async fn call_endpoint(
        &self,
        index: usize,
        request: ExtensionRequest,
    ) -> Result<ExtensionResponse, ExtensionCallError> {
        self.dispatch(|reply| Invocation::Endpoint {
            handler: index,
            request,
            reply,
        })
        .await
    }

    /// Runs the handler of `self.manifest().jobs[index]` once.
    pub async fn run_job(&self, index: usize) -> Result<(), ExtensionCallError> {
        self.dispatch(|reply| Invocation::Job { job: index, reply })
            .await
    }

    /// Calls `lookupIP(address, caller)`. `Ok(None)` when the handler
    /// returned nothing.
    pub async fn lookup(
        &self,
        address: &str,
        caller: Option<&str>,
    ) -> Result<Option<Value>, ExtensionCallError> {
        if !self.has_lookup() {
            return Ok(None);
        }
        self.dispatch(|reply| Invocation::Lookup {
            address: address.to_string(),
            caller: caller.map(str::to_string),
            reply,
        })
        .await
    }

    /// Stops the scheduler, then the worker. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await;
        }
        let _ = self.sender.send(WorkerMessage::Shutdown);
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            let name = self.manifest.name.clone();
            let joined = tokio::task::spawn_blocking(move || worker.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(extension = %name, "extension worker did not exit cleanly");
            }
        }
    }
}

impl Drop for ExtensionInstance {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
    }
}
