//! Assembles the running extension set from an extensions directory.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use geoip_cli::Cli;
use serde_json::Value;
use tracing::{info, warn};

use crate::capability::fetch::build_fetch_client;
use crate::error::{ExtensionBootstrapError, ExtensionHostError};
use crate::fanout::collect_additional_data;
use crate::instance::ExtensionInstance;
use crate::loader::{discover_extension_packages, ExtensionPackage};
use crate::registrar::build_extension_router;
use crate::sandbox::SandboxLimits;
use crate::scheduler::start_extension_scheduler;

/// Deadline for evaluating an entry script and running `install()`.
pub const EXTENSION_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);
pub const EXTENSION_CALL_TIMEOUT_DEFAULT: Duration = Duration::from_millis(5_000);
pub const EXTENSION_MEMORY_LIMIT_DEFAULT_BYTES: usize = 64 * 1024 * 1024;

/// What to do when one extension fails to bootstrap. Load errors are
/// always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapFailurePolicy {
    #[default]
    Abort,
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExtensionHostOptions {
    pub root: PathBuf,
    pub call_timeout: Duration,
    pub memory_limit_bytes: usize,
    pub failure_policy: BootstrapFailurePolicy,
}

impl ExtensionHostOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            call_timeout: EXTENSION_CALL_TIMEOUT_DEFAULT,
            memory_limit_bytes: EXTENSION_MEMORY_LIMIT_DEFAULT_BYTES,
            failure_policy: BootstrapFailurePolicy::Abort,
        }
    }

    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            root: cli.extensions_dir.clone(),
            call_timeout: Duration::from_millis(cli.extension_call_timeout_ms),
            memory_limit_bytes: cli.extension_memory_limit_mb.saturating_mul(1024 * 1024),
            failure_policy: if cli.skip_broken_extensions {
                BootstrapFailurePolicy::Skip
            } else {
                BootstrapFailurePolicy::Abort
            },
        }
    }

    fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            call_timeout: self.call_timeout,
            bootstrap_timeout: EXTENSION_BOOTSTRAP_TIMEOUT,
            memory_limit_bytes: self.memory_limit_bytes,
        }
    }
}

/// Every successfully bootstrapped extension, in discovery order.
#[derive(Debug, Default)]
pub struct ExtensionHost {
    instances: Vec<Arc<ExtensionInstance>>,
}

impl ExtensionHost {
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn load(options: ExtensionHostOptions) -> Result<Self, ExtensionHostError> {
        let http =
            build_fetch_client().map_err(|error| ExtensionHostError::HttpClient(error.to_string()))?;
        Self::load_with_client(options, http).await
    }

    /// Discovers, bootstraps, and schedules every package under
    /// `options.root`. Must run inside a Tokio runtime.
    pub async fn load_with_client(
        options: ExtensionHostOptions,
        http: reqwest::Client,
    ) -> Result<Self, ExtensionHostError> {
        let packages = discover_extension_packages(&options.root)?;
        info!(
            root = %options.root.display(),
            count = packages.len(),
            "discovered extension packages"
        );

        let mut host = Self::empty();
        let mut names = HashSet::new();
        for package in packages {
            let dir = package.dir_name().to_string();
            match bring_up(package, &options, http.clone(), &names).await {
                Ok(instance) => {
                    names.insert(instance.name().to_string());
                    host.instances.push(instance);
                }
                Err(error) => match options.failure_policy {
                    BootstrapFailurePolicy::Abort => {
                        host.shutdown().await;
                        return Err(ExtensionHostError::Bootstrap { dir, source: error });
                    }
                    BootstrapFailurePolicy::Skip => {
                        warn!(dir = %dir, error = %error, "skipping extension that failed to bootstrap");
                    }
                },
            }
        }
        Ok(host)
    }

    pub fn instances(&self) -> &[Arc<ExtensionInstance>] {
        &self.instances
    }

    pub fn instance(&self, name: &str) -> Option<&Arc<ExtensionInstance>> {
        self.instances.iter().find(|instance| instance.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn router(&self) -> Router {
        build_extension_router(&self.instances)
    }

    pub async fn lookup_additional_data(&self, address: &str, caller: Option<&str>) -> Vec<Value> {
        collect_additional_data(&self.instances, address, caller).await
    }

    pub async fn shutdown(&self) {
        for instance in &self.instances {
            instance.shutdown().await;
        }
    }
}

async fn bring_up(
    package: ExtensionPackage,
    options: &ExtensionHostOptions,
    http: reqwest::Client,
    taken_names: &HashSet<String>,
) -> Result<Arc<ExtensionInstance>, ExtensionBootstrapError> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|_| ExtensionBootstrapError::NoRuntime)?;
    let limits = options.limits();
    let blocking_runtime = runtime.clone();
    let instance = runtime
        .spawn_blocking(move || ExtensionInstance::bootstrap(package, http, blocking_runtime, limits))
        .await
        .map_err(|_| ExtensionBootstrapError::WorkerExited)??;

    if taken_names.contains(instance.name()) {
        let name = instance.name().to_string();
        instance.shutdown().await;
        return Err(ExtensionBootstrapError::DuplicateName(name));
    }

    let instance = Arc::new(instance);
    match start_extension_scheduler(&instance) {
        Ok(scheduler) => instance.attach_scheduler(scheduler).await,
        Err(error) => {
            instance.shutdown().await;
            return Err(error);
        }
    }
    Ok(instance)
}
