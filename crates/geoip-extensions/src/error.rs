//! Error taxonomy for extension discovery, bootstrap, and per-call execution.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures while scanning the extension root. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ExtensionLoadError {
    #[error("extension root '{}' is not a directory", path.display())]
    RootNotDirectory { path: PathBuf },
    #[error("failed to read extension directory '{}': {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("extension folder '{dir}' doesn't have an entry point ({entry})")]
    MissingEntry { dir: String, entry: &'static str },
}

/// Failures while bringing one extension's interpreter up.
#[derive(Debug, Error)]
pub enum ExtensionBootstrapError {
    #[error("failed to read entry file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create interpreter: {0}")]
    Interpreter(String),
    #[error("entry script failed: {0}")]
    Script(String),
    #[error("entry script must define a callable '{0}' function")]
    MissingInstall(&'static str),
    #[error("install() did not return a manifest object: {0}")]
    ManifestShape(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("{declared_by} references '{symbol}' but no callable function with that name is defined")]
    MissingHandler { symbol: String, declared_by: String },
    #[error("extension name '{0}' is already used by another extension")]
    DuplicateName(String),
    #[error("invalid cron expression '{cron}' for job '{job}': {message}")]
    InvalidCron {
        cron: String,
        job: String,
        message: String,
    },
    #[error("scheduler requires an active Tokio runtime")]
    NoRuntime,
    #[error("bootstrap timed out after {0} ms")]
    Timeout(u64),
    #[error("interpreter worker exited before bootstrap completed")]
    WorkerExited,
}

/// Startup failure for the whole extension set.
#[derive(Debug, Error)]
pub enum ExtensionHostError {
    #[error(transparent)]
    Load(#[from] ExtensionLoadError),
    #[error("extension '{dir}' failed to bootstrap: {source}")]
    Bootstrap {
        dir: String,
        #[source]
        source: ExtensionBootstrapError,
    },
    #[error("failed to build the shared fetch client: {0}")]
    HttpClient(String),
}

/// Failure of a single endpoint, job, or lookup call into an extension.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtensionCallError {
    #[error("extension '{extension}' did not complete within {timeout_ms} ms")]
    Timeout { extension: String, timeout_ms: u64 },
    #[error("extension '{extension}' raised: {message}")]
    Script { extension: String, message: String },
    #[error("extension '{extension}' handler finished without sending a response")]
    NoResponse { extension: String },
    #[error("extension '{extension}' is not accepting calls")]
    Unavailable { extension: String },
}

impl ExtensionCallError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Script { .. } | Self::NoResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ExtensionCallError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({
                "success": false,
                "status": self.to_string(),
            })),
        )
            .into_response()
    }
}
