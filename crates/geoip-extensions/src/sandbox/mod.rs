//! Interpreter worker: one OS thread per extension owns its QuickJS
//! runtime and serializes every entry into it.
//!
//! The thread bootstraps the script (capabilities, prelude, entry file,
//! `install()`), reports the manifest back, then loops over
//! [`WorkerMessage`]s. A call runs until its handler has settled and every
//! host operation it started has been applied, or until its deadline.
//! Invocations arriving mid-call are queued and run afterwards.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rquickjs::{
    CatchResultExt, Context, Ctx, Exception, Function, Object, Persistent, Runtime, Value,
};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bridge::{AsyncBridge, CallId, Settlement};
use crate::capability::{install_capabilities, CapabilityScope};
use crate::error::{ExtensionBootstrapError, ExtensionCallError};
use crate::loader::ExtensionPackage;
use crate::manifest::{parse_extension_manifest, ExtensionManifest, LOOKUP_HANDLER_SYMBOL};
use crate::registrar::{ExtensionRequest, ExtensionResponse};

const PRELUDE_SOURCE: &str = include_str!("prelude.js");
const INSTALL_SYMBOL: &str = "install";
/// Extra wait for the worker's own bootstrap report past the script deadline.
const BOOTSTRAP_REPORT_GRACE: Duration = Duration::from_secs(1);

pub(crate) type EndpointReply = oneshot::Sender<Result<ExtensionResponse, ExtensionCallError>>;
pub(crate) type JobReply = oneshot::Sender<Result<(), ExtensionCallError>>;
pub(crate) type LookupReply = oneshot::Sender<Result<Option<serde_json::Value>, ExtensionCallError>>;

pub(crate) enum Invocation {
    Endpoint {
        handler: usize,
        request: ExtensionRequest,
        reply: EndpointReply,
    },
    Job {
        job: usize,
        reply: JobReply,
    },
    Lookup {
        address: String,
        caller: Option<String>,
        reply: LookupReply,
    },
}

impl Invocation {
    fn is_abandoned(&self) -> bool {
        match self {
            Self::Endpoint { reply, .. } => reply.is_closed(),
            Self::Job { reply, .. } => reply.is_closed(),
            Self::Lookup { reply, .. } => reply.is_closed(),
        }
    }
}

pub(crate) enum WorkerMessage {
    Invoke(Invocation),
    Settled(Settlement),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SandboxLimits {
    pub call_timeout: Duration,
    pub bootstrap_timeout: Duration,
    pub memory_limit_bytes: usize,
}

/// A running worker whose script has installed successfully.
pub(crate) struct SandboxWorker {
    pub manifest: ExtensionManifest,
    pub sender: mpsc::Sender<WorkerMessage>,
    pub thread: JoinHandle<()>,
}

/// Starts the worker thread and blocks until bootstrap reports back.
pub(crate) fn spawn_sandbox(
    package: &ExtensionPackage,
    http: reqwest::Client,
    runtime: Handle,
    limits: SandboxLimits,
) -> Result<SandboxWorker, ExtensionBootstrapError> {
    let (sender, receiver) = mpsc::channel::<WorkerMessage>();
    let (boot_tx, boot_rx) = mpsc::sync_channel(1);
    let worker_package = package.clone();
    let worker_sender = sender.clone();

    let thread = thread::Builder::new()
        .name(format!("ext-{}", package.dir_name()))
        .spawn(move || {
            let worker = match Worker::bootstrap(&worker_package, worker_sender, http, runtime, limits)
            {
                Ok(worker) => worker,
                Err(error) => {
                    let _ = boot_tx.send(Err(error));
                    return;
                }
            };
            if boot_tx.send(Ok(worker.manifest.clone())).is_err() {
                return;
            }
            worker.run(receiver);
        })
        .map_err(|error| ExtensionBootstrapError::Interpreter(error.to_string()))?;

    match boot_rx.recv_timeout(limits.bootstrap_timeout + BOOTSTRAP_REPORT_GRACE) {
        Ok(Ok(manifest)) => Ok(SandboxWorker {
            manifest,
            sender,
            thread,
        }),
        Ok(Err(error)) => {
            let _ = thread.join();
            Err(error)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            let _ = sender.send(WorkerMessage::Shutdown);
            Err(ExtensionBootstrapError::Timeout(
                limits.bootstrap_timeout.as_millis() as u64,
            ))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            let _ = thread.join();
            Err(ExtensionBootstrapError::WorkerExited)
        }
    }
}

/// State of the call currently executing on the worker. Shared with the
/// `callSettled` and `respond` natives.
#[derive(Default)]
struct ActiveCall {
    id: CallId,
    outcome: Option<Result<Option<String>, String>>,
    responder: Option<EndpointReply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallStatus {
    Finished,
    TimedOut,
    Shutdown,
}

enum CallReply {
    Endpoint,
    Job(JobReply),
    Lookup(LookupReply),
}

/// Resolved script functions. Declared first in [`Worker`] so the
/// persistent handles are released before the context and runtime.
struct SandboxBindings {
    invoke: Persistent<Function<'static>>,
    settle: Persistent<Function<'static>>,
    endpoints: Vec<Persistent<Function<'static>>>,
    lookup: Option<Persistent<Function<'static>>>,
    jobs: Vec<Persistent<Function<'static>>>,
}

struct Worker {
    bindings: SandboxBindings,
    bridge: Rc<AsyncBridge>,
    active: Rc<RefCell<ActiveCall>>,
    deadline: Arc<Mutex<Option<Instant>>>,
    manifest: ExtensionManifest,
    call_timeout: Duration,
    next_call_id: CallId,
    context: Context,
    runtime: Runtime,
}

fn set_deadline(deadline: &Mutex<Option<Instant>>, value: Option<Instant>) {
    if let Ok(mut guard) = deadline.lock() {
        *guard = value;
    }
}

fn deadline_passed(deadline: &Mutex<Option<Instant>>) -> bool {
    deadline
        .lock()
        .map(|guard| guard.is_some_and(|deadline| Instant::now() >= deadline))
        .unwrap_or(false)
}

fn install_call_bindings<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    active: &Rc<RefCell<ActiveCall>>,
) -> rquickjs::Result<()> {
    let settled_state = Rc::clone(active);
    host.set(
        "callSettled",
        Function::new(
            ctx.clone(),
            move |call_id: f64, ok: bool, payload: Option<String>| {
                let mut active = settled_state.borrow_mut();
                if active.id != call_id as CallId || active.outcome.is_some() {
                    return;
                }
                active.outcome = Some(if ok {
                    Ok(payload)
                } else {
                    Err(payload.unwrap_or_else(|| "handler failed".to_string()))
                });
            },
        )?,
    )?;

    let respond_state = Rc::clone(active);
    host.set(
        "respond",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, call_id: f64, status: f64, mime: String, body: String| {
                if status.fract() != 0.0 || !(100.0..=999.0).contains(&status) {
                    return Err(Exception::throw_range(
                        &ctx,
                        &format!("invalid HTTP status code {status}"),
                    ));
                }
                let mut active = respond_state.borrow_mut();
                if active.id != call_id as CallId {
                    return Ok(false);
                }
                let Some(responder) = active.responder.take() else {
                    return Ok(false);
                };
                let _ = responder.send(Ok(ExtensionResponse {
                    status: status as u16,
                    content_type: mime,
                    body,
                }));
                Ok(true)
            },
        )?,
    )
}

impl Worker {
    fn bootstrap(
        package: &ExtensionPackage,
        sender: mpsc::Sender<WorkerMessage>,
        http: reqwest::Client,
        runtime_handle: Handle,
        limits: SandboxLimits,
    ) -> Result<Self, ExtensionBootstrapError> {
        let source = std::fs::read_to_string(package.entry_path()).map_err(|source| {
            ExtensionBootstrapError::Io {
                path: package.entry_path().to_path_buf(),
                source,
            }
        })?;

        let interpreter_error =
            |error: rquickjs::Error| ExtensionBootstrapError::Interpreter(error.to_string());
        let runtime = Runtime::new().map_err(interpreter_error)?;
        runtime.set_memory_limit(limits.memory_limit_bytes);
        let deadline = Arc::new(Mutex::new(Some(Instant::now() + limits.bootstrap_timeout)));
        let interrupt_deadline = Arc::clone(&deadline);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            deadline_passed(&interrupt_deadline)
        })));
        let context = Context::full(&runtime).map_err(interpreter_error)?;

        let bridge = Rc::new(AsyncBridge::new(sender, runtime_handle));
        let scope = Rc::new(CapabilityScope::new(
            package.dir_name(),
            package.store_dir(),
            http,
            Rc::clone(&bridge),
        ));
        let active = Rc::new(RefCell::new(ActiveCall::default()));
        let bootstrap_timeout_ms = limits.bootstrap_timeout.as_millis() as u64;
        let script_error = |message: String| {
            if deadline_passed(&deadline) {
                ExtensionBootstrapError::Timeout(bootstrap_timeout_ms)
            } else {
                ExtensionBootstrapError::Script(message)
            }
        };

        let (manifest, bindings) = context.with(|ctx| {
            let host = Object::new(ctx.clone()).map_err(interpreter_error)?;
            install_capabilities(&ctx, &host, &scope).map_err(interpreter_error)?;
            install_call_bindings(&ctx, &host, &active).map_err(interpreter_error)?;

            let prelude: Function = ctx
                .eval(PRELUDE_SOURCE)
                .catch(&ctx)
                .map_err(|error| ExtensionBootstrapError::Interpreter(error.to_string()))?;
            let bridge_object: Object = prelude
                .call((host,))
                .catch(&ctx)
                .map_err(|error| ExtensionBootstrapError::Interpreter(error.to_string()))?;
            let invoke: Function = bridge_object.get("invoke").map_err(interpreter_error)?;
            let settle: Function = bridge_object.get("settle").map_err(interpreter_error)?;

            ctx.eval::<(), _>(source)
                .catch(&ctx)
                .map_err(|error| script_error(error.to_string()))?;

            let globals = ctx.globals();
            let install = globals
                .get::<_, Value>(INSTALL_SYMBOL)
                .map_err(interpreter_error)?
                .into_function()
                .ok_or(ExtensionBootstrapError::MissingInstall(INSTALL_SYMBOL))?;
            let returned: Value = install
                .call(())
                .catch(&ctx)
                .map_err(|error| script_error(error.to_string()))?;
            let rendered = ctx
                .json_stringify(returned)
                .catch(&ctx)
                .map_err(|error| ExtensionBootstrapError::ManifestShape(error.to_string()))?
                .map(|text| text.to_string())
                .transpose()
                .map_err(|error| ExtensionBootstrapError::ManifestShape(error.to_string()))?
                .ok_or_else(|| {
                    ExtensionBootstrapError::ManifestShape("install() returned undefined".into())
                })?;
            let manifest = parse_extension_manifest(&rendered)?;

            let resolve = |symbol: &str, declared_by: String| {
                globals
                    .get::<_, Value>(symbol)
                    .map_err(interpreter_error)?
                    .into_function()
                    .map(|function| Persistent::save(&ctx, function))
                    .ok_or_else(|| ExtensionBootstrapError::MissingHandler {
                        symbol: symbol.to_string(),
                        declared_by,
                    })
            };
            let endpoints = manifest
                .endpoints
                .iter()
                .map(|endpoint| {
                    resolve(
                        &endpoint.handler,
                        format!("endpoint {} '{}'", endpoint.method, manifest.route_path(endpoint)),
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            let lookup = if manifest.has_lookup {
                Some(resolve(LOOKUP_HANDLER_SYMBOL, "hasLookup".to_string())?)
            } else {
                None
            };
            let jobs = manifest
                .jobs
                .iter()
                .map(|job| resolve(&job.handler, format!("job '{}'", job.cron)))
                .collect::<Result<Vec<_>, _>>()?;

            Ok::<_, ExtensionBootstrapError>((
                manifest,
                SandboxBindings {
                    invoke: Persistent::save(&ctx, invoke),
                    settle: Persistent::save(&ctx, settle),
                    endpoints,
                    lookup,
                    jobs,
                },
            ))
        })?;

        let worker = Self {
            bindings,
            bridge,
            active,
            deadline,
            manifest,
            call_timeout: limits.call_timeout,
            next_call_id: 1,
            context,
            runtime,
        };
        worker.drain_jobs();
        set_deadline(&worker.deadline, None);
        Ok(worker)
    }

    fn run(mut self, receiver: mpsc::Receiver<WorkerMessage>) {
        let mut deferred = VecDeque::new();
        loop {
            let message = match deferred.pop_front() {
                Some(invocation) => WorkerMessage::Invoke(invocation),
                None => match receiver.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            match message {
                WorkerMessage::Invoke(invocation) => {
                    if !self.execute(invocation, &receiver, &mut deferred) {
                        break;
                    }
                }
                WorkerMessage::Settled(settlement) => self.apply_settlement(settlement),
                WorkerMessage::Shutdown => break,
            }
        }
        debug!(
            extension = %self.manifest.name,
            dropped = deferred.len(),
            "extension worker stopped"
        );
    }

    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    debug!(extension = %self.manifest.name, "pending script job raised");
                }
            }
        }
    }

    /// Runs one invocation to completion. Returns `false` when a shutdown
    /// request arrived while the call was in flight.
    fn execute(
        &mut self,
        invocation: Invocation,
        receiver: &mpsc::Receiver<WorkerMessage>,
        deferred: &mut VecDeque<Invocation>,
    ) -> bool {
        if invocation.is_abandoned() {
            debug!(extension = %self.manifest.name, "skipping abandoned invocation");
            return true;
        }

        let call_id = self.next_call_id;
        self.next_call_id += 1;
        let deadline = Instant::now() + self.call_timeout;

        let (kind, handler, payload, reply, responder) = match invocation {
            Invocation::Endpoint {
                handler,
                request,
                reply,
            } => (
                "endpoint",
                self.bindings.endpoints.get(handler).cloned(),
                serde_json::to_string(&request).unwrap_or_else(|_| "{}".to_string()),
                CallReply::Endpoint,
                Some(reply),
            ),
            Invocation::Job { job, reply } => (
                "job",
                self.bindings.jobs.get(job).cloned(),
                "{}".to_string(),
                CallReply::Job(reply),
                None,
            ),
            Invocation::Lookup {
                address,
                caller,
                reply,
            } => (
                "lookup",
                self.bindings.lookup.clone(),
                json!({ "address": address, "caller": caller.unwrap_or_default() }).to_string(),
                CallReply::Lookup(reply),
                None,
            ),
        };

        *self.active.borrow_mut() = ActiveCall {
            id: call_id,
            outcome: None,
            responder,
        };
        set_deadline(&self.deadline, Some(deadline));
        let previous_owner = self.bridge.enter_call(call_id);

        let started = match handler {
            Some(handler) => self.start_call(call_id, kind, handler, payload),
            None => Err(format!("no {kind} handler is bound for this invocation")),
        };
        if let Err(message) = started {
            let mut active = self.active.borrow_mut();
            if active.outcome.is_none() {
                active.outcome = Some(Err(message));
            }
        }
        self.drain_jobs();

        let mut status = CallStatus::TimedOut;
        loop {
            let finished = self.active.borrow().outcome.is_some()
                && self.bridge.outstanding_for(call_id) == 0;
            if finished {
                status = CallStatus::Finished;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match receiver.recv_timeout(deadline - now) {
                Ok(WorkerMessage::Settled(settlement)) => self.apply_settlement(settlement),
                Ok(WorkerMessage::Invoke(next)) => deferred.push_back(next),
                Ok(WorkerMessage::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    status = CallStatus::Shutdown;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
            }
        }
        // Script errors observed past the deadline are the interrupt firing.
        if status == CallStatus::Finished
            && Instant::now() >= deadline
            && matches!(self.active.borrow().outcome, Some(Err(_)))
        {
            status = CallStatus::TimedOut;
        }

        set_deadline(&self.deadline, None);
        let pending_ops = self.bridge.outstanding_for(call_id);
        self.bridge.enter_call(previous_owner);
        let active = std::mem::take(&mut *self.active.borrow_mut());
        self.finish_call(active, reply, status, pending_ops);
        status != CallStatus::Shutdown
    }

    fn start_call(
        &self,
        call_id: CallId,
        kind: &str,
        handler: Persistent<Function<'static>>,
        payload: String,
    ) -> Result<(), String> {
        self.context.with(|ctx| {
            let invoke = self
                .bindings
                .invoke
                .clone()
                .restore(&ctx)
                .map_err(|error| error.to_string())?;
            let handler = handler.restore(&ctx).map_err(|error| error.to_string())?;
            invoke
                .call::<_, ()>((handler, call_id as f64, kind, payload))
                .catch(&ctx)
                .map_err(|error| error.to_string())
        })
    }

    fn finish_call(
        &self,
        active: ActiveCall,
        reply: CallReply,
        status: CallStatus,
        pending_ops: usize,
    ) {
        let extension = self.manifest.name.clone();
        let outcome = match (status, active.outcome) {
            (CallStatus::Shutdown, _) | (CallStatus::Finished, None) => {
                Err(ExtensionCallError::Unavailable {
                    extension: extension.clone(),
                })
            }
            (CallStatus::TimedOut, Some(Ok(payload))) if pending_ops > 0 => {
                warn!(
                    extension = %extension,
                    pending_ops,
                    "handler settled but host operations were still pending at the deadline"
                );
                Ok(payload)
            }
            (CallStatus::TimedOut, _) => Err(ExtensionCallError::Timeout {
                extension: extension.clone(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
            (CallStatus::Finished, Some(Ok(payload))) => Ok(payload),
            (CallStatus::Finished, Some(Err(message))) => Err(ExtensionCallError::Script {
                extension: extension.clone(),
                message,
            }),
        };

        if let Err(error) = &outcome {
            warn!(extension = %extension, error = %error, "extension call failed");
        }

        match reply {
            CallReply::Endpoint => {
                if let Some(responder) = active.responder {
                    let result = match outcome {
                        Ok(_) => Err(ExtensionCallError::NoResponse { extension }),
                        Err(error) => Err(error),
                    };
                    let _ = responder.send(result);
                }
            }
            CallReply::Job(reply) => {
                let _ = reply.send(outcome.map(|_| ()));
            }
            CallReply::Lookup(reply) => {
                let result = outcome.and_then(|payload| match payload {
                    None => Ok(None),
                    Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|error| {
                        ExtensionCallError::Script {
                            extension,
                            message: format!("lookup result is not valid JSON: {error}"),
                        }
                    }),
                });
                let _ = reply.send(result);
            }
        }
    }

    fn apply_settlement(&self, settlement: Settlement) {
        let Some(owner) = self.bridge.claim(settlement.op_id) else {
            return;
        };
        // Continuations of a call that already ended still run under a
        // fresh deadline.
        let idle = self.active.borrow().id == 0;
        if idle {
            set_deadline(&self.deadline, Some(Instant::now() + self.call_timeout));
        }
        let previous_owner = self.bridge.enter_call(owner);

        let (ok, payload) = match settlement.outcome {
            Ok(payload) => (true, payload),
            Err(message) => (false, Some(message)),
        };
        let result = self.context.with(|ctx| {
            let settle = self
                .bindings
                .settle
                .clone()
                .restore(&ctx)
                .map_err(|error| error.to_string())?;
            settle
                .call::<_, bool>((settlement.op_id as f64, ok, payload))
                .catch(&ctx)
                .map_err(|error| error.to_string())
        });
        if let Err(message) = result {
            debug!(
                extension = %self.manifest.name,
                op_id = settlement.op_id,
                error = %message,
                "failed to settle pending operation"
            );
        }
        self.drain_jobs();

        self.bridge.enter_call(previous_owner);
        if idle {
            set_deadline(&self.deadline, None);
        }
    }
}
