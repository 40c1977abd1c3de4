//! The sandbox worker thread.
//!
//! Owns the QuickJS runtime and the extension's [`HostBindings`]. Each job
//! starts a script call and then pumps the interpreter (microtasks, due
//! timers, host I/O completions) until the call settles or its deadline
//! passes.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::function::{Func, IntoArgs};
use rquickjs::{Array, Context, Ctx, FromJs, Function, Object, Runtime};
use serde_json::json;
use tokio::sync::oneshot;

use super::{Job, SandboxSpec};
use crate::bindings::ui::UiAction;
use crate::bindings::{BindingConfig, Completion, HostBindings};
use crate::error::ExtensionError;
use crate::manifest::ExtensionKind;
use crate::marshal::{from_js, to_js, Value};

const PRELUDE: &str = include_str!("prelude.js");

/// How often an idle plugin sandbox checks for finished host I/O.
const IDLE_POLL: Duration = Duration::from_millis(50);

enum Settled {
    Resolved(Value),
    Rejected {
        message: String,
        stack: Option<String>,
    },
}

/// Entry point of the worker thread.
pub(super) fn run(
    spec: SandboxSpec,
    config: BindingConfig,
    jobs: mpsc::Receiver<Job>,
    ready: oneshot::Sender<Result<Vec<String>, ExtensionError>>,
) {
    let mut worker = match Worker::new(&spec, config) {
        Ok(worker) => worker,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    match worker.start(&spec.source) {
        Ok(members) => {
            if ready.send(Ok(members)).is_err() {
                return;
            }
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    }
    drop(spec);

    worker.serve(jobs);
    tracing::debug!(extension = %worker.extension_id, "sandbox worker stopped");
}

/// Native side of `__host(op, json)`: dispatches to the bindings and wraps
/// the outcome in the `{ok, value | error}` envelope the prelude expects.
fn host_call(bindings: &RefCell<HostBindings>, op: &str, args: &str) -> String {
    let reply = match bindings.try_borrow_mut() {
        Err(_) => Err(format!("host operation {op} re-entered")),
        Ok(mut host) => match serde_json::from_str(args) {
            Ok(args) => host.dispatch(op, args).map_err(|e| e.to_string()),
            Err(e) => Err(format!("bad arguments for {op}: {e}")),
        },
    };
    match reply {
        Ok(value) => json!({ "ok": true, "value": value }),
        Err(error) => json!({ "ok": false, "error": error }),
    }
    .to_string()
}

/// Pull the pending exception out of `ctx` after a failed operation.
fn script_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> ExtensionError {
    if !matches!(err, rquickjs::Error::Exception) {
        return ExtensionError::Sandbox(err.to_string());
    }
    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        let message = exception.message().unwrap_or_default();
        let message = match exception.as_object().get::<_, String>("name") {
            Ok(name) if !name.is_empty() => format!("{name}: {message}"),
            _ => message,
        };
        return ExtensionError::Script {
            message,
            stack: exception.stack(),
        };
    }
    let message = thrown
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| format!("uncaught {:?} value", thrown.type_of()));
    ExtensionError::Script {
        message,
        stack: None,
    }
}

/// Script errors raised while evaluating or instantiating are compile errors.
fn compile_error(err: ExtensionError) -> ExtensionError {
    match err {
        ExtensionError::Script { message, .. } => ExtensionError::Compile(message),
        other => other,
    }
}

struct Worker {
    extension_id: String,
    kind: ExtensionKind,
    call_timeout: Duration,
    // Dropped before the runtime.
    context: Context,
    runtime: Runtime,
    bindings: Rc<RefCell<HostBindings>>,
    completions: mpsc::Receiver<Completion>,
    /// Interrupt deadline in milliseconds after `epoch`; zero when disarmed.
    deadline: Arc<AtomicU64>,
    epoch: Instant,
}

impl Worker {
    fn new(spec: &SandboxSpec, config: BindingConfig) -> Result<Self, ExtensionError> {
        let runtime = Runtime::new().map_err(|e| ExtensionError::Sandbox(e.to_string()))?;
        runtime.set_memory_limit(spec.config.memory_limit);
        runtime.set_max_stack_size(spec.config.max_stack_size);

        let epoch = Instant::now();
        let deadline = Arc::new(AtomicU64::new(0));
        let flag = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            let at = flag.load(Ordering::Relaxed);
            at != 0 && epoch.elapsed().as_millis() as u64 >= at
        })));

        let context =
            Context::full(&runtime).map_err(|e| ExtensionError::Sandbox(e.to_string()))?;

        let (tx, completions) = mpsc::channel();
        let bindings = Rc::new(RefCell::new(HostBindings::new(config, tx)?));

        let host = bindings.clone();
        context.with(|ctx| -> Result<(), ExtensionError> {
            let native = Func::from(move |op: String, args: String| host_call(&host, &op, &args));
            ctx.globals()
                .set("__host", native)
                .map_err(|e| ExtensionError::Sandbox(e.to_string()))?;
            ctx.eval::<(), _>(PRELUDE).map_err(|e| match script_error(&ctx, e) {
                ExtensionError::Script { message, .. } => {
                    ExtensionError::Sandbox(format!("prelude failed: {message}"))
                }
                other => other,
            })
        })?;

        Ok(Self {
            extension_id: spec.extension_id.clone(),
            kind: spec.kind,
            call_timeout: spec.config.call_timeout,
            context,
            runtime,
            bindings,
            completions,
            deadline,
            epoch,
        })
    }

    fn is_plugin(&self) -> bool {
        self.kind == ExtensionKind::Plugin
    }

    // ─── Deadline ───────────────────────────────────────────────────────

    fn arm(&self, deadline: Instant) {
        let ms = deadline.saturating_duration_since(self.epoch).as_millis() as u64;
        self.deadline.store(ms.max(1), Ordering::Relaxed);
        self.bindings.borrow_mut().set_deadline(Some(deadline));
    }

    fn disarm(&self) {
        self.deadline.store(0, Ordering::Relaxed);
        self.bindings.borrow_mut().set_deadline(None);
    }

    /// Any failure after the deadline is reported as a timeout.
    fn classify(&self, deadline: Instant, err: ExtensionError) -> ExtensionError {
        if Instant::now() >= deadline {
            ExtensionError::Timeout(self.call_timeout)
        } else {
            err
        }
    }

    // ─── Script entry points ────────────────────────────────────────────

    fn hook<A, R>(&self, name: &str, args: A) -> Result<R, ExtensionError>
    where
        A: for<'js> IntoArgs<'js>,
        R: for<'js> FromJs<'js>,
    {
        self.context.with(|ctx| {
            ctx.globals()
                .get::<_, Function>(name)
                .and_then(|f| f.call::<A, R>(args))
                .map_err(|e| script_error(&ctx, e))
        })
    }

    /// Evaluate the source, instantiate the extension and report its members.
    fn start(&mut self, source: &str) -> Result<Vec<String>, ExtensionError> {
        let deadline = Instant::now() + self.call_timeout;
        self.arm(deadline);

        let evaluated = self
            .context
            .with(|ctx| ctx.eval::<(), _>(source).map_err(|e| script_error(&ctx, e)));
        if let Err(e) = evaluated {
            self.disarm();
            return Err(compile_error(self.classify(deadline, e)));
        }

        let instantiated = self
            .hook::<_, ()>("__rbInstantiate", (self.kind.is_provider(),))
            .and_then(|()| self.pump(deadline, self.is_plugin()));
        let members = match instantiated {
            Ok(Settled::Resolved(_)) => self.hook::<_, Vec<String>>("__rbMembers", ()),
            Ok(Settled::Rejected { message, .. }) => Err(ExtensionError::Compile(message)),
            Err(e) => Err(compile_error(self.classify(deadline, e))),
        };
        self.disarm();
        self.end_call(self.is_plugin());
        members
    }

    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value, ExtensionError> {
        let deadline = Instant::now() + self.call_timeout;
        self.arm(deadline);

        let started = self.context.with(|ctx| -> Result<bool, ExtensionError> {
            let fail = |e: rquickjs::Error| script_error(&ctx, e);
            let array = Array::new(ctx.clone()).map_err(fail)?;
            for (index, arg) in args.iter().enumerate() {
                array
                    .set(index, to_js(&ctx, arg).map_err(fail)?)
                    .map_err(fail)?;
            }
            let begin: Function = ctx.globals().get("__rbBeginCall").map_err(fail)?;
            begin.call::<_, bool>((method, array)).map_err(fail)
        });

        let outcome = match started {
            Ok(false) => Err(ExtensionError::MethodNotFound(method.to_string())),
            Ok(true) => match self.pump(deadline, self.is_plugin()) {
                Ok(Settled::Resolved(value)) => Ok(value),
                Ok(Settled::Rejected { message, stack }) => {
                    Err(ExtensionError::Script { message, stack })
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(self.classify(deadline, e)),
        };
        self.disarm();
        self.end_call(self.is_plugin());
        outcome
    }

    fn dispatch_ui(&mut self, action: &UiAction) -> Result<(), ExtensionError> {
        let payload = serde_json::to_string(action)?;
        let deadline = Instant::now() + self.call_timeout;
        self.arm(deadline);

        let started = self.context.with(|ctx| -> Result<(), ExtensionError> {
            let fail = |e: rquickjs::Error| script_error(&ctx, e);
            let action = ctx.json_parse(payload).map_err(fail)?;
            let dispatch: Function = ctx.globals().get("__rbUiDispatch").map_err(fail)?;
            dispatch.call::<_, ()>((action,)).map_err(fail)
        });

        let outcome = match started {
            Ok(()) => match self.pump(deadline, true) {
                Ok(Settled::Resolved(_)) => Ok(()),
                Ok(Settled::Rejected { message, stack }) => {
                    Err(ExtensionError::Script { message, stack })
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(self.classify(deadline, e)),
        };
        self.disarm();
        self.end_call(true);
        outcome
    }

    /// Release per-call state. Plugins keep their timers and pending host
    /// operations between calls.
    fn end_call(&self, keep_state: bool) {
        self.bindings.borrow_mut().end_call(keep_state);
        if let Err(e) = self.hook::<_, ()>("__rbEndCall", (keep_state,)) {
            tracing::warn!(extension = %self.extension_id, error = %e, "failed to reset call state");
        }
    }

    // ─── Event loop ─────────────────────────────────────────────────────

    /// Drive the interpreter until the tracked call settles.
    ///
    /// With `quiesce` the call also waits for outstanding host operations
    /// and one-shot timers, so UI handlers that fire and forget still run.
    fn pump(&self, deadline: Instant, quiesce: bool) -> Result<Settled, ExtensionError> {
        self.arm(deadline);
        self.pump_until(deadline, quiesce)
            .map_err(|e| self.classify(deadline, e))
    }

    fn pump_until(&self, deadline: Instant, quiesce: bool) -> Result<Settled, ExtensionError> {
        loop {
            self.run_jobs()?;

            let settled = self.settled()?;
            if let Some(settled) = settled {
                if !quiesce || self.is_quiet() {
                    return Ok(settled);
                }
            }

            if Instant::now() >= deadline {
                return Err(ExtensionError::Timeout(self.call_timeout));
            }

            if self.fire_due_timers()? {
                continue;
            }

            match self.completions.try_recv() {
                Ok(completion) => {
                    self.deliver(completion)?;
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(ExtensionError::Sandbox("completion channel closed".into()))
                }
            }

            // A promise nothing can settle still waits out the deadline.
            let next_timer = self.bindings.borrow_mut().timers().next_deadline();
            let wake = next_timer.map_or(deadline, |at| at.min(deadline));
            match self
                .completions
                .recv_timeout(wake.saturating_duration_since(Instant::now()))
            {
                Ok(completion) => self.deliver(completion)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ExtensionError::Sandbox("completion channel closed".into()))
                }
            }
        }
    }

    fn run_jobs(&self) -> Result<(), ExtensionError> {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(_) => {
                    return Err(ExtensionError::Script {
                        message: "uncaught exception in pending job".into(),
                        stack: None,
                    })
                }
            }
        }
    }

    fn settled(&self) -> Result<Option<Settled>, ExtensionError> {
        self.context.with(|ctx| -> Result<Option<Settled>, ExtensionError> {
            let fail = |e: rquickjs::Error| script_error(&ctx, e);
            let state: Option<Object> = ctx
                .globals()
                .get::<_, Function>("__rbState")
                .and_then(|f| f.call(()))
                .map_err(fail)?;
            let Some(state) = state else {
                return Ok(None);
            };
            if !state.get::<_, bool>("settled").map_err(fail)? {
                return Ok(None);
            }
            if state.get::<_, bool>("ok").map_err(fail)? {
                let value: rquickjs::Value = state.get("value").map_err(fail)?;
                Ok(Some(Settled::Resolved(from_js(&ctx, &value)?)))
            } else {
                Ok(Some(Settled::Rejected {
                    message: state.get("message").map_err(fail)?,
                    stack: state.get("stack").map_err(fail)?,
                }))
            }
        })
    }

    fn is_quiet(&self) -> bool {
        let mut host = self.bindings.borrow_mut();
        host.in_flight() == 0
            && !host.timers().has_pending_timeouts()
            && !self.runtime.is_job_pending()
    }

    fn fire_due_timers(&self) -> Result<bool, ExtensionError> {
        let due = self.bindings.borrow_mut().timers().pop_due(Instant::now());
        for id in &due {
            self.hook::<_, ()>("__rbFireTimer", (*id as f64,))?;
        }
        Ok(!due.is_empty())
    }

    fn deliver(&self, completion: Completion) -> Result<(), ExtensionError> {
        self.bindings.borrow_mut().delivered();
        let (ok, payload) = match completion.outcome {
            Ok(value) => (true, serde_json::to_string(&value)?),
            Err(message) => (false, message),
        };
        self.hook::<_, ()>("__rbSettle", (completion.ticket as f64, ok, payload))
    }

    // ─── Job loop ───────────────────────────────────────────────────────

    /// Plugins with live timers or outstanding fetches keep running between
    /// calls.
    fn has_background_work(&self) -> bool {
        if !self.is_plugin() {
            return false;
        }
        let mut host = self.bindings.borrow_mut();
        host.in_flight() > 0 || !host.timers().is_empty()
    }

    fn idle_tick(&self) -> Result<(), ExtensionError> {
        let deadline = Instant::now() + self.call_timeout;
        self.arm(deadline);
        let result = (|| -> Result<(), ExtensionError> {
            while let Ok(completion) = self.completions.try_recv() {
                self.deliver(completion)?;
            }
            self.fire_due_timers()?;
            self.run_jobs()
        })();
        self.disarm();
        result.map_err(|e| self.classify(deadline, e))
    }

    fn serve(&mut self, jobs: mpsc::Receiver<Job>) {
        loop {
            let job = if self.has_background_work() {
                let poll = Instant::now() + IDLE_POLL;
                let wake = self
                    .bindings
                    .borrow_mut()
                    .timers()
                    .next_deadline()
                    .map_or(poll, |at| at.min(poll));
                match jobs.recv_timeout(wake.saturating_duration_since(Instant::now())) {
                    Ok(job) => job,
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = self.idle_tick() {
                            tracing::warn!(
                                extension = %self.extension_id,
                                error = %e,
                                "background script work failed; stopping sandbox"
                            );
                            return;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            } else {
                match jobs.recv() {
                    Ok(job) => job,
                    Err(_) => return,
                }
            };

            let discard = match job {
                Job::Call {
                    method,
                    args,
                    reply,
                } => {
                    let result = self.call(&method, &args);
                    let discard = matches!(&result, Err(e) if e.discards_sandbox());
                    let _ = reply.send(result);
                    discard
                }
                Job::Ui { action, reply } => {
                    let result = self.dispatch_ui(&action);
                    let discard = matches!(&result, Err(e) if e.discards_sandbox());
                    let _ = reply.send(result);
                    discard
                }
            };
            if discard {
                tracing::debug!(extension = %self.extension_id, "discarding sandbox after failed call");
                return;
            }
        }
    }
}
