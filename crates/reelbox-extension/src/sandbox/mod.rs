//! Per-extension QuickJS sandbox.
//!
//! Every loaded extension gets its own interpreter on its own worker
//! thread. The async side only ever talks to it through a job channel and a
//! oneshot reply, so a slow or hostile script can block nothing but itself.

mod worker;

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bindings::fetch::{FetchPolicy, MAX_HTTP_RESPONSE_BYTES};
use crate::bindings::ui::{UiAction, UiSink};
use crate::bindings::BindingConfig;
use crate::error::ExtensionError;
use crate::manifest::ExtensionKind;
use crate::marshal::Value;

/// Extra time the caller waits past the call deadline before giving up on a
/// worker that is stuck in native code.
const WORKER_BACKSTOP: Duration = Duration::from_secs(5);

/// Resource limits for every sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter heap limit in bytes (default: 64 MB).
    pub memory_limit: usize,
    /// Interpreter stack limit in bytes (default: 1 MB).
    pub max_stack_size: usize,
    /// Deadline for one call, including awaited host I/O (default: 30 s).
    pub call_timeout: Duration,
    /// Per-request `fetch` timeout unless the script asks for one (default: 30 s).
    pub http_timeout: Duration,
    /// Largest `fetch` response body accepted (default: 10 MB).
    pub max_response_bytes: usize,
    /// Refuse `fetch` to loopback and private networks (default: true).
    pub block_private_hosts: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            max_stack_size: 1024 * 1024,
            call_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(30),
            max_response_bytes: MAX_HTTP_RESPONSE_BYTES,
            block_private_hosts: true,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            memory_limit: std::env::var("EXTENSION_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.memory_limit),
            max_stack_size: std::env::var("EXTENSION_STACK_LIMIT_KB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.max_stack_size),
            call_timeout: std::env::var("EXTENSION_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.call_timeout),
            http_timeout: std::env::var("EXTENSION_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            max_response_bytes: std::env::var("EXTENSION_MAX_RESPONSE_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_response_bytes),
            block_private_hosts: std::env::var("EXTENSION_ALLOW_PRIVATE_HOSTS")
                .map(|v| !v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.block_private_hosts),
        }
    }
}

/// Everything needed to build one sandbox.
#[derive(Clone)]
pub struct SandboxSpec {
    pub extension_id: String,
    pub kind: ExtensionKind,
    pub source: Arc<str>,
    pub allowed_hosts: Vec<String>,
    pub preferences: BTreeMap<String, String>,
    pub ui_sink: Arc<dyn UiSink>,
    pub config: SandboxConfig,
}

impl std::fmt::Debug for SandboxSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSpec")
            .field("extension_id", &self.extension_id)
            .field("kind", &self.kind)
            .field("source_len", &self.source.len())
            .field("allowed_hosts", &self.allowed_hosts)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ─── Call records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    Resolved,
    Rejected,
    TimedOut,
}

/// Bookkeeping for a single call. Logged when the call finishes.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub call_id: Uuid,
    pub extension_id: String,
    pub method: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub started: Instant,
    pub state: CallState,
    pub result: Option<Value>,
}

impl CallRecord {
    pub fn begin(extension_id: &str, method: &str) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            extension_id: extension_id.to_string(),
            method: method.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            state: CallState::Pending,
            result: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(&mut self, outcome: &Result<Value, ExtensionError>) {
        self.state = match outcome {
            Ok(value) => {
                self.result = Some(value.clone());
                CallState::Resolved
            }
            Err(ExtensionError::Timeout(_)) => CallState::TimedOut,
            Err(_) => CallState::Rejected,
        };
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

pub(crate) enum Job {
    Call {
        method: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value, ExtensionError>>,
    },
    Ui {
        action: UiAction,
        reply: oneshot::Sender<Result<(), ExtensionError>>,
    },
}

/// Handle to a running sandbox. Dropping it stops the worker thread once
/// the job in progress (if any) has finished.
pub struct Sandbox {
    extension_id: String,
    kind: ExtensionKind,
    members: Vec<String>,
    call_timeout: Duration,
    jobs: mpsc::Sender<Job>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("extension_id", &self.extension_id)
            .field("kind", &self.kind)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Start the worker thread, evaluate the source and instantiate the
    /// extension.
    ///
    /// Must be called from within a tokio runtime: host I/O started by the
    /// script is spawned onto it.
    pub async fn spawn(spec: SandboxSpec) -> Result<Self, ExtensionError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ExtensionError::Sandbox(format!("no tokio runtime: {e}")))?;
        let bindings = BindingConfig {
            extension_id: spec.extension_id.clone(),
            fetch_policy: FetchPolicy {
                allowed_hosts: spec.allowed_hosts.clone(),
                block_private: spec.config.block_private_hosts,
                timeout: spec.config.http_timeout,
                max_body_bytes: spec.config.max_response_bytes,
            },
            preferences: spec.preferences.clone(),
            ui_sink: spec.ui_sink.clone(),
            runtime,
        };

        let call_timeout = spec.config.call_timeout;
        let extension_id = spec.extension_id.clone();
        let kind = spec.kind;
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("ext-{extension_id}"))
            .spawn(move || worker::run(spec, bindings, jobs_rx, ready_tx))
            .map_err(|e| ExtensionError::Sandbox(format!("cannot start worker: {e}")))?;

        let members = match tokio::time::timeout(call_timeout + WORKER_BACKSTOP, ready_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(ExtensionError::Sandbox(
                    "worker exited during startup".into(),
                ))
            }
            Err(_) => return Err(ExtensionError::Timeout(call_timeout)),
        };

        tracing::debug!(extension = %extension_id, ?members, "sandbox ready");

        Ok(Self {
            extension_id,
            kind,
            members,
            call_timeout,
            jobs: jobs_tx,
        })
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    /// Callable members the script exposed after instantiation.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Call `method` with `args` and wait for its settled value.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ExtensionError> {
        let mut record = CallRecord::begin(&self.extension_id, method);

        let outcome = if method.starts_with("__") {
            Err(ExtensionError::MethodNotFound(method.to_string()))
        } else {
            let (reply, rx) = oneshot::channel();
            self.submit(
                Job::Call {
                    method: method.to_string(),
                    args,
                    reply,
                },
                rx,
            )
            .await
        };

        record.finish(&outcome);
        tracing::debug!(
            extension = %self.extension_id,
            method = %method,
            call_id = %record.call_id,
            state = ?record.state,
            elapsed_ms = record.elapsed().as_millis() as u64,
            "extension call finished"
        );
        outcome
    }

    /// Deliver a UI action to a plugin and wait for its handlers to settle.
    pub async fn dispatch_ui(&self, action: UiAction) -> Result<(), ExtensionError> {
        if self.kind.is_provider() {
            return Err(ExtensionError::UnsupportedKind {
                kind: self.kind,
                operation: "dispatch_ui".into(),
            });
        }
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Ui { action, reply }, rx).await
    }

    async fn submit<T>(
        &self,
        job: Job,
        rx: oneshot::Receiver<Result<T, ExtensionError>>,
    ) -> Result<T, ExtensionError> {
        self.jobs
            .send(job)
            .map_err(|_| ExtensionError::Sandbox("worker is gone".into()))?;

        match tokio::time::timeout(self.call_timeout + WORKER_BACKSTOP, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExtensionError::Sandbox("worker dropped the call".into())),
            Err(_) => {
                tracing::error!(
                    extension = %self.extension_id,
                    "worker missed the call deadline; abandoning it"
                );
                Err(ExtensionError::Timeout(self.call_timeout))
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
