//! Capability bindings injected into every sandbox.
//!
//! The script reaches all of them through one native function,
//! `__host(op, json)`, which the prelude wraps into the globals extensions
//! program against (`fetch`, `FormData`, `CryptoJS`, `Buffer`, `Doc`,
//! `$torrentUtils`, `$fuzzy`, `$ui`, `console`, timers, `$sleep` and
//! `$getUserPreference`).
//!
//! Synchronous operations answer in place. Asynchronous ones answer with a
//! ticket and report a [`Completion`] to the sandbox worker later.

pub mod crypto;
pub mod document;
pub mod fetch;
pub mod form;
pub mod fuzzy;
pub mod timers;
pub mod torrent;
pub mod ui;

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::bindings::crypto::{AesKey, CryptoError, Encoding};
use crate::bindings::document::{DocumentError, DocumentStore, Traversal};
use crate::bindings::fetch::{FetchError, FetchPolicy, FetchRequest, Fetcher};
use crate::bindings::timers::TimerQueue;
use crate::bindings::torrent::TorrentError;
use crate::bindings::ui::{UiBridge, UiSink};
use crate::error::ExtensionError;

/// Maximum log message length from extensions.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Sanitize a log message from an extension.
///
/// Strips control characters (except newline/tab), truncates to max length.
pub(crate) fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

/// Errors reported back to the script as thrown exceptions.
#[derive(Error, Debug)]
pub enum BindingError {
    #[error("unknown host operation '{0}'")]
    UnknownOp(String),

    #[error("bad arguments for {op}: {message}")]
    BadArguments { op: String, message: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error("ui event rejected: {0}")]
    Ui(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl From<BindingError> for ExtensionError {
    fn from(e: BindingError) -> Self {
        ExtensionError::Binding(e.to_string())
    }
}

/// Result of an asynchronous host operation.
#[derive(Debug)]
pub struct Completion {
    pub ticket: u64,
    pub outcome: Result<serde_json::Value, String>,
}

/// Everything needed to build a sandbox's bindings. Crosses into the
/// sandbox thread, so it only holds `Send` data.
#[derive(Clone)]
pub struct BindingConfig {
    pub extension_id: String,
    pub fetch_policy: FetchPolicy,
    /// Saved values merged over manifest defaults.
    pub preferences: BTreeMap<String, String>,
    pub ui_sink: Arc<dyn UiSink>,
    pub runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for BindingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingConfig")
            .field("extension_id", &self.extension_id)
            .field("fetch_policy", &self.fetch_policy)
            .field("preferences", &self.preferences.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Per-sandbox capability state. Lives on the sandbox thread only.
pub struct HostBindings {
    extension_id: String,
    runtime: tokio::runtime::Handle,
    fetcher: Fetcher,
    completions: mpsc::Sender<Completion>,
    next_ticket: u64,
    in_flight: usize,
    documents: DocumentStore,
    timers: TimerQueue,
    ui: UiBridge,
    preferences: BTreeMap<String, String>,
    /// End of the running call; `$sleep` never blocks past it.
    deadline: Option<Instant>,
}

impl std::fmt::Debug for HostBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBindings")
            .field("extension_id", &self.extension_id)
            .field("in_flight", &self.in_flight)
            .field("documents", &self.documents)
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

// ─── Argument shapes ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MessageArgs {
    message: String,
}

#[derive(Deserialize)]
struct TimerArgs {
    #[serde(default)]
    delay: f64,
    #[serde(default)]
    repeat: bool,
}

#[derive(Deserialize)]
struct IdArgs {
    id: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyArg {
    Text(String),
    Raw(Vec<u8>),
}

#[derive(Deserialize)]
struct AesArgs {
    data: Vec<u8>,
    key: KeyArg,
    #[serde(default)]
    iv: Option<Vec<u8>>,
}

#[derive(Deserialize)]
struct StringifyArgs {
    encoding: String,
    bytes: Vec<u8>,
}

#[derive(Deserialize)]
struct ParseArgs {
    encoding: String,
    text: String,
}

#[derive(Deserialize)]
struct HtmlArgs {
    html: String,
}

#[derive(Deserialize)]
struct TraverseArgs {
    id: usize,
    traversal: Traversal,
}

#[derive(Deserialize)]
struct SelectionArgs {
    id: usize,
}

#[derive(Deserialize)]
struct AttrArgs {
    id: usize,
    name: String,
}

#[derive(Deserialize)]
struct IsArgs {
    id: usize,
    selector: String,
}

#[derive(Deserialize)]
struct BytesArgs {
    bytes: Vec<u8>,
}

#[derive(Deserialize)]
struct Base64Args {
    data: String,
}

#[derive(Deserialize)]
struct BestMatchArgs {
    title: String,
    candidates: Vec<String>,
}

#[derive(Deserialize)]
struct CompareArgs {
    a: String,
    b: String,
}

#[derive(Deserialize)]
struct KeyLookup {
    key: String,
}

#[derive(Deserialize)]
struct SleepArgs {
    #[serde(default)]
    ms: f64,
}

#[derive(Deserialize)]
struct FormArgs {
    fields: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct UiEmitArgs {
    event: serde_json::Value,
}

fn args<T: DeserializeOwned>(op: &str, value: serde_json::Value) -> Result<T, BindingError> {
    serde_json::from_value(value).map_err(|e| BindingError::BadArguments {
        op: op.to_string(),
        message: e.to_string(),
    })
}

impl HostBindings {
    pub fn new(
        config: BindingConfig,
        completions: mpsc::Sender<Completion>,
    ) -> Result<Self, BindingError> {
        Ok(Self {
            ui: UiBridge::new(config.extension_id.clone(), config.ui_sink),
            fetcher: Fetcher::new(config.fetch_policy)?,
            extension_id: config.extension_id,
            runtime: config.runtime,
            completions,
            next_ticket: 0,
            in_flight: 0,
            documents: DocumentStore::new(),
            timers: TimerQueue::new(),
            preferences: config.preferences,
            deadline: None,
        })
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Asynchronous operations started but not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Marks one asynchronous operation as delivered to the script.
    pub fn delivered(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn timers(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    pub fn document_count(&self) -> usize {
        self.documents.document_count()
    }

    /// Set while a call or background tick runs.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Releases per-call state. Timers survive only when `keep_timers` is set.
    pub fn end_call(&mut self, keep_timers: bool) {
        self.documents.clear();
        if !keep_timers {
            self.timers.clear_all();
        }
    }

    /// Runs one host operation requested by the script.
    pub fn dispatch(
        &mut self,
        op: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, BindingError> {
        match op {
            // ── Console ─────────────────────────────────────────────
            "console.log" | "console.info" | "console.warn" | "console.error"
            | "console.debug" => {
                let MessageArgs { message } = args(op, value)?;
                self.log(op, &message);
                Ok(serde_json::Value::Null)
            }

            // ── Fetch ───────────────────────────────────────────────
            "fetch" => {
                let request: FetchRequest = args(op, value)?;
                Ok(json!({ "ticket": self.spawn_fetch(request) }))
            }

            "form.encode" => {
                let FormArgs { fields } = args(op, value)?;
                Ok(json!(form::encode(&fields)))
            }

            // ── Timers ──────────────────────────────────────────────
            "core.sleep" => {
                let SleepArgs { ms } = args(op, value)?;
                self.sleep(ms);
                Ok(serde_json::Value::Null)
            }
            "timer.set" => {
                let TimerArgs { delay, repeat } = args(op, value)?;
                let delay = if delay.is_finite() && delay > 0.0 {
                    Duration::from_secs_f64(delay / 1000.0)
                } else {
                    Duration::ZERO
                };
                Ok(json!(self.timers.set(delay, repeat, Instant::now())))
            }
            "timer.clear" => {
                let IdArgs { id } = args(op, value)?;
                self.timers.clear(id);
                Ok(serde_json::Value::Null)
            }

            // ── Crypto and encoders ─────────────────────────────────
            "crypto.aesEncrypt" | "crypto.aesDecrypt" => {
                let AesArgs { data, key, iv } = args(op, value)?;
                let key = match &key {
                    KeyArg::Text(text) => AesKey::Text(text),
                    KeyArg::Raw(raw) => AesKey::Raw(raw),
                };
                let out = if op == "crypto.aesEncrypt" {
                    crypto::aes_encrypt(&data, key, iv.as_deref())?
                } else {
                    crypto::aes_decrypt(&data, key, iv.as_deref())?
                };
                Ok(json!(out))
            }
            "encoding.stringify" => {
                let StringifyArgs { encoding, bytes } = args(op, value)?;
                Ok(json!(Encoding::from_name(&encoding)?.stringify(&bytes)?))
            }
            "encoding.parse" => {
                let ParseArgs { encoding, text } = args(op, value)?;
                Ok(json!(Encoding::from_name(&encoding)?.parse(&text)?))
            }

            // ── Documents ───────────────────────────────────────────
            "doc.parse" => {
                let HtmlArgs { html } = args(op, value)?;
                Ok(json!(self.documents.parse(&html)?))
            }
            "doc.traverse" => {
                let TraverseArgs { id, traversal } = args(op, value)?;
                Ok(json!(self.documents.traverse(id, traversal)?))
            }
            "doc.text" => {
                let SelectionArgs { id } = args(op, value)?;
                Ok(json!(self.documents.text(id)?))
            }
            "doc.html" => {
                let SelectionArgs { id } = args(op, value)?;
                Ok(json!(self.documents.html(id)?))
            }
            "doc.attr" => {
                let AttrArgs { id, name } = args(op, value)?;
                Ok(json!(self.documents.attr(id, &name)?))
            }
            "doc.attrs" => {
                let SelectionArgs { id } = args(op, value)?;
                Ok(json!(self.documents.attrs(id)?))
            }
            "doc.is" => {
                let IsArgs { id, selector } = args(op, value)?;
                Ok(json!(self.documents.is(id, &selector)?))
            }

            // ── Torrents ────────────────────────────────────────────
            "torrent.parse" => {
                let BytesArgs { bytes } = args(op, value)?;
                Ok(json!(torrent::parse(&bytes)?))
            }
            "torrent.magnet" => {
                let Base64Args { data } = args(op, value)?;
                Ok(json!(torrent::magnet_from_base64(&data)?))
            }

            // ── Fuzzy matching ──────────────────────────────────────
            "fuzzy.findBestMatch" => {
                let BestMatchArgs { title, candidates } = args(op, value)?;
                Ok(json!(fuzzy::find_best_match(&title, &candidates)))
            }
            "fuzzy.compare" => {
                let CompareArgs { a, b } = args(op, value)?;
                Ok(json!(fuzzy::compare(&a, &b)))
            }

            // ── Preferences and UI ──────────────────────────────────
            "prefs.get" => {
                let KeyLookup { key } = args(op, value)?;
                Ok(json!(self.preferences.get(&key)))
            }
            "ui.emit" => {
                let UiEmitArgs { event } = args(op, value)?;
                self.ui
                    .emit_json(event)
                    .map_err(|e| BindingError::Ui(e.to_string()))?;
                Ok(serde_json::Value::Null)
            }

            other => Err(BindingError::UnknownOp(other.to_string())),
        }
    }

    fn log(&self, op: &str, message: &str) {
        let msg = sanitize_log_message(message);
        let extension = self.extension_id.as_str();
        match op {
            "console.error" => tracing::error!(extension = %extension, "{msg}"),
            "console.warn" => tracing::warn!(extension = %extension, "{msg}"),
            "console.debug" => tracing::debug!(extension = %extension, "{msg}"),
            _ => tracing::info!(extension = %extension, "{msg}"),
        }
    }

    /// Blocks the sandbox thread, cut short at the call deadline.
    fn sleep(&self, ms: f64) {
        if !ms.is_finite() || ms <= 0.0 {
            return;
        }
        let mut until = Instant::now() + Duration::from_secs_f64(ms.min(u32::MAX as f64) / 1000.0);
        if let Some(deadline) = self.deadline {
            until = until.min(deadline);
        }
        std::thread::sleep(until.saturating_duration_since(Instant::now()));
    }

    fn spawn_fetch(&mut self, request: FetchRequest) -> u64 {
        self.next_ticket += 1;
        self.in_flight += 1;
        let ticket = self.next_ticket;
        let fetcher = self.fetcher.clone();
        let completions = self.completions.clone();
        let extension = self.extension_id.clone();

        tracing::debug!(extension = %extension, ticket, url = %request.url, "fetch started");
        self.runtime.spawn(async move {
            let outcome = match fetcher.fetch(request).await {
                Ok(resp) => serde_json::to_value(resp).map_err(|e| e.to_string()),
                Err(e) => {
                    tracing::debug!(extension = %extension, ticket, error = %e, "fetch failed");
                    Err(e.to_string())
                }
            };
            // The sandbox may be gone by now; nothing to deliver to then.
            let _ = completions.send(Completion { ticket, outcome });
        });
        ticket
    }
}
