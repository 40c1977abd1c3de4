//! Extension registry: discovery, lifecycle and the host call surface.
//!
//! The `ExtensionRegistry` is the only component the host talks to. It
//! turns manifests into running sandboxes, keeps failed extensions
//! registered in quarantine so their errors stay inspectable, hot-reloads
//! changed sources and routes host calls to the right sandbox.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::bindings::ui::{LogUiSink, UiAction, UiSink};
use crate::contract::{validate_result, validate_shape};
use crate::error::{ExtensionError, InvokeError, LoadError};
use crate::manifest::{ExtensionKind, ExtensionManifest, PreferenceType, MANIFEST_FILE_NAME};
use crate::marshal::Value;
use crate::sandbox::{Sandbox, SandboxConfig, SandboxSpec};

/// Version checked against `min_host_version` in manifests.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory scanned by `discover()`; one sub-directory per extension.
    pub extension_dir: PathBuf,
    /// How long `unload()` waits for an in-flight call (default: 5 s).
    pub unload_grace: Duration,
    pub host_version: String,
    pub sandbox: SandboxConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            extension_dir: PathBuf::from("/data/extensions"),
            unload_grace: Duration::from_secs(5),
            host_version: HOST_VERSION.to_string(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            extension_dir: std::env::var("EXTENSION_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.extension_dir),
            unload_grace: std::env::var("EXTENSION_UNLOAD_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.unload_grace),
            host_version: defaults.host_version,
            sandbox: SandboxConfig::from_env(),
        }
    }
}

// ─── Public views ───────────────────────────────────────────────────────

/// Returned by a successful load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionHandle {
    pub id: String,
    pub kind: ExtensionKind,
    pub version: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionStatus {
    Active,
    Quarantined,
}

/// Snapshot of one registered extension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: ExtensionKind,
    pub status: ExtensionStatus,
    /// Load error that put the extension in quarantine.
    pub error: Option<String>,
    /// SHA-256 of the loaded source, hex encoded.
    pub source_hash: Option<String>,
}

/// Outcome of a `discover()` pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub loaded: Vec<ExtensionHandle>,
    pub failed: Vec<LoadError>,
}

// ─── Entries ────────────────────────────────────────────────────────────

fn sha256_hex(data: &[u8]) -> String {
    data_encoding::HEXLOWER.encode(&Sha256::digest(data))
}

/// A successfully loaded extension.
///
/// The sandbox slot is also the per-extension call lock: holding it for the
/// whole call keeps calls to one extension strictly serialized. An empty
/// slot means the sandbox was discarded and is rebuilt on next use.
struct LoadedExtension {
    manifest: ExtensionManifest,
    spec: SandboxSpec,
    source_hash: String,
    members: Vec<String>,
    sandbox: Arc<Mutex<Option<Sandbox>>>,
    /// Set once the entry left the registry; an empty slot then stays empty.
    retired: AtomicBool,
    /// Ordered UI action queue, drained by one task per plugin.
    ui_queue: OnceLock<mpsc::UnboundedSender<UiAction>>,
}

impl LoadedExtension {
    fn id(&self) -> &str {
        self.manifest.id()
    }

    fn kind(&self) -> ExtensionKind {
        self.manifest.kind()
    }

    fn handle(&self) -> ExtensionHandle {
        ExtensionHandle {
            id: self.id().to_string(),
            kind: self.kind(),
            version: self.manifest.extension.version.clone(),
            members: self.members.clone(),
        }
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Queue a UI action; the drain task is started on first use.
    fn enqueue_ui(self: &Arc<Self>, action: UiAction) -> Result<(), ExtensionError> {
        let queue = self.ui_queue.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drain_ui_queue(Arc::downgrade(self), rx));
            tx
        });
        queue
            .send(action)
            .map_err(|_| ExtensionError::NotAvailable(self.id().to_string()))
    }

    async fn dispatch_ui(&self, action: UiAction) -> Result<(), ExtensionError> {
        let mut slot = self.sandbox.lock().await;
        self.ensure(&mut slot).await?;
        let sandbox = slot
            .as_ref()
            .ok_or_else(|| ExtensionError::NotAvailable(self.id().to_string()))?;

        let result = sandbox.dispatch_ui(action).await;
        if let Err(ref e) = result {
            if e.discards_sandbox() {
                *slot = None;
            }
        }
        result
    }

    /// Make sure the slot holds a sandbox, rebuilding a discarded one.
    async fn ensure(&self, slot: &mut Option<Sandbox>) -> Result<(), ExtensionError> {
        if slot.is_some() {
            return Ok(());
        }
        if self.retired.load(Ordering::SeqCst) {
            return Err(ExtensionError::NotAvailable(self.id().to_string()));
        }
        tracing::info!(extension = %self.id(), "rebuilding discarded sandbox");
        *slot = Some(Sandbox::spawn(self.spec.clone()).await?);
        Ok(())
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ExtensionError> {
        let mut slot = self.sandbox.lock().await;
        self.ensure(&mut slot).await?;
        let sandbox = slot
            .as_ref()
            .ok_or_else(|| ExtensionError::NotAvailable(self.id().to_string()))?;

        let result = sandbox.call(method, args).await;
        if let Err(ref e) = result {
            if e.discards_sandbox() {
                tracing::warn!(
                    extension = %self.id(),
                    method = %method,
                    error = %e,
                    "discarding sandbox after failed call"
                );
                *slot = None;
            }
        }
        result
    }
}

/// Runs queued UI actions one at a time. Ends when the extension is dropped.
async fn drain_ui_queue(
    extension: Weak<LoadedExtension>,
    mut actions: mpsc::UnboundedReceiver<UiAction>,
) {
    while let Some(action) = actions.recv().await {
        let Some(loaded) = extension.upgrade() else {
            break;
        };
        if let Err(e) = loaded.dispatch_ui(action).await {
            tracing::warn!(extension = %loaded.id(), error = %e, "ui action failed");
        }
    }
}

enum Entry {
    Active(Arc<LoadedExtension>),
    Quarantined {
        manifest: Option<ExtensionManifest>,
        error: String,
        generation: u64,
    },
}

/// Identity of an entry as seen by an operation that releases the map lock
/// while it works.
enum Seen {
    Active(Arc<LoadedExtension>),
    Quarantined(u64),
}

impl Entry {
    fn seen(&self) -> Seen {
        match self {
            Entry::Active(loaded) => Seen::Active(loaded.clone()),
            Entry::Quarantined { generation, .. } => Seen::Quarantined(*generation),
        }
    }

    fn is(&self, seen: &Seen) -> bool {
        match (self, seen) {
            (Entry::Active(a), Seen::Active(b)) => Arc::ptr_eq(a, b),
            (Entry::Quarantined { generation, .. }, Seen::Quarantined(g)) => generation == g,
            _ => false,
        }
    }
}

// ─── Registry ───────────────────────────────────────────────────────────

/// Central extension registry.
///
/// Thread-safe: the entry map sits behind an async `RwLock` that is only
/// held to clone or swap entries, never while a script runs.
pub struct ExtensionRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    /// User preference values, kept across reloads.
    preferences: RwLock<HashMap<String, BTreeMap<String, String>>>,
    ui_sink: Arc<dyn UiSink>,
    config: RegistryConfig,
    quarantines: AtomicU64,
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExtensionRegistry {
    /// Create an empty registry. Does NOT load anything; call `discover()`
    /// or `load()` afterwards.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            preferences: RwLock::new(HashMap::new()),
            ui_sink: Arc::new(LogUiSink),
            config,
            quarantines: AtomicU64::new(0),
        }
    }

    /// Route plugin UI events to `sink` instead of the log.
    pub fn with_ui_sink(mut self, sink: Arc<dyn UiSink>) -> Self {
        self.ui_sink = sink;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // ── Loading ──────────────────────────────────────────────────────

    /// Load every `*/extension.toml` under the extension directory.
    ///
    /// A failing extension is logged and reported; it never stops the scan.
    pub async fn discover(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let dir = &self.config.extension_dir;

        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "cannot scan extension directory: {e}");
                return report;
            }
        };

        let mut manifests = Vec::new();
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let manifest_path = entry.path().join(MANIFEST_FILE_NAME);
                    if tokio::fs::try_exists(&manifest_path).await.unwrap_or(false) {
                        manifests.push(manifest_path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), "error while scanning extensions: {e}");
                    break;
                }
            }
        }
        manifests.sort();

        for path in manifests {
            match self.load_from_path(&path).await {
                Ok(handle) => report.loaded.push(handle),
                Err(e) => {
                    tracing::error!(path = %path.display(), "failed to load extension: {e}");
                    report.failed.push(e);
                }
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "extension discovery finished"
        );
        report
    }

    /// Load an extension from its manifest file or from the directory that
    /// contains it.
    pub async fn load_from_path(&self, path: impl AsRef<Path>) -> Result<ExtensionHandle, LoadError> {
        let path = path.as_ref();
        let manifest_path = if path.is_dir() {
            path.join(MANIFEST_FILE_NAME)
        } else {
            path.to_path_buf()
        };
        let manifest = ExtensionManifest::from_file(&manifest_path).await.map_err(|e| {
            let id = manifest_path
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| manifest_path.display().to_string());
            LoadError::new(id, e)
        })?;
        self.load(manifest).await
    }

    /// Validate, compile and register an extension.
    ///
    /// On failure the extension is kept in quarantine with the error.
    pub async fn load(&self, manifest: ExtensionManifest) -> Result<ExtensionHandle, LoadError> {
        let id = manifest.id().to_string();
        if self.is_active(&id).await {
            return Err(LoadError::new(&id, ExtensionError::AlreadyLoaded(id.clone())));
        }

        let loaded = match self.build(manifest.clone()).await {
            Ok(loaded) => Arc::new(loaded),
            Err(e) => {
                self.quarantine(&id, None, Some(manifest), &e).await;
                return Err(LoadError::new(id, e));
            }
        };

        let handle = loaded.handle();
        {
            let mut entries = self.entries.write().await;
            if matches!(entries.get(&id), Some(Entry::Active(_))) {
                return Err(LoadError::new(&id, ExtensionError::AlreadyLoaded(id.clone())));
            }
            entries.insert(id.clone(), Entry::Active(loaded));
        }

        tracing::info!(
            extension = %id,
            kind = %handle.kind,
            version = %handle.version,
            "extension loaded"
        );
        Ok(handle)
    }

    /// Re-read manifest and source from disk and swap in a fresh sandbox.
    ///
    /// Calls already running finish on the old sandbox. On failure the
    /// extension is quarantined. If the extension is unloaded or replaced
    /// while the new sandbox is built, the reload is abandoned with
    /// `NotAvailable`.
    pub async fn reload(&self, id: &str) -> Result<(), LoadError> {
        let not_available = || LoadError::new(id, ExtensionError::NotAvailable(id.to_string()));
        let (seen, current) = {
            let entries = self.entries.read().await;
            let Some(entry) = entries.get(id) else {
                return Err(not_available());
            };
            let manifest = match entry {
                Entry::Active(loaded) => Some(loaded.manifest.clone()),
                Entry::Quarantined { manifest, .. } => manifest.clone(),
            };
            (entry.seen(), manifest)
        };
        let Some(current) = current else {
            return Err(not_available());
        };

        let manifest = match current.manifest_path {
            Some(ref path) => match ExtensionManifest::from_file(path).await {
                Ok(manifest) => manifest,
                Err(e) => return Err(self.fail_reload(id, &seen, Some(current.clone()), e).await),
            },
            None => current.clone(),
        };

        if manifest.id() != id {
            let e = ExtensionError::InvalidManifest(format!(
                "extension id changed from '{id}' to '{}'",
                manifest.id()
            ));
            return Err(self.fail_reload(id, &seen, Some(current), e).await);
        }

        let loaded = match self.build(manifest.clone()).await {
            Ok(loaded) => Arc::new(loaded),
            Err(e) => return Err(self.fail_reload(id, &seen, Some(manifest), e).await),
        };

        {
            let mut entries = self.entries.write().await;
            if !entries.get(id).is_some_and(|entry| entry.is(&seen)) {
                drop(entries);
                loaded.retire();
                tracing::info!(extension = %id, "extension changed during reload; new sandbox dropped");
                return Err(not_available());
            }
            if let Some(Entry::Active(old)) = entries.insert(id.to_string(), Entry::Active(loaded)) {
                old.retire();
            }
        }
        tracing::info!(extension = %id, "extension reloaded");
        Ok(())
    }

    /// Quarantine after a failed reload, unless the entry changed meanwhile.
    async fn fail_reload(
        &self,
        id: &str,
        seen: &Seen,
        manifest: Option<ExtensionManifest>,
        error: ExtensionError,
    ) -> LoadError {
        if self.quarantine(id, Some(seen), manifest, &error).await {
            LoadError::new(id, error)
        } else {
            LoadError::new(id, ExtensionError::NotAvailable(id.to_string()))
        }
    }

    /// Reload every active extension whose source file changed on disk.
    ///
    /// Returns the ids that were reloaded successfully.
    pub async fn refresh(&self) -> Vec<String> {
        let active: Vec<(String, PathBuf, String)> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter_map(|entry| match entry {
                    Entry::Active(loaded) => Some((
                        loaded.id().to_string(),
                        loaded.manifest.source_path(),
                        loaded.source_hash.clone(),
                    )),
                    Entry::Quarantined { .. } => None,
                })
                .collect()
        };

        let mut reloaded = Vec::new();
        for (id, path, hash) in active {
            let current = match tokio::fs::read(&path).await {
                Ok(bytes) => sha256_hex(&bytes),
                Err(e) => {
                    tracing::warn!(extension = %id, path = %path.display(), "cannot read source: {e}");
                    continue;
                }
            };
            if current == hash {
                continue;
            }
            tracing::info!(extension = %id, "source changed, reloading");
            match self.reload(&id).await {
                Ok(()) => reloaded.push(id),
                Err(e) => tracing::error!(extension = %id, "hot reload failed: {e}"),
            }
        }
        reloaded.sort();
        reloaded
    }

    /// Remove an extension. New calls fail with `NotAvailable` at once; the
    /// sandbox is disposed after in-flight calls drain or the grace period
    /// ends, whichever comes first.
    pub async fn unload(&self, id: &str) -> Result<(), ExtensionError> {
        let removed = self
            .entries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ExtensionError::NotAvailable(id.to_string()))?;

        if let Entry::Active(loaded) = removed {
            loaded.retire();
            match tokio::time::timeout(self.config.unload_grace, loaded.sandbox.lock()).await {
                Ok(mut slot) => {
                    slot.take();
                }
                Err(_) => tracing::warn!(
                    extension = %id,
                    grace_ms = self.config.unload_grace.as_millis() as u64,
                    "in-flight call still running after grace period; sandbox is dropped when it ends"
                ),
            }
        }

        tracing::info!(extension = %id, "extension unloaded");
        Ok(())
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Call `method` on an extension and validate the settled result.
    pub async fn invoke(
        &self,
        id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, InvokeError> {
        let loaded = self
            .active(id)
            .await
            .map_err(|e| InvokeError::new(id, method, e))?;

        let value = loaded
            .call(method, args)
            .await
            .map_err(|e| InvokeError::new(id, method, e))?;

        validate_result(loaded.kind(), method, &value).map_err(|e| {
            tracing::warn!(extension = %id, method = %method, "result failed validation: {e}");
            InvokeError::new(id, method, e)
        })?;
        Ok(value)
    }

    /// Like `invoke`, then decode the result into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, InvokeError> {
        let value = self.invoke(id, method, args).await?;
        value
            .deserialize_into()
            .map_err(|e| InvokeError::new(id, method, e.into()))
    }

    /// Deliver a UI action to a plugin without waiting for its handlers.
    ///
    /// Actions for one plugin run in the order they were dispatched.
    pub async fn dispatch_ui(&self, id: &str, action: UiAction) -> Result<(), ExtensionError> {
        let loaded = self.active(id).await?;
        if loaded.kind().is_provider() {
            return Err(ExtensionError::UnsupportedKind {
                kind: loaded.kind(),
                operation: "dispatch_ui".into(),
            });
        }
        loaded.enqueue_ui(action)
    }

    // ── Preferences ──────────────────────────────────────────────────

    /// Store user preference values and reload the extension so the script
    /// sees them. Values are checked against the declared fields.
    pub async fn set_preferences(
        &self,
        id: &str,
        values: BTreeMap<String, String>,
    ) -> Result<(), LoadError> {
        let manifest = {
            let entries = self.entries.read().await;
            match entries.get(id) {
                Some(Entry::Active(loaded)) => Some(loaded.manifest.clone()),
                Some(Entry::Quarantined { manifest, .. }) => manifest.clone(),
                None => None,
            }
        };
        let Some(manifest) = manifest else {
            return Err(LoadError::new(id, ExtensionError::NotAvailable(id.to_string())));
        };

        for (key, value) in &values {
            let field = manifest
                .preferences
                .iter()
                .find(|field| &field.name == key)
                .ok_or_else(|| {
                    LoadError::new(
                        id,
                        ExtensionError::InvalidManifest(format!("unknown preference '{key}'")),
                    )
                })?;
            let valid = match field.field_type {
                PreferenceType::Text => true,
                PreferenceType::Switch => value == "true" || value == "false",
                PreferenceType::Select => field.options.contains(value),
            };
            if !valid {
                return Err(LoadError::new(
                    id,
                    ExtensionError::InvalidManifest(format!(
                        "invalid value '{value}' for preference '{key}'"
                    )),
                ));
            }
        }

        self.preferences
            .write()
            .await
            .insert(id.to_string(), values);
        self.reload(id).await
    }

    // ── Query methods ────────────────────────────────────────────────

    /// Sorted snapshot of registered extensions, optionally of one kind.
    pub async fn list(&self, kind: Option<ExtensionKind>) -> Vec<ExtensionInfo> {
        let entries = self.entries.read().await;
        let mut infos: Vec<ExtensionInfo> = entries
            .iter()
            .filter_map(|(id, entry)| {
                let info = match entry {
                    Entry::Active(loaded) => ExtensionInfo {
                        id: id.clone(),
                        name: loaded.manifest.extension.name.clone(),
                        version: loaded.manifest.extension.version.clone(),
                        kind: loaded.kind(),
                        status: ExtensionStatus::Active,
                        error: None,
                        source_hash: Some(loaded.source_hash.clone()),
                    },
                    Entry::Quarantined { manifest, error, .. } => {
                        let manifest = manifest.as_ref()?;
                        ExtensionInfo {
                            id: id.clone(),
                            name: manifest.extension.name.clone(),
                            version: manifest.extension.version.clone(),
                            kind: manifest.kind(),
                            status: ExtensionStatus::Quarantined,
                            error: Some(error.clone()),
                            source_hash: None,
                        }
                    }
                };
                kind.map_or(true, |k| k == info.kind).then_some(info)
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn is_active(&self, id: &str) -> bool {
        matches!(self.entries.read().await.get(id), Some(Entry::Active(_)))
    }

    /// The captured error of a quarantined extension.
    pub async fn quarantine_error(&self, id: &str) -> Option<String> {
        match self.entries.read().await.get(id) {
            Some(Entry::Quarantined { error, .. }) => Some(error.clone()),
            _ => None,
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn active(&self, id: &str) -> Result<Arc<LoadedExtension>, ExtensionError> {
        match self.entries.read().await.get(id) {
            Some(Entry::Active(loaded)) => Ok(loaded.clone()),
            _ => Err(ExtensionError::NotAvailable(id.to_string())),
        }
    }

    async fn build(&self, manifest: ExtensionManifest) -> Result<LoadedExtension, ExtensionError> {
        manifest.validate()?;
        manifest.check_host_version(&self.config.host_version)?;
        let source = manifest.read_source().await?;
        let source_hash = sha256_hex(source.as_bytes());

        let mut preferences = manifest.default_preferences();
        if let Some(saved) = self.preferences.read().await.get(manifest.id()) {
            preferences.extend(saved.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let spec = SandboxSpec {
            extension_id: manifest.id().to_string(),
            kind: manifest.kind(),
            source: Arc::from(source),
            allowed_hosts: manifest.permissions.allowed_hosts.clone(),
            preferences,
            ui_sink: self.ui_sink.clone(),
            config: self.config.sandbox.clone(),
        };

        let sandbox = Sandbox::spawn(spec.clone()).await?;
        validate_shape(manifest.kind(), sandbox.members())?;
        let members = sandbox.members().to_vec();

        Ok(LoadedExtension {
            manifest,
            spec,
            source_hash,
            members,
            sandbox: Arc::new(Mutex::new(Some(sandbox))),
            retired: AtomicBool::new(false),
            ui_queue: OnceLock::new(),
        })
    }

    /// Put `id` in quarantine and return whether the entry was written.
    ///
    /// With `expected` the entry must still be the one the caller saw;
    /// without it an active entry is never replaced.
    async fn quarantine(
        &self,
        id: &str,
        expected: Option<&Seen>,
        manifest: Option<ExtensionManifest>,
        error: &ExtensionError,
    ) -> bool {
        if id.is_empty() {
            return false;
        }
        let mut entries = self.entries.write().await;
        let current = entries.get(id);
        let allowed = match expected {
            Some(seen) => current.is_some_and(|entry| entry.is(seen)),
            None => !matches!(current, Some(Entry::Active(_))),
        };
        if !allowed {
            return false;
        }

        tracing::warn!(extension = %id, "extension quarantined: {error}");
        let generation = self.quarantines.fetch_add(1, Ordering::SeqCst);
        let previous = entries.insert(
            id.to_string(),
            Entry::Quarantined {
                manifest,
                error: error.to_string(),
                generation,
            },
        );
        if let Some(Entry::Active(old)) = previous {
            old.retire();
        }
        true
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_config_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.extension_dir, PathBuf::from("/data/extensions"));
        assert_eq!(config.unload_grace, Duration::from_secs(5));
        assert_eq!(config.host_version, HOST_VERSION);
        assert_eq!(config.sandbox.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_registry_config_from_env() {
        std::env::set_var("EXTENSION_DIR", "/tmp/reelbox-ext");
        std::env::set_var("EXTENSION_UNLOAD_GRACE_SECS", "2");
        std::env::set_var("EXTENSION_CALL_TIMEOUT_SECS", "7");

        let config = RegistryConfig::from_env();
        assert_eq!(config.extension_dir, PathBuf::from("/tmp/reelbox-ext"));
        assert_eq!(config.unload_grace, Duration::from_secs(2));
        assert_eq!(config.sandbox.call_timeout, Duration::from_secs(7));

        std::env::remove_var("EXTENSION_DIR");
        std::env::remove_var("EXTENSION_UNLOAD_GRACE_SECS");
        std::env::remove_var("EXTENSION_CALL_TIMEOUT_SECS");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_unknown_extension_is_not_available() {
        let registry = ExtensionRegistry::new(RegistryConfig::default());
        let err = registry.invoke("ghost", "search", vec![]).await.unwrap_err();
        assert!(err.is_not_available());
        assert!(matches!(
            registry.unload("ghost").await,
            Err(ExtensionError::NotAvailable(_))
        ));
        assert!(registry.list(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_discover_missing_directory() {
        let registry = ExtensionRegistry::new(RegistryConfig {
            extension_dir: PathBuf::from("/nonexistent/reelbox/extensions"),
            ..RegistryConfig::default()
        });
        let report = registry.discover().await;
        assert!(report.loaded.is_empty());
        assert!(report.failed.is_empty());
    }
}
