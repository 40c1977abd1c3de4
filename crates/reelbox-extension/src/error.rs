//! Extension runtime error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::manifest::ExtensionKind;
use crate::marshal::MarshalError;

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("incompatible host: extension requires {required}, host is {host}")]
    IncompatibleHost { required: String, host: String },

    #[error("compile error: {0}")]
    Compile(String),

    #[error("contract violation: {kind} extension is missing {}", .missing.join(", "))]
    ContractViolation {
        kind: ExtensionKind,
        missing: Vec<String>,
    },

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("script error: {message}")]
    Script {
        message: String,
        stack: Option<String>,
    },

    #[error("bad result from {method}:\n{diff}")]
    BadResult { method: String, diff: String },

    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),

    #[error("call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("extension not available: {0}")]
    NotAvailable(String),

    #[error("extension already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("operation not supported for {kind} extensions: {operation}")]
    UnsupportedKind {
        kind: ExtensionKind,
        operation: String,
    },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("binding error: {0}")]
    Binding(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl ExtensionError {
    /// Whether the sandbox that produced this error must be thrown away.
    pub fn discards_sandbox(&self) -> bool {
        matches!(
            self,
            ExtensionError::Timeout(_) | ExtensionError::Script { .. } | ExtensionError::Sandbox(_)
        )
    }
}

// ─── Stage-tagged wrappers ──────────────────────────────────────────────

/// Where in the load or call pipeline an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Manifest,
    Compile,
    Contract,
    Call,
    Validate,
    Marshal,
    Dispatch,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Manifest => "manifest",
            Stage::Compile => "compile",
            Stage::Contract => "contract",
            Stage::Call => "call",
            Stage::Validate => "validate",
            Stage::Marshal => "marshal",
            Stage::Dispatch => "dispatch",
        }
    }

    /// The natural stage for a bare error raised while loading.
    fn for_load(err: &ExtensionError) -> Self {
        match err {
            ExtensionError::Compile(_) | ExtensionError::Script { .. } => Stage::Compile,
            ExtensionError::ContractViolation { .. } => Stage::Contract,
            ExtensionError::Timeout(_) | ExtensionError::Sandbox(_) => Stage::Compile,
            _ => Stage::Manifest,
        }
    }

    /// The natural stage for a bare error raised while invoking.
    fn for_invoke(err: &ExtensionError) -> Self {
        match err {
            ExtensionError::NotAvailable(_) | ExtensionError::UnsupportedKind { .. } => {
                Stage::Dispatch
            }
            ExtensionError::BadResult { .. } => Stage::Validate,
            ExtensionError::Marshal(_) => Stage::Marshal,
            _ => Stage::Call,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to load or reload an extension.
#[derive(Error, Debug)]
#[error("extension '{extension_id}' failed at {stage}: {source}")]
pub struct LoadError {
    pub extension_id: String,
    pub stage: Stage,
    #[source]
    pub source: ExtensionError,
}

impl LoadError {
    pub fn new(extension_id: impl Into<String>, source: ExtensionError) -> Self {
        Self {
            extension_id: extension_id.into(),
            stage: Stage::for_load(&source),
            source,
        }
    }

    pub fn kind(&self) -> &ExtensionError {
        &self.source
    }
}

/// Failure of a single `invoke` call.
#[derive(Error, Debug)]
#[error("extension '{extension_id}' {method}() failed at {stage}: {source}")]
pub struct InvokeError {
    pub extension_id: String,
    pub method: String,
    pub stage: Stage,
    #[source]
    pub source: ExtensionError,
}

impl InvokeError {
    pub fn new(
        extension_id: impl Into<String>,
        method: impl Into<String>,
        source: ExtensionError,
    ) -> Self {
        Self {
            extension_id: extension_id.into(),
            method: method.into(),
            stage: Stage::for_invoke(&source),
            source,
        }
    }

    pub fn kind(&self) -> &ExtensionError {
        &self.source
    }

    pub fn is_not_available(&self) -> bool {
        matches!(self.source, ExtensionError::NotAvailable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.source, ExtensionError::Timeout(_))
    }
}
