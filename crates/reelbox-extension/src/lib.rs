//! Reelbox Extension Runtime
//!
//! Runs user-supplied JavaScript extensions (torrent, manga, online-stream
//! and custom-source providers, plus UI plugins) inside isolated QuickJS
//! sandboxes. Each extension gets its own runtime with memory, stack and
//! time limits, and reaches the outside world only through the capability
//! bindings the host installs: an allow-listed `fetch`, CryptoJS, Buffer,
//! HTML documents, torrent helpers, fuzzy matching and the plugin UI.

pub mod bindings;
pub mod contract;
pub mod error;
pub mod manifest;
pub mod marshal;
pub mod models;
pub mod registry;
pub mod sandbox;

pub use bindings::ui::{ChannelUiSink, LogUiSink, UiAction, UiEvent, UiSink};
pub use contract::{contract_for, validate_result, validate_shape};
pub use error::{ExtensionError, InvokeError, LoadError, Stage};
pub use manifest::{ExtensionKind, ExtensionManifest, MANIFEST_FILE_NAME};
pub use marshal::{MarshalError, Value};
pub use registry::{
    DiscoveryReport, ExtensionHandle, ExtensionInfo, ExtensionRegistry, ExtensionStatus,
    RegistryConfig, HOST_VERSION,
};
pub use sandbox::{CallRecord, CallState, Sandbox, SandboxConfig, SandboxSpec};
