//! UI bridge for plugin extensions: tray icons, command palettes and toasts.
//!
//! Scripts emit [`UiEvent`]s that the host receives through its [`UiSink`].
//! User interaction comes back as [`UiAction`]s, delivered with
//! `ExtensionRegistry::dispatch_ui`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Success,
    Error,
    #[default]
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaletteItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
}

/// Script → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UiEvent {
    TrayRegistered {
        tray_id: String,
        icon_url: String,
        #[serde(default)]
        with_content: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_height: Option<String>,
    },
    TrayBadge {
        tray_id: String,
        number: u32,
        #[serde(default)]
        intent: Intent,
    },
    TrayOpen {
        tray_id: String,
    },
    TrayClose {
        tray_id: String,
    },
    PaletteRegistered {
        palette_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keyboard_shortcut: Option<String>,
    },
    PaletteItems {
        palette_id: String,
        items: Vec<PaletteItem>,
    },
    PalettePlaceholder {
        palette_id: String,
        placeholder: String,
    },
    PaletteOpen {
        palette_id: String,
    },
    PaletteClose {
        palette_id: String,
    },
    Toast {
        intent: Intent,
        message: String,
    },
}

/// Host → script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UiAction {
    TrayClick { tray_id: String },
    TrayOpen { tray_id: String },
    TrayClose { tray_id: String },
    PaletteOpen { palette_id: String },
    PaletteClose { palette_id: String },
    PaletteInput { palette_id: String, input: String },
    PaletteSelect { palette_id: String, value: String },
}

/// Receives UI events from plugin sandboxes. Called on the sandbox thread.
pub trait UiSink: Send + Sync {
    fn emit(&self, extension_id: &str, event: UiEvent);
}

/// Default sink: events are only logged.
#[derive(Debug, Default)]
pub struct LogUiSink;

impl UiSink for LogUiSink {
    fn emit(&self, extension_id: &str, event: UiEvent) {
        tracing::debug!(extension = %extension_id, ?event, "ui event (no sink attached)");
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelUiSink {
    tx: mpsc::UnboundedSender<(String, UiEvent)>,
}

impl ChannelUiSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(String, UiEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UiSink for ChannelUiSink {
    fn emit(&self, extension_id: &str, event: UiEvent) {
        if self.tx.send((extension_id.to_string(), event)).is_err() {
            tracing::warn!(extension = %extension_id, "ui event receiver dropped");
        }
    }
}

/// Per-sandbox UI state.
pub struct UiBridge {
    extension_id: String,
    sink: Arc<dyn UiSink>,
    events_emitted: u64,
}

impl std::fmt::Debug for UiBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiBridge")
            .field("extension_id", &self.extension_id)
            .field("events_emitted", &self.events_emitted)
            .finish_non_exhaustive()
    }
}

impl UiBridge {
    pub fn new(extension_id: impl Into<String>, sink: Arc<dyn UiSink>) -> Self {
        Self {
            extension_id: extension_id.into(),
            sink,
            events_emitted: 0,
        }
    }

    /// Validates a script-built event and hands it to the sink.
    pub fn emit_json(&mut self, event: serde_json::Value) -> Result<(), serde_json::Error> {
        let event: UiEvent = serde_json::from_value(event)?;
        self.emit(event);
        Ok(())
    }

    pub fn emit(&mut self, event: UiEvent) {
        self.events_emitted += 1;
        self.sink.emit(&self.extension_id, event);
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted
    }
}
