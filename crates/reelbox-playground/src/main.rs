//! Developer playground: load one extension and run one method.
//!
//! ```text
//! reelbox-playground <extension.toml> <method> [json-args]
//! ```
//!
//! `json-args` is a JSON array of call arguments; any other JSON value is
//! passed as the single argument. For plugins the method `dispatch` sends
//! `json-args` as a UI action and prints the UI events it produces.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use reelbox_extension::{
    ChannelUiSink, ExtensionKind, ExtensionRegistry, RegistryConfig, UiAction, UiEvent, Value,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How long to collect UI events after loading or dispatching.
const UI_SETTLE: Duration = Duration::from_millis(500);

const USAGE: &str = "usage: reelbox-playground <extension.toml> <method> [json-args]";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (manifest, method, raw_args) = match args.as_slice() {
        [manifest, method] => (manifest, method, None),
        [manifest, method, json] => (manifest, method, Some(json.as_str())),
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    let call_args = match raw_args.map(serde_json::from_str::<serde_json::Value>) {
        None => Vec::new(),
        Some(Ok(serde_json::Value::Array(items))) => items.into_iter().map(Value::from).collect(),
        Some(Ok(single)) => vec![Value::from(single)],
        Some(Err(e)) => {
            eprintln!("invalid json-args: {e}");
            return ExitCode::from(2);
        }
    };

    let (sink, mut ui_events) = ChannelUiSink::channel();
    let registry = ExtensionRegistry::new(RegistryConfig::from_env()).with_ui_sink(Arc::new(sink));

    let handle = match registry.load_from_path(manifest).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("load failed ({}): {e}", e.stage);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        extension = %handle.id,
        kind = %handle.kind,
        members = ?handle.members,
        "extension ready"
    );

    if handle.kind == ExtensionKind::Plugin {
        print_ui_events(&mut ui_events).await;
        if method != "dispatch" {
            eprintln!("plugins only support the 'dispatch' method");
            return ExitCode::from(2);
        }
        let action = match raw_args.map(serde_json::from_str::<UiAction>) {
            Some(Ok(action)) => action,
            Some(Err(e)) => {
                eprintln!("invalid ui action: {e}");
                return ExitCode::from(2);
            }
            None => {
                eprintln!("dispatch needs a ui action, e.g. '{{\"type\":\"trayClick\",\"trayId\":\"tray-1\"}}'");
                return ExitCode::from(2);
            }
        };
        if let Err(e) = registry.dispatch_ui(&handle.id, action).await {
            eprintln!("dispatch failed: {e}");
            return ExitCode::FAILURE;
        }
        print_ui_events(&mut ui_events).await;
        return ExitCode::SUCCESS;
    }

    match registry.invoke(&handle.id, method, call_args).await {
        Ok(value) => {
            match serde_json::to_string_pretty(&value.to_json()) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    eprintln!("cannot print result: {e}");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{method}() failed ({}): {}", e.stage, e.source);
            if let reelbox_extension::ExtensionError::Script {
                stack: Some(ref stack),
                ..
            } = e.source
            {
                eprintln!("{stack}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Print UI events as JSON lines until none arrive for `UI_SETTLE`.
async fn print_ui_events(events: &mut UnboundedReceiver<(String, UiEvent)>) {
    while let Ok(Some((_, event))) = tokio::time::timeout(UI_SETTLE, events.recv()).await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("cannot print ui event: {e}"),
        }
    }
}
