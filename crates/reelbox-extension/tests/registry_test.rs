mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{
    rewrite_source, test_config, test_registry, write_extension, write_extension_with,
    MANGA_PROVIDER, TORRENT_PROVIDER,
};
use reelbox_extension::models::AnimeTorrent;
use reelbox_extension::{
    ChannelUiSink, ExtensionError, ExtensionKind, ExtensionRegistry, ExtensionStatus, Stage,
    UiAction, UiEvent, Value,
};
use serde_json::json;

fn args(value: serde_json::Value) -> Vec<Value> {
    vec![Value::from(value)]
}

/// A torrent provider with extra helper methods appended to the class body.
fn torrent_provider_with(helpers: &str) -> String {
    let end = TORRENT_PROVIDER.rfind('}').unwrap();
    format!("{}{helpers}\n}}\n", &TORRENT_PROVIDER[..end])
}

// ─── Discovery and loading ──────────────────────────────────────────────

#[tokio::test]
async fn test_discover_loads_valid_and_quarantines_broken() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, TORRENT_PROVIDER);
    write_extension(dir.path(), "mangadex", ExtensionKind::MangaProvider, MANGA_PROVIDER);
    write_extension(
        dir.path(),
        "broken",
        ExtensionKind::TorrentProvider,
        "class Provider { async search() { return []; } }",
    );

    let registry = test_registry(dir.path());
    let report = registry.discover().await;

    let mut loaded: Vec<_> = report.loaded.iter().map(|h| h.id.as_str()).collect();
    loaded.sort();
    assert_eq!(loaded, vec!["mangadex", "nyaa"]);

    assert_eq!(report.failed.len(), 1);
    let failure = &report.failed[0];
    assert_eq!(failure.extension_id, "broken");
    assert_eq!(failure.stage, Stage::Contract);
    match failure.kind() {
        ExtensionError::ContractViolation { kind, missing } => {
            assert_eq!(*kind, ExtensionKind::TorrentProvider);
            assert_eq!(
                missing,
                &vec![
                    "smartSearch".to_string(),
                    "getTorrentInfoHash".to_string(),
                    "getTorrentMagnetLink".to_string(),
                    "getLatest".to_string(),
                    "getSettings".to_string(),
                ]
            );
        }
        other => panic!("expected contract violation, got {other:?}"),
    }

    let infos = registry.list(None).await;
    let ids: Vec<_> = infos.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["broken", "mangadex", "nyaa"]);
    assert_eq!(infos[0].status, ExtensionStatus::Quarantined);
    assert!(infos[0].error.as_deref().unwrap().contains("smartSearch"));
    assert_eq!(infos[1].status, ExtensionStatus::Active);
    assert!(infos[1].source_hash.is_some());

    let torrents = registry.list(Some(ExtensionKind::TorrentProvider)).await;
    assert_eq!(torrents.len(), 2);
}

#[tokio::test]
async fn test_quarantined_and_unknown_extensions_are_not_available() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(
        dir.path(),
        "broken",
        ExtensionKind::MangaProvider,
        "class Provider { search( {",
    );
    let registry = test_registry(dir.path());

    let err = registry
        .load_from_path(dir.path().join("broken"))
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::Compile);
    assert!(registry.quarantine_error("broken").await.is_some());

    let err = registry.invoke("broken", "search", vec![]).await.unwrap_err();
    assert!(err.is_not_available());
    assert_eq!(err.stage, Stage::Dispatch);

    let err = registry.invoke("missing", "search", vec![]).await.unwrap_err();
    assert!(err.is_not_available());
}

#[tokio::test]
async fn test_load_twice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, TORRENT_PROVIDER);
    let registry = test_registry(dir.path());

    let handle = registry.load_from_path(&path).await.unwrap();
    assert_eq!(handle.id, "nyaa");
    assert_eq!(handle.version, "1.0.0");
    assert!(handle.members.contains(&"smartSearch".to_string()));

    let err = registry.load_from_path(&path).await.unwrap_err();
    assert!(matches!(err.kind(), ExtensionError::AlreadyLoaded(_)));
    assert!(registry.is_active("nyaa").await);
}

#[tokio::test]
async fn test_incompatible_host_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_extension(
        dir.path(),
        "future",
        ExtensionKind::TorrentProvider,
        TORRENT_PROVIDER,
    );
    let manifest = std::fs::read_to_string(&path).unwrap();
    std::fs::write(
        &path,
        manifest.replace("manifest_version = 1", "manifest_version = 1\nmin_host_version = \"99.0.0\""),
    )
    .unwrap();

    let registry = test_registry(dir.path());
    let err = registry.load_from_path(&path).await.unwrap_err();
    assert_eq!(err.stage, Stage::Manifest);
    assert!(matches!(err.kind(), ExtensionError::IncompatibleHost { .. }));
}

// ─── Calls ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invoke_typed_results() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, TORRENT_PROVIDER);
    let registry = test_registry(dir.path());
    registry.discover().await;

    let torrents: Vec<AnimeTorrent> = registry
        .invoke_as(
            "nyaa",
            "search",
            args(json!({ "query": "Frieren", "media": { "id": 1 } })),
        )
        .await
        .unwrap();
    assert_eq!(torrents.len(), 2);
    assert_eq!(torrents[0].name, "Frieren - 01");
    assert_eq!(torrents[0].seeders, Some(10));
    assert_eq!(torrents[0].resolution.as_deref(), Some("1080p"));
    assert_eq!(torrents[1].resolution, None);

    let settings = registry.invoke("nyaa", "getSettings", vec![]).await.unwrap();
    assert_eq!(settings.get("type").and_then(Value::as_str), Some("main"));
    assert_eq!(settings.get("canSmartSearch").and_then(Value::as_bool), Some(true));
}

#[tokio::test]
async fn test_unset_and_explicit_empty_stay_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let source = torrent_provider_with(
        r#"
    inspect(opts) {
        return {
            hasQuery: "query" in opts,
            query: opts.query,
            hasEpisode: "episodeNumber" in opts,
            resolution: opts.resolution === null ? "null" : typeof opts.resolution,
        };
    }"#,
    );
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, &source);
    let registry = test_registry(dir.path());
    registry.discover().await;

    let result = registry
        .invoke(
            "nyaa",
            "inspect",
            args(json!({ "query": "", "resolution": null })),
        )
        .await
        .unwrap();
    assert_eq!(result.get("hasQuery").and_then(Value::as_bool), Some(true));
    assert_eq!(result.get("query").and_then(Value::as_str), Some(""));
    assert_eq!(result.get("hasEpisode").and_then(Value::as_bool), Some(false));
    assert_eq!(result.get("resolution").and_then(Value::as_str), Some("null"));
}

#[tokio::test]
async fn test_bad_result_is_reported_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let source = TORRENT_PROVIDER.replace(
        "async getLatest() {\n        return [];",
        "async getLatest() {\n        return [{ name: 42 }];",
    );
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, &source);
    let registry = test_registry(dir.path());
    registry.discover().await;

    let err = registry.invoke("nyaa", "getLatest", vec![]).await.unwrap_err();
    assert_eq!(err.stage, Stage::Validate);
    match err.kind() {
        ExtensionError::BadResult { method, diff } => {
            assert_eq!(method, "getLatest");
            assert!(diff.contains("$[0].name"), "diff: {diff}");
            assert!(diff.contains("$[0].link"), "diff: {diff}");
        }
        other => panic!("expected bad result, got {other:?}"),
    }

    // A failed validation does not cost the sandbox.
    let hash = registry
        .invoke("nyaa", "getTorrentInfoHash", args(json!({ "infoHash": "abc" })))
        .await
        .unwrap();
    assert_eq!(hash.as_str(), Some("abc"));
}

#[tokio::test]
async fn test_script_rejection_keeps_message() {
    let dir = tempfile::tempdir().unwrap();
    let source = torrent_provider_with(
        r#"
    async explode() {
        throw new Error("tracker unreachable");
    }"#,
    );
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, &source);
    let registry = test_registry(dir.path());
    registry.discover().await;

    let err = registry.invoke("nyaa", "explode", vec![]).await.unwrap_err();
    assert_eq!(err.stage, Stage::Call);
    match err.kind() {
        ExtensionError::Script { message, .. } => {
            assert_eq!(message, "Error: tracker unreachable");
        }
        other => panic!("expected script error, got {other:?}"),
    }

    // The sandbox is rebuilt transparently on the next call.
    let value = registry.invoke("nyaa", "getLatest", vec![]).await.unwrap();
    assert_eq!(value.as_array().map(<[Value]>::len), Some(0));
}

#[tokio::test]
async fn test_unknown_method() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, TORRENT_PROVIDER);
    let registry = test_registry(dir.path());
    registry.discover().await;

    let err = registry.invoke("nyaa", "doesNotExist", vec![]).await.unwrap_err();
    assert!(matches!(err.kind(), ExtensionError::MethodNotFound(_)));
}

#[tokio::test]
async fn test_calls_to_one_extension_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let source = format!(
        "let active = 0;\nlet maxActive = 0;\n{}",
        torrent_provider_with(
            r#"
    async slow(n) {
        active += 1;
        maxActive = Math.max(maxActive, active);
        await new Promise((resolve) => setTimeout(resolve, 30));
        active -= 1;
        return n;
    }

    peak() {
        return maxActive;
    }"#,
        )
    );
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, &source);
    let registry = test_registry(dir.path());
    registry.discover().await;

    let one = vec![Value::from(1.0)];
    let two = vec![Value::from(2.0)];
    let three = vec![Value::from(3.0)];
    let (a, b, c) = tokio::join!(
        registry.invoke("nyaa", "slow", one),
        registry.invoke("nyaa", "slow", two),
        registry.invoke("nyaa", "slow", three),
    );
    let mut results: Vec<f64> = [a, b, c]
        .into_iter()
        .map(|r| r.unwrap().as_f64().unwrap())
        .collect();
    results.sort_by(|x, y| x.partial_cmp(y).unwrap());
    assert_eq!(results, vec![1.0, 2.0, 3.0]);

    let peak = registry.invoke("nyaa", "peak", vec![]).await.unwrap();
    assert_eq!(peak.as_f64(), Some(1.0));
}

#[tokio::test]
async fn test_timeout_then_next_call_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let source = torrent_provider_with(
        r#"
    spin() {
        while (true) {}
    }

    ping() {
        return "pong";
    }"#,
    );
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, &source);

    let mut config = test_config(dir.path());
    config.sandbox.call_timeout = Duration::from_millis(300);
    let registry = ExtensionRegistry::new(config);
    registry.discover().await;

    let err = registry.invoke("nyaa", "spin", vec![]).await.unwrap_err();
    assert!(err.is_timeout(), "got {err}");
    assert_eq!(err.stage, Stage::Call);

    let value = registry.invoke("nyaa", "ping", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("pong"));
}

#[tokio::test]
async fn test_unsettled_promise_waits_for_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let source = torrent_provider_with(
        r#"
    hang() {
        return new Promise(() => {});
    }

    ping() {
        return "pong";
    }"#,
    );
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, &source);

    let mut config = test_config(dir.path());
    config.sandbox.call_timeout = Duration::from_millis(400);
    let registry = ExtensionRegistry::new(config);
    registry.discover().await;

    let started = std::time::Instant::now();
    let err = registry.invoke("nyaa", "hang", vec![]).await.unwrap_err();
    assert!(err.is_timeout(), "got {err}");
    assert!(started.elapsed() >= Duration::from_millis(400));

    let value = registry.invoke("nyaa", "ping", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("pong"));
}

// ─── Lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reload_swaps_source() {
    let dir = tempfile::tempdir().unwrap();
    let v1 = torrent_provider_with("\n    version() { return \"v1\"; }");
    let v2 = torrent_provider_with("\n    version() { return \"v2\"; }");
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, &v1);
    let registry = test_registry(dir.path());
    registry.discover().await;

    let value = registry.invoke("nyaa", "version", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("v1"));

    rewrite_source(dir.path(), "nyaa", &v2);
    registry.reload("nyaa").await.unwrap();
    let value = registry.invoke("nyaa", "version", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("v2"));

    // A broken source quarantines the extension.
    rewrite_source(dir.path(), "nyaa", "class Provider {");
    let err = registry.reload("nyaa").await.unwrap_err();
    assert_eq!(err.stage, Stage::Compile);
    let err = registry.invoke("nyaa", "version", vec![]).await.unwrap_err();
    assert!(err.is_not_available());

    // Fixing the source brings it back.
    rewrite_source(dir.path(), "nyaa", &v1);
    registry.reload("nyaa").await.unwrap();
    let value = registry.invoke("nyaa", "version", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("v1"));
}

#[tokio::test]
async fn test_reload_lets_in_flight_call_finish_on_old_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let version = |tag: &str| {
        torrent_provider_with(&format!(
            r#"
    async slowVersion() {{
        await new Promise((resolve) => setTimeout(resolve, 200));
        return "{tag}";
    }}"#
        ))
    };
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, &version("v1"));
    let registry = test_registry(dir.path());
    registry.discover().await;

    let (in_flight, reloaded) = tokio::join!(
        registry.invoke("nyaa", "slowVersion", vec![]),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            rewrite_source(dir.path(), "nyaa", &version("v2"));
            registry.reload("nyaa").await
        },
    );
    assert_eq!(in_flight.unwrap().as_str(), Some("v1"));
    reloaded.unwrap();

    let value = registry.invoke("nyaa", "slowVersion", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("v2"));
}

#[tokio::test]
async fn test_refresh_reloads_only_changed_sources() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, TORRENT_PROVIDER);
    write_extension(dir.path(), "mangadex", ExtensionKind::MangaProvider, MANGA_PROVIDER);
    let registry = test_registry(dir.path());
    registry.discover().await;

    assert!(registry.refresh().await.is_empty());

    rewrite_source(
        dir.path(),
        "mangadex",
        &MANGA_PROVIDER.replace("title: opts.query", "title: opts.query.toUpperCase()"),
    );
    assert_eq!(registry.refresh().await, vec!["mangadex".to_string()]);

    let results = registry
        .invoke("mangadex", "search", args(json!({ "query": "berserk" })))
        .await
        .unwrap();
    let first = &results.as_array().unwrap()[0];
    assert_eq!(first.get("title").and_then(Value::as_str), Some("BERSERK"));
}

#[tokio::test]
async fn test_unload() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, TORRENT_PROVIDER);
    let registry = test_registry(dir.path());
    registry.discover().await;

    registry.unload("nyaa").await.unwrap();
    assert!(!registry.is_active("nyaa").await);
    assert!(registry.list(None).await.is_empty());

    let err = registry.invoke("nyaa", "getLatest", vec![]).await.unwrap_err();
    assert!(err.is_not_available());
    assert!(matches!(
        registry.unload("nyaa").await,
        Err(ExtensionError::NotAvailable(_))
    ));

    // The id is free again.
    registry.load_from_path(dir.path().join("nyaa")).await.unwrap();
}

#[tokio::test]
async fn test_unload_during_reload_keeps_extension_removed() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, TORRENT_PROVIDER);
    let registry = test_registry(dir.path());
    registry.discover().await;

    // The new source takes a while to evaluate, so the unload lands while
    // the replacement sandbox is being built.
    let slow = format!(
        "const started = Date.now();\nwhile (Date.now() - started < 500) {{}}\n{TORRENT_PROVIDER}"
    );
    rewrite_source(dir.path(), "nyaa", &slow);

    let (reloaded, unloaded) = tokio::join!(registry.reload("nyaa"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.unload("nyaa").await
    });
    unloaded.unwrap();
    let err = reloaded.unwrap_err();
    assert!(matches!(err.source, ExtensionError::NotAvailable(_)), "got {err}");

    assert!(!registry.is_active("nyaa").await);
    assert!(registry.list(None).await.is_empty());
    let err = registry.invoke("nyaa", "getLatest", vec![]).await.unwrap_err();
    assert!(err.is_not_available());
}

// ─── Preferences ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_set_preferences() {
    let dir = tempfile::tempdir().unwrap();
    let source = torrent_provider_with(
        "\n    quality() { return $getUserPreference(\"quality\") ?? \"none\"; }",
    );
    write_extension_with(
        dir.path(),
        "nyaa",
        ExtensionKind::TorrentProvider,
        &source,
        r#"
[[preferences]]
name = "quality"
type = "select"
options = ["720p", "1080p"]
default = "720p"
"#,
    );
    let registry = test_registry(dir.path());
    registry.discover().await;

    let value = registry.invoke("nyaa", "quality", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("720p"));

    let values = BTreeMap::from([("quality".to_string(), "1080p".to_string())]);
    registry.set_preferences("nyaa", values).await.unwrap();
    let value = registry.invoke("nyaa", "quality", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("1080p"));

    let invalid = BTreeMap::from([("quality".to_string(), "4k".to_string())]);
    assert!(registry.set_preferences("nyaa", invalid).await.is_err());
    let unknown = BTreeMap::from([("proxy".to_string(), "x".to_string())]);
    assert!(registry.set_preferences("nyaa", unknown).await.is_err());

    // Rejected updates leave the stored values alone.
    let value = registry.invoke("nyaa", "quality", vec![]).await.unwrap();
    assert_eq!(value.as_str(), Some("1080p"));
}

// ─── Plugins ────────────────────────────────────────────────────────────

const TRAY_PLUGIN: &str = r#"
function init() {
    $ui.register((ctx) => {
        const tray = ctx.newTray({ iconUrl: "https://example.com/icon.png", withContent: false });
        let clicks = 0;
        tray.onClick(() => {
            clicks += 1;
            tray.updateBadge({ number: clicks, intent: "info" });
        });
    });
}
"#;

#[tokio::test]
async fn test_plugin_ui_actions_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "tray-counter", ExtensionKind::Plugin, TRAY_PLUGIN);
    let (sink, mut events) = ChannelUiSink::channel();
    let registry = test_registry(dir.path()).with_ui_sink(Arc::new(sink));

    let handle = registry
        .load_from_path(dir.path().join("tray-counter"))
        .await
        .unwrap();
    assert_eq!(handle.members, vec!["$ui.register".to_string()]);

    let (id, event) = events.recv().await.unwrap();
    assert_eq!(id, "tray-counter");
    assert!(matches!(event, UiEvent::TrayRegistered { ref tray_id, .. } if tray_id == "tray-1"));

    for _ in 0..3 {
        registry
            .dispatch_ui(
                "tray-counter",
                UiAction::TrayClick {
                    tray_id: "tray-1".into(),
                },
            )
            .await
            .unwrap();
    }

    for expected in 1..=3 {
        let (_, event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(event, UiEvent::TrayBadge { number, .. } if number == expected),
            "got {event:?}"
        );
    }
}

#[tokio::test]
async fn test_dispatch_ui_does_not_wait_for_running_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let slow = TRAY_PLUGIN.replace(
        "clicks += 1;",
        "const started = Date.now();\n            while (Date.now() - started < 400) {}\n            clicks += 1;",
    );
    write_extension(dir.path(), "tray-counter", ExtensionKind::Plugin, &slow);
    let (sink, mut events) = ChannelUiSink::channel();
    let registry = test_registry(dir.path()).with_ui_sink(Arc::new(sink));
    registry
        .load_from_path(dir.path().join("tray-counter"))
        .await
        .unwrap();
    events.recv().await.unwrap();

    let started = std::time::Instant::now();
    for _ in 0..3 {
        registry
            .dispatch_ui(
                "tray-counter",
                UiAction::TrayClick {
                    tray_id: "tray-1".into(),
                },
            )
            .await
            .unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(300));

    for expected in 1..=3 {
        let (_, event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(event, UiEvent::TrayBadge { number, .. } if number == expected),
            "got {event:?}"
        );
    }
}

#[tokio::test]
async fn test_plugin_without_registration_violates_contract() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "silent", ExtensionKind::Plugin, "function init() {}");
    let registry = test_registry(dir.path());

    let err = registry
        .load_from_path(dir.path().join("silent"))
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::Contract);
}

#[tokio::test]
async fn test_dispatch_ui_rejected_for_providers() {
    let dir = tempfile::tempdir().unwrap();
    write_extension(dir.path(), "nyaa", ExtensionKind::TorrentProvider, TORRENT_PROVIDER);
    let registry = test_registry(dir.path());
    registry.discover().await;

    let err = registry
        .dispatch_ui(
            "nyaa",
            UiAction::TrayClick {
                tray_id: "tray-1".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::UnsupportedKind { .. }));
}
