// Shared test utilities for integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use reelbox_extension::{ExtensionKind, ExtensionRegistry, RegistryConfig, SandboxConfig};

/// Write `extension.toml` and `main.js` into `<root>/<id>/` and return the
/// manifest path.
pub fn write_extension(root: &Path, id: &str, kind: ExtensionKind, source: &str) -> PathBuf {
    write_extension_with(root, id, kind, source, "")
}

/// Like `write_extension`, with extra TOML appended to the manifest.
pub fn write_extension_with(
    root: &Path,
    id: &str,
    kind: ExtensionKind,
    source: &str,
    extra_toml: &str,
) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = format!(
        r#"[extension]
id = "{id}"
name = "{id}"
version = "1.0.0"
kind = "{kind}"
language = "javascript"
source = "main.js"
manifest_version = 1
{extra_toml}
"#,
        kind = kind.as_str()
    );
    let manifest_path = dir.join("extension.toml");
    std::fs::write(&manifest_path, manifest).unwrap();
    std::fs::write(dir.join("main.js"), source).unwrap();
    manifest_path
}

/// Overwrite the script of an extension written by `write_extension`.
pub fn rewrite_source(root: &Path, id: &str, source: &str) {
    std::fs::write(root.join(id).join("main.js"), source).unwrap();
}

pub fn test_config(root: &Path) -> RegistryConfig {
    RegistryConfig {
        extension_dir: root.to_path_buf(),
        unload_grace: Duration::from_secs(2),
        sandbox: SandboxConfig {
            call_timeout: Duration::from_secs(5),
            ..SandboxConfig::default()
        },
        ..RegistryConfig::default()
    }
}

pub fn test_registry(root: &Path) -> ExtensionRegistry {
    ExtensionRegistry::new(test_config(root))
}

/// A torrent provider that satisfies its whole contract.
pub const TORRENT_PROVIDER: &str = r#"
class Provider {
    getSettings() {
        return { canSmartSearch: true, smartSearchFilters: ["batch", "query"], supportsAdult: false, type: "main" };
    }

    async search(opts) {
        return [
            { name: `${opts.query} - 01`, link: "https://tracker.example.com/1", seeders: 10, resolution: "1080p" },
            { name: `${opts.query} - 02`, link: "https://tracker.example.com/2", seeders: 4 },
        ];
    }

    async smartSearch(opts) {
        return this.search({ query: opts.query, media: opts.media });
    }

    async getTorrentInfoHash(torrent) {
        return torrent.infoHash || "";
    }

    async getTorrentMagnetLink(torrent) {
        return torrent.magnetLink || "";
    }

    async getLatest() {
        return [];
    }
}
"#;

/// A manga provider that satisfies its whole contract.
pub const MANGA_PROVIDER: &str = r#"
class Provider {
    getSettings() {
        return { supportsMultiLanguage: false, supportsMultiScanlator: false };
    }

    async search(opts) {
        return [{ id: "m-1", title: opts.query }];
    }

    async findChapters(id) {
        return [{ id: `${id}-c1`, title: "Chapter 1", chapter: "1", index: 0 }];
    }

    async findChapterPages(id) {
        return [{ url: `https://img.example.com/${id}/1.jpg`, index: 0 }];
    }
}
"#;
