//! Extension manifest parsing and validation.
//!
//! Parses `extension.toml` files that declare extension identity, the
//! interface contract the script implements, fetch permissions and the
//! user preference fields the script can read back.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ExtensionError;

/// File name looked up inside each extension directory during discovery.
pub const MANIFEST_FILE_NAME: &str = "extension.toml";

/// Highest manifest format version this host understands.
pub const CURRENT_MANIFEST_VERSION: u32 = 1;

/// The interface contract an extension implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionKind {
    MangaProvider,
    TorrentProvider,
    OnlineStreamProvider,
    CustomSource,
    Plugin,
}

impl ExtensionKind {
    pub const ALL: [ExtensionKind; 5] = [
        ExtensionKind::MangaProvider,
        ExtensionKind::TorrentProvider,
        ExtensionKind::OnlineStreamProvider,
        ExtensionKind::CustomSource,
        ExtensionKind::Plugin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionKind::MangaProvider => "manga-provider",
            ExtensionKind::TorrentProvider => "torrent-provider",
            ExtensionKind::OnlineStreamProvider => "online-stream-provider",
            ExtensionKind::CustomSource => "custom-source",
            ExtensionKind::Plugin => "plugin",
        }
    }

    /// Provider kinds expose a `Provider` class; plugins register UI instead.
    pub fn is_provider(&self) -> bool {
        !matches!(self, ExtensionKind::Plugin)
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Script dialect of the extension source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    #[default]
    Javascript,
}

/// Extension manifest parsed from `extension.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub extension: ExtensionMeta,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub preferences: Vec<PreferenceField>,
    /// Directory the `source` path is resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Where the manifest was read from, when it came from disk.
    #[serde(skip)]
    pub manifest_path: Option<PathBuf>,
}

/// Extension metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionMeta {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: ExtensionKind,
    #[serde(default)]
    pub language: ScriptLanguage,
    pub source: String,
    #[serde(default = "default_manifest_version")]
    pub manifest_version: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub min_host_version: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
}

fn default_manifest_version() -> u32 {
    CURRENT_MANIFEST_VERSION
}

/// Capability permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    /// Hosts `fetch` may reach. Empty means any public host.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

/// A user-configurable value exposed to the script via `$getUserPreference`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceField {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub field_type: PreferenceType,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceType {
    Text,
    Switch,
    Select,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate an extension id against `^[a-z][a-z0-9-]{1,63}$`.
fn validate_extension_id(id: &str) -> Result<(), ExtensionError> {
    let len = id.len();
    if !(2..=64).contains(&len) {
        return Err(ExtensionError::InvalidManifest(format!(
            "extension id must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = id.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension id must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension id contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<(), ExtensionError> {
    semver::Version::parse(value).map_err(|_| {
        ExtensionError::InvalidManifest(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), ExtensionError> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(ExtensionError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    for component in p.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(ExtensionError::InvalidManifest(format!(
                "{field_name} must not contain '..': '{path}'"
            )));
        }
    }
    Ok(())
}

/// Must be non-empty, without spaces, and `"*"`, `"localhost"` or dotted.
fn validate_allowed_host(host: &str) -> Result<(), ExtensionError> {
    if host.is_empty() {
        return Err(ExtensionError::InvalidManifest(
            "allowed_hosts entry must not be empty".into(),
        ));
    }
    if host.contains(' ') {
        return Err(ExtensionError::InvalidManifest(format!(
            "allowed_hosts entry must not contain spaces: '{host}'"
        )));
    }
    if host != "*" && host != "localhost" && !host.contains('.') {
        return Err(ExtensionError::InvalidManifest(format!(
            "allowed_hosts entry is not a valid domain: '{host}'"
        )));
    }
    Ok(())
}

fn validate_preferences(fields: &[PreferenceField]) -> Result<(), ExtensionError> {
    let mut seen = HashSet::new();
    for field in fields {
        if field.name.is_empty() {
            return Err(ExtensionError::InvalidManifest(
                "preference name must not be empty".into(),
            ));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(ExtensionError::InvalidManifest(format!(
                "duplicate preference '{}'",
                field.name
            )));
        }
        match field.field_type {
            PreferenceType::Text => {}
            PreferenceType::Switch => {
                if let Some(ref default) = field.default {
                    if default != "true" && default != "false" {
                        return Err(ExtensionError::InvalidManifest(format!(
                            "switch preference '{}' default must be \"true\" or \"false\", got '{default}'",
                            field.name
                        )));
                    }
                }
            }
            PreferenceType::Select => {
                if field.options.is_empty() {
                    return Err(ExtensionError::InvalidManifest(format!(
                        "select preference '{}' needs at least one option",
                        field.name
                    )));
                }
                if let Some(ref default) = field.default {
                    if !field.options.contains(default) {
                        return Err(ExtensionError::InvalidManifest(format!(
                            "select preference '{}' default '{default}' is not one of its options",
                            field.name
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

impl ExtensionManifest {
    /// Build a manifest in code for a script on disk.
    ///
    /// The script's parent directory becomes the base directory and the
    /// name and version default to the id and `0.0.0`.
    pub fn new(id: &str, kind: ExtensionKind, source_path: impl AsRef<Path>) -> Self {
        let source_path = source_path.as_ref();
        let base_dir = source_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let source = source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            extension: ExtensionMeta {
                id: id.to_string(),
                name: id.to_string(),
                version: "0.0.0".to_string(),
                kind,
                language: ScriptLanguage::Javascript,
                source,
                manifest_version: CURRENT_MANIFEST_VERSION,
                description: None,
                author: None,
                min_host_version: None,
                homepage: None,
            },
            permissions: Permissions::default(),
            preferences: Vec::new(),
            base_dir,
            manifest_path: None,
        }
    }

    /// Parse an extension manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, ExtensionError> {
        let manifest: ExtensionManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    /// Validate all fields of a parsed manifest.
    pub fn validate(&self) -> Result<(), ExtensionError> {
        // ── Identity ────────────────────────────────────────────────
        validate_extension_id(&self.extension.id)?;

        let name_len = self.extension.name.len();
        if name_len == 0 || name_len > 100 {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension.name must be 1-100 characters, got {name_len}"
            )));
        }

        validate_semver(&self.extension.version, "extension.version")?;

        let manifest_version = self.extension.manifest_version;
        if manifest_version == 0 || manifest_version > CURRENT_MANIFEST_VERSION {
            return Err(ExtensionError::InvalidManifest(format!(
                "unsupported manifest_version {manifest_version}; this host understands up to {CURRENT_MANIFEST_VERSION}"
            )));
        }

        if let Some(ref description) = self.extension.description {
            if description.len() > 500 {
                return Err(ExtensionError::InvalidManifest(format!(
                    "extension.description must be at most 500 characters, got {}",
                    description.len()
                )));
            }
        }

        if let Some(ref author) = self.extension.author {
            let len = author.len();
            if len == 0 || len > 255 {
                return Err(ExtensionError::InvalidManifest(format!(
                    "extension.author must be 1-255 characters, got {len}"
                )));
            }
        }

        if let Some(ref min_ver) = self.extension.min_host_version {
            validate_semver(min_ver, "extension.min_host_version")?;
        }

        // ── Source ──────────────────────────────────────────────────
        validate_path_safety(&self.extension.source, "extension.source")?;

        if !self.extension.source.ends_with(".js") {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension.source must end with '.js', got '{}'",
                self.extension.source
            )));
        }

        // ── Permissions and preferences ─────────────────────────────
        for host in &self.permissions.allowed_hosts {
            validate_allowed_host(host)?;
        }

        validate_preferences(&self.preferences)?;

        Ok(())
    }

    /// Parse and validate an extension manifest from a TOML string.
    pub fn parse_and_validate(toml_str: &str) -> Result<Self, ExtensionError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read, parse and validate a manifest file.
    ///
    /// The manifest's directory becomes the base for the source path.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ExtensionError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ExtensionError::Manifest(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut manifest = Self::parse_and_validate(&content)?;
        manifest.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        manifest.manifest_path = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// Reject manifests that need a newer host than `host_version`.
    pub fn check_host_version(&self, host_version: &str) -> Result<(), ExtensionError> {
        let Some(ref required) = self.extension.min_host_version else {
            return Ok(());
        };
        let required_version = semver::Version::parse(required)?;
        let host = semver::Version::parse(host_version)?;
        if host < required_version {
            return Err(ExtensionError::IncompatibleHost {
                required: required.clone(),
                host: host_version.to_string(),
            });
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.extension.id
    }

    pub fn kind(&self) -> ExtensionKind {
        self.extension.kind
    }

    /// Absolute (or base-relative) location of the script.
    pub fn source_path(&self) -> PathBuf {
        self.base_dir.join(&self.extension.source)
    }

    /// Read the script text from disk.
    pub async fn read_source(&self) -> Result<String, ExtensionError> {
        let path = self.source_path();
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            ExtensionError::Manifest(format!("cannot read source {}: {e}", path.display()))
        })
    }

    /// Preference values from the declared defaults.
    pub fn default_preferences(&self) -> BTreeMap<String, String> {
        self.preferences
            .iter()
            .filter_map(|field| {
                field
                    .default
                    .as_ref()
                    .map(|default| (field.name.clone(), default.clone()))
            })
            .collect()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
