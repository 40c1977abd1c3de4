//! Interface contracts per extension kind.
//!
//! A contract names the members a script must expose for its declared kind
//! and, for each method, the structural shape of the value it resolves to.
//! The tables are static host data and are never mutated.
//!
//! Result checking is deliberately shallow: required fields must be present
//! and non-null with the declared type, and enumerations are checked wherever
//! a value is present. Optional fields are otherwise trusted, since providers
//! routinely omit data they cannot scrape.

use std::fmt::Write as _;

use crate::error::ExtensionError;
use crate::manifest::ExtensionKind;
use crate::marshal::Value;

/// Version of the contract table. Bumped when a required member is added.
pub const CONTRACT_VERSION: u32 = 1;

/// Member a plugin exposes by calling `$ui.register` during initialisation.
pub const UI_REGISTER_MEMBER: &str = "$ui.register";

/// Structural expectation for a result value.
#[derive(Debug)]
pub enum Shape {
    Any,
    String,
    Number,
    Bool,
    /// A string or a number (chapter numbers, identifiers).
    Scalar,
    Enum(&'static [&'static str]),
    Array(&'static Shape),
    Object(&'static [Field]),
    /// `null`/`undefined` allowed, otherwise the inner shape.
    Nullable(&'static Shape),
}

#[derive(Debug)]
pub struct Field {
    pub name: &'static str,
    pub shape: Shape,
    pub required: bool,
}

macro_rules! req {
    ($name:literal, $shape:expr $(,)?) => {
        Field {
            name: $name,
            shape: $shape,
            required: true,
        }
    };
}

macro_rules! opt {
    ($name:literal, $shape:expr $(,)?) => {
        Field {
            name: $name,
            shape: $shape,
            required: false,
        }
    };
}

#[derive(Debug)]
pub struct MethodContract {
    pub name: &'static str,
    pub result: Shape,
}

#[derive(Debug)]
pub struct InterfaceContract {
    pub kind: ExtensionKind,
    pub version: u32,
    pub methods: &'static [MethodContract],
    /// Members that are not host-callable methods.
    pub members: &'static [&'static str],
}

impl InterfaceContract {
    /// Every member the script must expose, in declaration order.
    pub fn required_members(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods
            .iter()
            .map(|m| m.name)
            .chain(self.members.iter().copied())
    }

    pub fn method(&self, name: &str) -> Option<&MethodContract> {
        self.methods.iter().find(|m| m.name == name)
    }
}

// ─── Shared result shapes ───────────────────────────────────────────────

const VIDEO_SOURCE_TYPES: &[&str] = &["mp4", "m3u8", "unknown"];
const SUB_OR_DUB: &[&str] = &["sub", "dub", "both"];
const SMART_SEARCH_FILTERS: &[&str] = &[
    "batch",
    "episodeNumber",
    "resolution",
    "query",
    "bestReleases",
];
const TORRENT_PROVIDER_TYPES: &[&str] = &["main", "special"];

static ANIME_TORRENT: Shape = Shape::Object(&[
    req!("name", Shape::String),
    req!("link", Shape::String),
    opt!("date", Shape::String),
    opt!("size", Shape::Number),
    opt!("formattedSize", Shape::String),
    opt!("seeders", Shape::Number),
    opt!("leechers", Shape::Number),
    opt!("downloadCount", Shape::Number),
    opt!("downloadUrl", Shape::String),
    opt!("magnetLink", Shape::String),
    opt!("infoHash", Shape::String),
    opt!("resolution", Shape::String),
    opt!("isBatch", Shape::Bool),
    opt!("episodeNumber", Shape::Number),
    opt!("releaseGroup", Shape::String),
    opt!("isBestRelease", Shape::Bool),
    opt!("confirmed", Shape::Bool),
]);

static MANGA_SEARCH_RESULT: Shape = Shape::Object(&[
    req!("id", Shape::String),
    req!("title", Shape::String),
    opt!("synonyms", Shape::Array(&Shape::String)),
    opt!("year", Shape::Number),
    opt!("image", Shape::String),
]);

static CHAPTER_DETAILS: Shape = Shape::Object(&[
    req!("id", Shape::String),
    req!("title", Shape::String),
    req!("chapter", Shape::Scalar),
    opt!("url", Shape::String),
    opt!("index", Shape::Number),
    opt!("scanlator", Shape::String),
    opt!("language", Shape::String),
    opt!("rating", Shape::Number),
    opt!("updatedAt", Shape::String),
]);

static CHAPTER_PAGE: Shape = Shape::Object(&[
    req!("url", Shape::String),
    req!("index", Shape::Number),
    opt!("headers", Shape::Object(&[])),
]);

static STREAM_SEARCH_RESULT: Shape = Shape::Object(&[
    req!("id", Shape::String),
    req!("title", Shape::String),
    opt!("url", Shape::String),
    opt!("subOrDub", Shape::Enum(SUB_OR_DUB)),
]);

static EPISODE_DETAILS: Shape = Shape::Object(&[
    req!("id", Shape::String),
    req!("number", Shape::Number),
    opt!("url", Shape::String),
    opt!("title", Shape::String),
]);

static VIDEO_SOURCE: Shape = Shape::Object(&[
    req!("url", Shape::String),
    req!("type", Shape::Enum(VIDEO_SOURCE_TYPES)),
    opt!("quality", Shape::String),
    opt!(
        "subtitles",
        Shape::Array(&Shape::Object(&[
            req!("url", Shape::String),
            opt!("language", Shape::String),
        ])),
    ),
]);

static EPISODE_SERVER_FIELDS: [Field; 3] = [
    req!("server", Shape::String),
    req!("videoSources", Shape::Array(&VIDEO_SOURCE)),
    opt!("headers", Shape::Object(&[])),
];

static EPISODE_SERVER: Shape = Shape::Object(&EPISODE_SERVER_FIELDS);

static MEDIA: Shape = Shape::Object(&[req!("id", Shape::Scalar)]);

static MEDIA_PAGE_FIELDS: [Field; 4] = [
    req!("media", Shape::Array(&MEDIA)),
    opt!("page", Shape::Number),
    opt!("totalPages", Shape::Number),
    opt!("total", Shape::Number),
];

static MEDIA_PAGE: Shape = Shape::Object(&MEDIA_PAGE_FIELDS);

// ─── Contract table ─────────────────────────────────────────────────────

static MANGA_PROVIDER: InterfaceContract = InterfaceContract {
    kind: ExtensionKind::MangaProvider,
    version: CONTRACT_VERSION,
    methods: &[
        MethodContract {
            name: "search",
            result: Shape::Array(&MANGA_SEARCH_RESULT),
        },
        MethodContract {
            name: "findChapters",
            result: Shape::Array(&CHAPTER_DETAILS),
        },
        MethodContract {
            name: "findChapterPages",
            result: Shape::Array(&CHAPTER_PAGE),
        },
        MethodContract {
            name: "getSettings",
            result: Shape::Object(&[
                opt!("supportsMultiLanguage", Shape::Bool),
                opt!("supportsMultiScanlator", Shape::Bool),
            ]),
        },
    ],
    members: &[],
};

static TORRENT_PROVIDER: InterfaceContract = InterfaceContract {
    kind: ExtensionKind::TorrentProvider,
    version: CONTRACT_VERSION,
    methods: &[
        MethodContract {
            name: "search",
            result: Shape::Array(&ANIME_TORRENT),
        },
        MethodContract {
            name: "smartSearch",
            result: Shape::Array(&ANIME_TORRENT),
        },
        MethodContract {
            name: "getTorrentInfoHash",
            result: Shape::String,
        },
        MethodContract {
            name: "getTorrentMagnetLink",
            result: Shape::String,
        },
        MethodContract {
            name: "getLatest",
            result: Shape::Array(&ANIME_TORRENT),
        },
        MethodContract {
            name: "getSettings",
            result: Shape::Object(&[
                req!("canSmartSearch", Shape::Bool),
                opt!(
                    "smartSearchFilters",
                    Shape::Array(&Shape::Enum(SMART_SEARCH_FILTERS)),
                ),
                opt!("supportsAdult", Shape::Bool),
                req!("type", Shape::Enum(TORRENT_PROVIDER_TYPES)),
            ]),
        },
    ],
    members: &[],
};

static ONLINE_STREAM_PROVIDER: InterfaceContract = InterfaceContract {
    kind: ExtensionKind::OnlineStreamProvider,
    version: CONTRACT_VERSION,
    methods: &[
        MethodContract {
            name: "search",
            result: Shape::Array(&STREAM_SEARCH_RESULT),
        },
        MethodContract {
            name: "findEpisodes",
            result: Shape::Array(&EPISODE_DETAILS),
        },
        MethodContract {
            name: "findEpisodeServer",
            result: Shape::Nullable(&EPISODE_SERVER),
        },
        MethodContract {
            name: "getSettings",
            result: Shape::Object(&[
                req!("episodeServers", Shape::Array(&Shape::String)),
                opt!("supportsDub", Shape::Bool),
            ]),
        },
    ],
    members: &[],
};

static CUSTOM_SOURCE: InterfaceContract = InterfaceContract {
    kind: ExtensionKind::CustomSource,
    version: CONTRACT_VERSION,
    methods: &[
        MethodContract {
            name: "getAnime",
            result: Shape::Array(&MEDIA),
        },
        MethodContract {
            name: "getAnimeDetails",
            result: Shape::Nullable(&Shape::Any),
        },
        MethodContract {
            name: "getManga",
            result: Shape::Array(&MEDIA),
        },
        MethodContract {
            name: "getMangaDetails",
            result: Shape::Nullable(&Shape::Any),
        },
        MethodContract {
            name: "listAnime",
            result: Shape::Nullable(&MEDIA_PAGE),
        },
        MethodContract {
            name: "listManga",
            result: Shape::Nullable(&MEDIA_PAGE),
        },
        MethodContract {
            name: "getSettings",
            result: Shape::Object(&[
                opt!("supportsAnime", Shape::Bool),
                opt!("supportsManga", Shape::Bool),
            ]),
        },
    ],
    members: &[],
};

static PLUGIN: InterfaceContract = InterfaceContract {
    kind: ExtensionKind::Plugin,
    version: CONTRACT_VERSION,
    methods: &[],
    members: &[UI_REGISTER_MEMBER],
};

/// The contract for `kind`.
pub fn contract_for(kind: ExtensionKind) -> &'static InterfaceContract {
    match kind {
        ExtensionKind::MangaProvider => &MANGA_PROVIDER,
        ExtensionKind::TorrentProvider => &TORRENT_PROVIDER,
        ExtensionKind::OnlineStreamProvider => &ONLINE_STREAM_PROVIDER,
        ExtensionKind::CustomSource => &CUSTOM_SOURCE,
        ExtensionKind::Plugin => &PLUGIN,
    }
}

// ─── Shape validation ───────────────────────────────────────────────────

/// Check that every required member of `kind` is exposed by the script.
///
/// `exposed` is the list of callable members reported by the sandbox.
/// All missing members are reported at once, in contract order.
pub fn validate_shape<S: AsRef<str>>(
    kind: ExtensionKind,
    exposed: &[S],
) -> Result<(), ExtensionError> {
    let missing: Vec<String> = contract_for(kind)
        .required_members()
        .filter(|member| !exposed.iter().any(|e| e.as_ref() == *member))
        .map(str::to_string)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ExtensionError::ContractViolation { kind, missing })
    }
}

// ─── Result validation ──────────────────────────────────────────────────

#[derive(Debug)]
struct Violation {
    path: String,
    expected: String,
    found: String,
}

/// Check a settled result against the declared shape of `method`.
///
/// Methods outside the contract (helpers a provider chooses to expose)
/// are not checked.
pub fn validate_result(
    kind: ExtensionKind,
    method: &str,
    value: &Value,
) -> Result<(), ExtensionError> {
    let Some(contract) = contract_for(kind).method(method) else {
        return Ok(());
    };

    let mut violations = Vec::new();
    check(&contract.result, value, "$", true, &mut violations);

    if violations.is_empty() {
        return Ok(());
    }

    let mut diff = String::new();
    for v in &violations {
        let _ = writeln!(diff, "- {}: expected {}", v.path, v.expected);
        let _ = writeln!(diff, "+ {}: found {}", v.path, v.found);
    }
    Err(ExtensionError::BadResult {
        method: method.to_string(),
        diff: diff.trim_end().to_string(),
    })
}

fn check(shape: &Shape, value: &Value, path: &str, strict: bool, out: &mut Vec<Violation>) {
    let mut fail = |expected: String| {
        out.push(Violation {
            path: path.to_string(),
            expected,
            found: describe(value),
        })
    };

    match shape {
        Shape::Any => {}
        Shape::Nullable(inner) => {
            if !value.is_nullish() {
                check(inner, value, path, strict, out);
            }
        }
        Shape::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            _ => fail(format!("one of {}", quoted_list(allowed))),
        },
        _ if !strict => {}
        Shape::String => {
            if value.as_str().is_none() {
                fail("string".into());
            }
        }
        Shape::Number => {
            if value.as_f64().is_none() {
                fail("number".into());
            }
        }
        Shape::Bool => {
            if value.as_bool().is_none() {
                fail("boolean".into());
            }
        }
        Shape::Scalar => {
            if value.as_str().is_none() && value.as_f64().is_none() {
                fail("string or number".into());
            }
        }
        Shape::Array(element) => match value.as_array() {
            Some(items) => {
                for (index, item) in items.iter().enumerate() {
                    check(element, item, &format!("{path}[{index}]"), strict, out);
                }
            }
            None => fail("array".into()),
        },
        Shape::Object(fields) => {
            if value.as_object().is_none() {
                fail("object".into());
                return;
            }
            for field in fields.iter() {
                let child = format!("{path}.{}", field.name);
                match value.get(field.name) {
                    Some(member) if !member.is_nullish() => {
                        check(&field.shape, member, &child, field.required, out);
                    }
                    member => {
                        if field.required {
                            out.push(Violation {
                                path: child,
                                expected: format!("required {}", expected_name(&field.shape)),
                                found: member.map(describe).unwrap_or_else(|| "nothing".into()),
                            });
                        }
                    }
                }
            }
        }
    }
}

fn expected_name(shape: &Shape) -> String {
    match shape {
        Shape::Any => "value".into(),
        Shape::String => "string".into(),
        Shape::Number => "number".into(),
        Shape::Bool => "boolean".into(),
        Shape::Scalar => "string or number".into(),
        Shape::Enum(allowed) => format!("one of {}", quoted_list(allowed)),
        Shape::Array(_) => "array".into(),
        Shape::Object(_) => "object".into(),
        Shape::Nullable(inner) => expected_name(inner),
    }
}

fn quoted_list(items: &[&str]) -> String {
    items
        .iter()
        .map(|s| format!("\"{s}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{s}\""),
        Value::Number(n) => format!("number {n}"),
        Value::Bool(b) => format!("boolean {b}"),
        other => other.type_name().to_string(),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
