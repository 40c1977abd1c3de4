//! `$torrentUtils`: bencode metainfo parsing and magnet links.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Nesting limit for lists and dictionaries.
const MAX_DEPTH: usize = 32;

#[derive(Error, Debug, PartialEq)]
pub enum TorrentError {
    #[error("invalid bencode at byte {offset}: {message}")]
    Bencode { offset: usize, message: String },

    #[error("torrent has no info dictionary")]
    MissingInfo,

    #[error("invalid base64 torrent data: {0}")]
    Base64(String),
}

// ─── Bencode ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    fn get(&self, key: &str) -> Option<&Bencode> {
        match self {
            Bencode::Dict(map) => map.get(key.as_bytes()),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<String> {
        match self {
            Bencode::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn as_list(&self) -> &[Bencode] {
        match self {
            Bencode::List(items) => items,
            _ => &[],
        }
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    /// Byte span of the top-level `info` value.
    info_span: Option<(usize, usize)>,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            info_span: None,
        }
    }

    fn error(&self, message: impl Into<String>) -> TorrentError {
        TorrentError::Bencode {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Result<u8, TorrentError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("unexpected end of input"))
    }

    fn value(&mut self, depth: usize) -> Result<Bencode, TorrentError> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let n = self.number(b'e')?;
                Ok(Bencode::Int(n))
            }
            b'0'..=b'9' => self.bytes().map(Bencode::Bytes),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Bencode::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.bytes()?;
                    let start = self.pos;
                    let value = self.value(depth + 1)?;
                    if depth == 0 && key == b"info" {
                        self.info_span = Some((start, self.pos));
                    }
                    map.insert(key, value);
                }
                self.pos += 1;
                Ok(Bencode::Dict(map))
            }
            other => Err(self.error(format!("unexpected byte 0x{other:02x}"))),
        }
    }

    fn number(&mut self, terminator: u8) -> Result<i64, TorrentError> {
        let start = self.pos;
        let end = self.input[start..]
            .iter()
            .position(|&b| b == terminator)
            .map(|i| start + i)
            .ok_or_else(|| self.error("unterminated number"))?;
        let text = std::str::from_utf8(&self.input[start..end])
            .map_err(|_| self.error("non-ascii number"))?;
        let n = text
            .parse::<i64>()
            .map_err(|_| self.error(format!("invalid number '{text}'")))?;
        self.pos = end + 1;
        Ok(n)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, TorrentError> {
        let len = self.number(b':')?;
        let len = usize::try_from(len).map_err(|_| self.error("negative length"))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or_else(|| self.error("string runs past end of input"))?;
        let out = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }
}

pub fn decode(input: &[u8]) -> Result<Bencode, TorrentError> {
    let mut decoder = Decoder::new(input);
    decoder.value(0)
}

// ─── Metainfo ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentFile {
    pub path: String,
    pub length: u64,
}

/// Parsed metainfo as handed to scripts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentInfo {
    pub name: String,
    /// Lowercase hex SHA-1 of the raw `info` dictionary.
    pub info_hash: String,
    pub trackers: Vec<String>,
    pub length: u64,
    pub piece_length: u64,
    pub files: Vec<TorrentFile>,
    pub private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

pub fn parse(data: &[u8]) -> Result<TorrentInfo, TorrentError> {
    let mut decoder = Decoder::new(data);
    let root = decoder.value(0)?;
    let (start, end) = decoder.info_span.ok_or(TorrentError::MissingInfo)?;
    let info = root.get("info").ok_or(TorrentError::MissingInfo)?;

    let info_hash = data_encoding::HEXLOWER.encode(&Sha1::digest(&data[start..end]));
    let name = info.get("name").and_then(Bencode::as_str).unwrap_or_default();
    let piece_length = info
        .get("piece length")
        .and_then(Bencode::as_int)
        .unwrap_or(0)
        .max(0) as u64;

    let files: Vec<TorrentFile> = match info.get("files") {
        Some(list) => list
            .as_list()
            .iter()
            .map(|file| TorrentFile {
                path: file
                    .get("path")
                    .map(|p| {
                        p.as_list()
                            .iter()
                            .filter_map(Bencode::as_str)
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                    .unwrap_or_default(),
                length: file.get("length").and_then(Bencode::as_int).unwrap_or(0).max(0) as u64,
            })
            .collect(),
        None => vec![TorrentFile {
            path: name.clone(),
            length: info.get("length").and_then(Bencode::as_int).unwrap_or(0).max(0) as u64,
        }],
    };

    Ok(TorrentInfo {
        length: files.iter().map(|f| f.length).sum(),
        trackers: trackers(&root),
        private: info.get("private").and_then(Bencode::as_int) == Some(1),
        comment: root.get("comment").and_then(Bencode::as_str),
        name,
        info_hash,
        piece_length,
        files,
    })
}

/// `announce` followed by every `announce-list` tier, deduplicated in order.
fn trackers(root: &Bencode) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let tiers = root
        .get("announce-list")
        .map(|l| l.as_list().iter().flat_map(|tier| tier.as_list()).collect::<Vec<_>>())
        .unwrap_or_default();
    for tracker in root
        .get("announce")
        .into_iter()
        .chain(tiers)
        .filter_map(Bencode::as_str)
    {
        if !tracker.is_empty() && !out.contains(&tracker) {
            out.push(tracker);
        }
    }
    out
}

pub fn magnet_link(info: &TorrentInfo) -> String {
    let mut link = format!("magnet:?xt=urn:btih:{}", info.info_hash);
    if !info.name.is_empty() {
        link.push_str("&dn=");
        link.push_str(&urlencoding::encode(&info.name));
    }
    for tracker in &info.trackers {
        link.push_str("&tr=");
        link.push_str(&urlencoding::encode(tracker));
    }
    link
}

/// `$torrentUtils.getMagnetLinkFromTorrentData(b64)`.
pub fn magnet_from_base64(b64: &str) -> Result<String, TorrentError> {
    let data = STANDARD
        .decode(b64.trim())
        .map_err(|e| TorrentError::Base64(e.to_string()))?;
    parse(&data).map(|info| magnet_link(&info))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = include_bytes!("../../tests/fixtures/sample.torrent");
    const SAMPLE_HASH: &str = "5825b2040c05f6fd3e84e0a4eb6c07f9763ec6c3";

    #[test]
    fn test_decode_primitives() {
        assert_eq!(decode(b"i42e").unwrap(), Bencode::Int(42));
        assert_eq!(decode(b"i-3e").unwrap(), Bencode::Int(-3));
        assert_eq!(decode(b"4:spam").unwrap(), Bencode::Bytes(b"spam".to_vec()));
        assert_eq!(
            decode(b"l1:ai1ee").unwrap(),
            Bencode::List(vec![Bencode::Bytes(b"a".to_vec()), Bencode::Int(1)])
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode(b"5:abc"), Err(TorrentError::Bencode { .. })));
        assert!(matches!(decode(b"i12"), Err(TorrentError::Bencode { .. })));
        assert!(matches!(decode(b"x"), Err(TorrentError::Bencode { .. })));
        let deep = format!("{}{}", "l".repeat(64), "e".repeat(64));
        assert!(decode(deep.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_fixture_info_hash() {
        let info = parse(SAMPLE).unwrap();
        assert_eq!(info.info_hash, SAMPLE_HASH);
        assert_eq!(info.info_hash.len(), 40);
        assert_eq!(info.name, "[Group] Show - 01.mkv");
        assert_eq!(info.length, 1_048_576);
        assert_eq!(info.piece_length, 262_144);
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.comment.as_deref(), Some("test"));
        assert!(!info.private);
    }

    #[test]
    fn test_trackers_are_deduplicated_in_order() {
        let info = parse(SAMPLE).unwrap();
        assert_eq!(
            info.trackers,
            vec![
                "udp://tracker.example.org:1337".to_string(),
                "https://backup.example/ann".to_string(),
            ]
        );
    }

    #[test]
    fn test_magnet_from_base64() {
        let link = magnet_from_base64(&STANDARD.encode(SAMPLE)).unwrap();
        assert_eq!(
            link,
            format!(
                "magnet:?xt=urn:btih:{SAMPLE_HASH}\
                 &dn=%5BGroup%5D%20Show%20-%2001.mkv\
                 &tr=udp%3A%2F%2Ftracker.example.org%3A1337\
                 &tr=https%3A%2F%2Fbackup.example%2Fann"
            )
        );
    }

    #[test]
    fn test_multi_file_torrent() {
        let data = b"d4:infod5:filesld6:lengthi3e4:pathl3:dir5:a.txteed6:lengthi4e4:pathl5:b.txteee4:name4:pack12:piece lengthi16e6:pieces0:7:privatei1eee";
        let info = parse(data).unwrap();
        assert_eq!(info.length, 7);
        assert_eq!(info.files[0].path, "dir/a.txt");
        assert_eq!(info.files[1].path, "b.txt");
        assert!(info.private);
        assert!(info.trackers.is_empty());
    }

    #[test]
    fn test_missing_info() {
        assert_eq!(parse(b"d3:fooi1ee").unwrap_err(), TorrentError::MissingInfo);
        assert!(matches!(
            magnet_from_base64("!!!"),
            Err(TorrentError::Base64(_))
        ));
    }
}
