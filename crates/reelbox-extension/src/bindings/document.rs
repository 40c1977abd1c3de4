//! Parsed HTML documents and immutable node selections behind `Doc`/`LoadDoc`.
//!
//! Scripts only ever see integer handles. A selection stores document-order
//! ranks of its nodes (rank 0 is the document itself), so every traversal
//! returns a fresh handle and earlier handles stay valid for `end()`.
//! Everything is dropped by [`DocumentStore::clear`] at the end of a call.

use std::collections::HashMap;

use ego_tree::NodeId;
use indexmap::IndexMap;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use slab::Slab;
use thiserror::Error;

/// Upper bound on live selections per call.
const MAX_SELECTIONS: usize = 100_000;

#[derive(Error, Debug, PartialEq)]
pub enum DocumentError {
    #[error("invalid selector '{0}'")]
    Selector(String),

    #[error("unknown selection handle {0}")]
    UnknownSelection(usize),

    #[error("too many live selections")]
    TooManySelections,
}

/// A selection as seen by the script: its handle and node count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectionHandle {
    pub id: usize,
    pub length: usize,
}

/// Operations producing a new selection from an existing one.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "camelCase")]
pub enum Traversal {
    Find(String),
    Children(Option<String>),
    Parent(Option<String>),
    Parents(Option<String>),
    Closest(String),
    Next(Option<String>),
    NextAll(Option<String>),
    Prev(Option<String>),
    PrevAll(Option<String>),
    Siblings(Option<String>),
    Filter(String),
    Not(String),
    Has(String),
    First,
    Last,
    Eq(i64),
    /// Keep the nodes at these positions, in order. Used by predicate filters.
    Pick(Vec<usize>),
}

#[derive(Debug)]
struct Selection {
    doc: usize,
    ranks: Vec<usize>,
}

/// A parsed document with its node order computed once.
struct Document {
    html: Html,
    order: Vec<NodeId>,
    rank: HashMap<NodeId, usize>,
}

impl Document {
    fn new(html: Html) -> Self {
        let order: Vec<NodeId> = html.tree.root().descendants().map(|n| n.id()).collect();
        let rank = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Self { html, order, rank }
    }

    fn element(&self, rank: usize) -> Option<ElementRef<'_>> {
        self.order
            .get(rank)
            .and_then(|id| self.html.tree.get(*id))
            .and_then(ElementRef::wrap)
    }
}

#[derive(Default)]
pub struct DocumentStore {
    docs: Slab<Document>,
    selections: Slab<Selection>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("documents", &self.docs.len())
            .field("selections", &self.selections.len())
            .finish()
    }
}

fn parse_selector(selector: &str) -> Result<Selector, DocumentError> {
    Selector::parse(selector).map_err(|_| DocumentError::Selector(selector.to_string()))
}

fn parse_optional(selector: Option<&str>) -> Result<Option<Selector>, DocumentError> {
    selector.map(parse_selector).transpose()
}

fn keep<'a>(elements: Vec<ElementRef<'a>>, selector: Option<&Selector>) -> Vec<ElementRef<'a>> {
    match selector {
        Some(s) => elements.into_iter().filter(|e| s.matches(e)).collect(),
        None => elements,
    }
}

fn descendants<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.descendants().skip(1).filter_map(ElementRef::wrap)
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        self.docs.len()
    }

    /// Drops every document and selection.
    pub fn clear(&mut self) {
        self.docs.clear();
        self.selections.clear();
    }

    /// Parses `html` and returns a selection holding the document itself.
    pub fn parse(&mut self, html: &str) -> Result<SelectionHandle, DocumentError> {
        let doc = self.docs.insert(Document::new(Html::parse_document(html)));
        self.insert(doc, vec![0])
    }

    fn insert(&mut self, doc: usize, ranks: Vec<usize>) -> Result<SelectionHandle, DocumentError> {
        if self.selections.len() >= MAX_SELECTIONS {
            return Err(DocumentError::TooManySelections);
        }
        let length = ranks.len();
        let id = self.selections.insert(Selection { doc, ranks });
        Ok(SelectionHandle { id, length })
    }

    fn selection(&self, id: usize) -> Result<(&Selection, &Document), DocumentError> {
        let selection = self
            .selections
            .get(id)
            .ok_or(DocumentError::UnknownSelection(id))?;
        let document = self
            .docs
            .get(selection.doc)
            .ok_or(DocumentError::UnknownSelection(id))?;
        Ok((selection, document))
    }

    pub fn traverse(&mut self, id: usize, op: Traversal) -> Result<SelectionHandle, DocumentError> {
        let (selection, document) = self.selection(id)?;
        let doc = selection.doc;
        let html = &document.html;

        // Positional operations work on ranks directly.
        let positional = match &op {
            Traversal::First => Some(selection.ranks.first().copied().into_iter().collect()),
            Traversal::Last => Some(selection.ranks.last().copied().into_iter().collect()),
            Traversal::Eq(index) => {
                let len = selection.ranks.len() as i64;
                let index = if *index < 0 { len + index } else { *index };
                Some(
                    usize::try_from(index)
                        .ok()
                        .and_then(|i| selection.ranks.get(i).copied())
                        .into_iter()
                        .collect(),
                )
            }
            Traversal::Pick(positions) => Some(
                positions
                    .iter()
                    .filter_map(|&i| selection.ranks.get(i).copied())
                    .collect(),
            ),
            _ => None,
        };
        if let Some(ranks) = positional {
            return self.insert(doc, ranks);
        }

        let has_root = selection.ranks.contains(&0);
        let current: Vec<ElementRef<'_>> = selection
            .ranks
            .iter()
            .filter_map(|&r| document.element(r))
            .collect();

        let found: Vec<ElementRef<'_>> = match op {
            Traversal::Find(s) => {
                let sel = parse_selector(&s)?;
                let mut out: Vec<ElementRef<'_>> = Vec::new();
                if has_root {
                    out.extend(html.select(&sel));
                }
                for el in &current {
                    out.extend(descendants(*el).filter(|d| sel.matches(d)));
                }
                out
            }
            Traversal::Children(s) => {
                let sel = parse_optional(s.as_deref())?;
                let mut out: Vec<ElementRef<'_>> = Vec::new();
                if has_root {
                    out.extend(html.tree.root().children().filter_map(ElementRef::wrap));
                }
                for el in &current {
                    out.extend(el.children().filter_map(ElementRef::wrap));
                }
                keep(out, sel.as_ref())
            }
            Traversal::Parent(s) => {
                let sel = parse_optional(s.as_deref())?;
                let out = current
                    .iter()
                    .filter_map(|el| el.parent().and_then(ElementRef::wrap))
                    .collect();
                keep(out, sel.as_ref())
            }
            Traversal::Parents(s) => {
                let sel = parse_optional(s.as_deref())?;
                let out = current
                    .iter()
                    .flat_map(|el| el.ancestors().filter_map(ElementRef::wrap))
                    .collect();
                keep(out, sel.as_ref())
            }
            Traversal::Closest(s) => {
                let sel = parse_selector(&s)?;
                current
                    .iter()
                    .filter_map(|el| {
                        std::iter::once(*el)
                            .chain(el.ancestors().filter_map(ElementRef::wrap))
                            .find(|e| sel.matches(e))
                    })
                    .collect()
            }
            Traversal::Next(s) => {
                let sel = parse_optional(s.as_deref())?;
                let out = current
                    .iter()
                    .filter_map(|el| el.next_siblings().find_map(ElementRef::wrap))
                    .collect();
                keep(out, sel.as_ref())
            }
            Traversal::NextAll(s) => {
                let sel = parse_optional(s.as_deref())?;
                let out = current
                    .iter()
                    .flat_map(|el| el.next_siblings().filter_map(ElementRef::wrap))
                    .collect();
                keep(out, sel.as_ref())
            }
            Traversal::Prev(s) => {
                let sel = parse_optional(s.as_deref())?;
                let out = current
                    .iter()
                    .filter_map(|el| el.prev_siblings().find_map(ElementRef::wrap))
                    .collect();
                keep(out, sel.as_ref())
            }
            Traversal::PrevAll(s) => {
                let sel = parse_optional(s.as_deref())?;
                let out = current
                    .iter()
                    .flat_map(|el| el.prev_siblings().filter_map(ElementRef::wrap))
                    .collect();
                keep(out, sel.as_ref())
            }
            Traversal::Siblings(s) => {
                let sel = parse_optional(s.as_deref())?;
                let out = current
                    .iter()
                    .flat_map(|el| {
                        let me = el.id();
                        el.parent()
                            .into_iter()
                            .flat_map(|p| p.children())
                            .filter(move |c| c.id() != me)
                            .filter_map(ElementRef::wrap)
                    })
                    .collect();
                keep(out, sel.as_ref())
            }
            Traversal::Filter(s) => {
                let sel = parse_selector(&s)?;
                keep(current, Some(&sel))
            }
            Traversal::Not(s) => {
                let sel = parse_selector(&s)?;
                current.into_iter().filter(|e| !sel.matches(e)).collect()
            }
            Traversal::Has(s) => {
                let sel = parse_selector(&s)?;
                current
                    .into_iter()
                    .filter(|el| descendants(*el).any(|d| sel.matches(&d)))
                    .collect()
            }
            Traversal::First | Traversal::Last | Traversal::Eq(_) | Traversal::Pick(_) => {
                Vec::new()
            }
        };

        let mut ranks: Vec<usize> = found
            .iter()
            .filter_map(|el| document.rank.get(&el.id()).copied())
            .collect();
        ranks.sort_unstable();
        ranks.dedup();
        self.insert(doc, ranks)
    }

    /// Combined text of every node in the selection.
    pub fn text(&self, id: usize) -> Result<String, DocumentError> {
        let (selection, document) = self.selection(id)?;
        let mut out = String::new();
        for &r in &selection.ranks {
            if r == 0 {
                out.extend(document.html.root_element().text());
            } else if let Some(el) = document.element(r) {
                out.extend(el.text());
            }
        }
        Ok(out)
    }

    /// Inner HTML of the first node, `None` for an empty selection.
    pub fn html(&self, id: usize) -> Result<Option<String>, DocumentError> {
        let (selection, document) = self.selection(id)?;
        let Some(&first) = selection.ranks.first() else {
            return Ok(None);
        };
        if first == 0 {
            return Ok(Some(document.html.html()));
        }
        Ok(document.element(first).map(|el| el.inner_html()))
    }

    /// Attributes of the first element, in source order.
    pub fn attrs(&self, id: usize) -> Result<IndexMap<String, String>, DocumentError> {
        let (selection, document) = self.selection(id)?;
        let first = selection.ranks.first().and_then(|&r| document.element(r));
        Ok(first
            .map(|el| {
                el.value()
                    .attrs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn attr(&self, id: usize, name: &str) -> Result<Option<String>, DocumentError> {
        Ok(self.attrs(id)?.shift_remove(name))
    }

    /// Whether any node in the selection matches `selector`.
    pub fn is(&self, id: usize, selector: &str) -> Result<bool, DocumentError> {
        let sel = parse_selector(selector)?;
        let (selection, document) = self.selection(id)?;
        Ok(selection
            .ranks
            .iter()
            .filter_map(|&r| document.element(r))
            .any(|el| sel.matches(&el)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOG: &str = r#"<html><body>
        <main id="feed">
          <article class="post pinned" data-id="1"><h2>First post</h2><p>Welcome</p></article>
          <article class="post" data-id="2"><h2>Second post</h2><a href="/p/2">more</a></article>
          <article class="post" data-id="3"><h2>Third post</h2><a href="/p/3">more</a></article>
        </main>
        <aside><h2>Sidebar</h2></aside>
    </body></html>"#;

    fn titles(store: &mut DocumentStore, sel: SelectionHandle) -> Vec<String> {
        (0..sel.length as i64)
            .map(|i| {
                let one = store.traverse(sel.id, Traversal::Eq(i)).unwrap();
                let h2 = store.traverse(one.id, Traversal::Find("h2".into())).unwrap();
                store.text(h2.id).unwrap()
            })
            .collect()
    }

    // ── Traversal ───────────────────────────────────────────────────

    #[test]
    fn test_chain_yields_posts_two_and_three() {
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        let posts = store
            .traverse(doc.id, Traversal::Find("article.post".into()))
            .unwrap();
        assert_eq!(posts.length, 3);
        let rest = store
            .traverse(posts.id, Traversal::Not(".pinned".into()))
            .unwrap();
        assert_eq!(titles(&mut store, rest), vec!["Second post", "Third post"]);
    }

    #[test]
    fn test_results_are_in_document_order_and_deduplicated() {
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        let links = store.traverse(doc.id, Traversal::Find("a".into())).unwrap();
        let parents = store
            .traverse(links.id, Traversal::Parents(Some("main".into())))
            .unwrap();
        assert_eq!(parents.length, 1);

        let reversed = store.traverse(doc.id, Traversal::Find("article".into())).unwrap();
        let picked = store
            .traverse(reversed.id, Traversal::Pick(vec![2, 0]))
            .unwrap();
        let back = store.traverse(picked.id, Traversal::Find("h2".into())).unwrap();
        assert_eq!(titles(&mut store, back), vec!["First post", "Third post"]);
    }

    #[test]
    fn test_siblings_and_neighbours() {
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        let posts = store.traverse(doc.id, Traversal::Find("article".into())).unwrap();
        let second = store.traverse(posts.id, Traversal::Eq(1)).unwrap();

        let next = store.traverse(second.id, Traversal::Next(None)).unwrap();
        assert_eq!(store.attr(next.id, "data-id").unwrap().as_deref(), Some("3"));
        let prev = store.traverse(second.id, Traversal::Prev(None)).unwrap();
        assert_eq!(store.attr(prev.id, "data-id").unwrap().as_deref(), Some("1"));
        let siblings = store.traverse(second.id, Traversal::Siblings(None)).unwrap();
        assert_eq!(siblings.length, 2);
        let last = store.traverse(posts.id, Traversal::Eq(-1)).unwrap();
        assert_eq!(store.attr(last.id, "data-id").unwrap().as_deref(), Some("3"));
        let none = store.traverse(posts.id, Traversal::Eq(7)).unwrap();
        assert_eq!(none.length, 0);
    }

    #[test]
    fn test_filter_has_closest() {
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        let posts = store.traverse(doc.id, Traversal::Find("article".into())).unwrap();
        let with_links = store.traverse(posts.id, Traversal::Has("a".into())).unwrap();
        assert_eq!(with_links.length, 2);
        let pinned = store
            .traverse(posts.id, Traversal::Filter(".pinned".into()))
            .unwrap();
        assert_eq!(pinned.length, 1);

        let link = store.traverse(doc.id, Traversal::Find("a".into())).unwrap();
        let article = store
            .traverse(link.id, Traversal::Closest("article".into()))
            .unwrap();
        assert_eq!(article.length, 2);
        assert!(store.is(article.id, ".post").unwrap());
        assert!(!store.is(article.id, ".pinned").unwrap());
    }

    #[test]
    fn test_document_order_is_computed_once_per_parse() {
        let document = Document::new(Html::parse_document(BLOG));
        assert!(document.element(0).is_none());
        for (i, id) in document.order.iter().enumerate() {
            assert_eq!(document.rank[id], i);
        }

        // Repeated traversals reuse the cached order.
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        let posts = store.traverse(doc.id, Traversal::Find("article".into())).unwrap();
        let mut current = store.traverse(posts.id, Traversal::First).unwrap();
        for expected in ["2", "3"] {
            current = store.traverse(current.id, Traversal::Next(None)).unwrap();
            assert_eq!(store.attr(current.id, "data-id").unwrap().as_deref(), Some(expected));
        }
        let end = store.traverse(current.id, Traversal::Next(None)).unwrap();
        assert_eq!(end.length, 0);
    }

    // ── Extraction ──────────────────────────────────────────────────

    #[test]
    fn test_attrs_html_and_text() {
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        let first = store
            .traverse(doc.id, Traversal::Find("article".into()))
            .and_then(|s| store.traverse(s.id, Traversal::First))
            .unwrap();
        let attrs = store.attrs(first.id).unwrap();
        assert_eq!(attrs.get("class").map(String::as_str), Some("post pinned"));
        assert_eq!(attrs.get("data-id").map(String::as_str), Some("1"));
        assert_eq!(
            store.html(first.id).unwrap().as_deref(),
            Some("<h2>First post</h2><p>Welcome</p>")
        );
        assert_eq!(store.text(first.id).unwrap(), "First postWelcome");
        assert!(store.text(doc.id).unwrap().contains("Sidebar"));
    }

    #[test]
    fn test_empty_selection_extraction() {
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        let none = store.traverse(doc.id, Traversal::Find("table".into())).unwrap();
        assert_eq!(none.length, 0);
        assert_eq!(store.html(none.id).unwrap(), None);
        assert_eq!(store.attr(none.id, "href").unwrap(), None);
        assert_eq!(store.text(none.id).unwrap(), "");
    }

    // ── Errors and lifetime ─────────────────────────────────────────

    #[test]
    fn test_invalid_selector() {
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        assert_eq!(
            store.traverse(doc.id, Traversal::Find("[[".into())).unwrap_err(),
            DocumentError::Selector("[[".into())
        );
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut store = DocumentStore::new();
        let doc = store.parse(BLOG).unwrap();
        assert_eq!(store.document_count(), 1);
        store.clear();
        assert_eq!(store.document_count(), 0);
        assert_eq!(
            store.text(doc.id).unwrap_err(),
            DocumentError::UnknownSelection(doc.id)
        );
    }

    #[test]
    fn test_traversal_deserializes_from_script_json() {
        let op: Traversal = serde_json::from_str(r#"{"op":"find","arg":"a.title"}"#).unwrap();
        assert!(matches!(op, Traversal::Find(s) if s == "a.title"));
        let op: Traversal = serde_json::from_str(r#"{"op":"children","arg":null}"#).unwrap();
        assert!(matches!(op, Traversal::Children(None)));
        let op: Traversal = serde_json::from_str(r#"{"op":"first"}"#).unwrap();
        assert!(matches!(op, Traversal::First));
    }
}
