//! `$fuzzy`: title similarity using the Sørensen–Dice coefficient.

use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestMatch {
    /// The title the candidates were compared against.
    pub original: String,
    /// The winning candidate, as given.
    pub value: String,
    pub rating: f64,
}

/// Lowercase and keep alphanumerics, collapsing everything else to single spaces.
fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for c in input.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

fn bigrams(s: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    let mut out = HashMap::new();
    for pair in chars.windows(2) {
        *out.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    out
}

/// Similarity in `[0, 1]`; 1 means identical after normalization.
pub fn compare(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize(a), normalize(b));
    if a == b {
        return 1.0;
    }
    let (left, right) = (bigrams(&a), bigrams(&b));
    let total: usize = left.values().sum::<usize>() + right.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let shared: usize = left
        .iter()
        .map(|(pair, n)| right.get(pair).map_or(0, |m| (*n).min(*m)))
        .sum();
    (2 * shared) as f64 / total as f64
}

/// Highest-rated candidate; the first one wins ties. `None` when empty.
pub fn find_best_match(title: &str, candidates: &[String]) -> Option<BestMatch> {
    let mut best: Option<BestMatch> = None;
    for candidate in candidates {
        let rating = compare(title, candidate);
        if best.as_ref().map_or(true, |b| rating > b.rating) {
            best = Some(BestMatch {
                original: title.to_string(),
                value: candidate.clone(),
                rating,
            });
        }
    }
    best
}
