//! Technician name canonicalization.
//!
//! Free-text technician lists ("yassine hassan, Élodie Martin") are matched
//! against a known roster so that word order, case, and accents do not
//! create duplicate people. Pure: the caller loads and persists the roster.

use strsim::normalized_levenshtein;
use unicode_normalization::UnicodeNormalization;

/// Minimum similarity between canonical keys for two names to match.
pub const MATCH_THRESHOLD: f64 = 0.85;

/// Order-, case- and accent-insensitive key for a person name.
///
/// `"Hassan Yassine"` and `"yassine  HASSAN"` produce the same key.
pub fn canonical_key(name: &str) -> String {
    let folded: String = name
        .to_lowercase()
        .nfd()
        .filter(|c| c.is_ascii())
        .collect();
    let mut words: Vec<&str> = folded
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    words.sort_unstable();
    words.concat()
}

/// Display form: each word title-cased, words sorted, single spaces.
pub fn display_name(name: &str) -> String {
    let titled = title_case(name);
    let mut words: Vec<&str> = titled.split_whitespace().collect();
    words.sort_unstable();
    words.join(" ")
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if prev_alpha {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        prev_alpha = c.is_alphabetic();
    }
    out
}

/// Known technician names, keyed by canonical form.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    known: Vec<(String, String)>,
    added: Vec<String>,
}

impl Roster {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let known = names
            .into_iter()
            .map(|n| (canonical_key(n.as_ref()), n.as_ref().to_string()))
            .collect();
        Self {
            known,
            added: Vec::new(),
        }
    }

    /// Names registered by [`resolve`](Roster::resolve) that were not in
    /// the initial roster.
    pub fn added(&self) -> &[String] {
        &self.added
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(|(_, display)| display.as_str())
    }

    fn best_match(&self, key: &str) -> Option<&str> {
        self.known
            .iter()
            .map(|(k, display)| (normalized_levenshtein(key, k), display))
            .filter(|(score, _)| *score >= MATCH_THRESHOLD)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, display)| display.as_str())
    }

    /// Resolve a comma-separated list to roster names, registering names
    /// that match nobody.
    pub fn resolve(&mut self, raw: &str) -> Vec<String> {
        let mut resolved = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let display = display_name(name);
            let key = canonical_key(&display);
            if let Some(existing) = self.best_match(&key) {
                resolved.push(existing.to_string());
                continue;
            }
            self.known.push((key, display.clone()));
            self.added.push(display.clone());
            resolved.push(display);
        }
        resolved
    }
}
