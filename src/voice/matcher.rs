//! Deterministic wake-name and phrase matching over recognizer output.

use super::state::ScriptEntry;
use similar::TextDiff;

/// Recognizer confusions folded to their intended word.
const CANONICAL: &[(&str, &str)] = &[("twins", "twin"), ("skull", "scout"), ("alfa", "alpha")];

/// Lowercase, drop apostrophes (`let's` becomes `lets`), turn any other
/// punctuation into spaces, collapse whitespace, then canonicalize known
/// confusions token by token.
#[must_use]
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{2019}'))
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .map(|tok| {
            CANONICAL
                .iter()
                .find(|(from, _)| *from == tok)
                .map_or(tok, |&(_, to)| to)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character similarity in `[0, 1]`.
#[must_use]
pub fn ratio(a: &str, b: &str) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    TextDiff::from_chars(a, b).ratio()
}

fn best_ratio(token: &str, candidates: &[&str]) -> f32 {
    candidates.iter().map(|c| ratio(token, c)).fold(0.0, f32::max)
}

/// Whether `needle` occurs in `haystack` on token boundaries. Both normalized.
fn contains_words(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let padded = format!(" {haystack} ");
    padded.contains(&format!(" {needle} "))
}

/// Thresholds for [`WakeMatcher`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeRule {
    pub callsign_ratio: f32,
    pub prefix_ratio: f32,
    pub callsign_only: bool,
}

impl Default for WakeRule {
    fn default() -> Self {
        Self {
            callsign_ratio: 0.82,
            prefix_ratio: 0.70,
            callsign_only: true,
        }
    }
}

/// Wake-name detector for one alias, e.g. `twin-scout-alpha`.
#[derive(Debug, Clone)]
pub struct WakeMatcher {
    callsign: String,
    prefixes: Vec<String>,
    rule: WakeRule,
}

impl WakeMatcher {
    /// `None` when the alias normalizes to nothing.
    #[must_use]
    pub fn new(alias: &str, rule: WakeRule) -> Option<Self> {
        let norm = normalize(alias);
        let mut tokens: Vec<String> = norm.split_whitespace().map(str::to_owned).collect();
        let callsign = tokens.pop()?;
        Some(Self {
            callsign,
            prefixes: tokens,
            rule,
        })
    }

    /// Decide on a normalized utterance.
    #[must_use]
    pub fn matches(&self, utterance: &str) -> bool {
        let tokens: Vec<&str> = utterance.split_whitespace().collect();
        if tokens.is_empty() {
            return false;
        }
        let callsign = tokens.iter().map(|t| ratio(t, &self.callsign)).fold(0.0, f32::max);
        if callsign < self.rule.callsign_ratio {
            return false;
        }
        if self.prefixes.is_empty() || self.rule.callsign_only {
            return true;
        }
        let prefixes: Vec<&str> = self.prefixes.iter().map(String::as_str).collect();
        tokens
            .iter()
            .any(|t| best_ratio(t, &prefixes) >= self.rule.prefix_ratio)
    }
}

/// First script entry matching a normalized utterance.
///
/// Pass 1 takes the first entry whose normalized phrase appears as whole
/// words. Pass 2 runs only if pass 1 found nothing: the first entry where
/// every phrase token has some utterance token at `token_ratio` or better.
#[must_use]
pub fn match_script<'a>(utterance: &str, script: &'a [ScriptEntry], token_ratio: f32) -> Option<&'a ScriptEntry> {
    if utterance.is_empty() {
        return None;
    }
    let phrases: Vec<String> = script.iter().map(|e| normalize(&e.phrase)).collect();

    if let Some(i) = phrases.iter().position(|p| contains_words(utterance, p)) {
        return script.get(i);
    }

    let heard: Vec<&str> = utterance.split_whitespace().collect();
    phrases
        .iter()
        .position(|p| {
            let wanted: Vec<&str> = p.split_whitespace().collect();
            !wanted.is_empty() && wanted.iter().all(|w| best_ratio(w, &heard) >= token_ratio)
        })
        .and_then(|i| script.get(i))
}
