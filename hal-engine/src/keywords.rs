//! Phrase tables for muting and unmuting.
//!
//! Literal phrases match as substrings of the normalized text. A phrase that
//! contains a word-boundary marker (`\b`) is compiled as a case-insensitive
//! regular expression and runs against the raw text instead.

use crate::error::{EngineError, Result};
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;

const REGEX_SENTINEL: &str = r"\b";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseMatch {
    pub phrase: String,
    pub severity: u32,
}

#[derive(Debug)]
enum Phrase {
    Literal(String),
    Pattern(Regex),
}

impl Phrase {
    fn compile(source: &str) -> Result<Self> {
        if source.contains(REGEX_SENTINEL) {
            let regex = RegexBuilder::new(source)
                .case_insensitive(true)
                .build()
                .map_err(|e| EngineError::InvalidPhrase {
                    phrase: source.to_string(),
                    source: e,
                })?;
            return Ok(Self::Pattern(regex));
        }
        Ok(Self::Literal(normalize(source)))
    }

    fn is_match(&self, raw: &str, normalized: &str) -> bool {
        match self {
            Self::Literal(needle) => !needle.is_empty() && normalized.contains(needle.as_str()),
            Self::Pattern(regex) => regex.is_match(raw),
        }
    }
}

#[derive(Debug)]
struct Entry {
    source: String,
    phrase: Phrase,
    severity: u32,
}

#[derive(Debug)]
pub struct KeywordMatcher {
    mute: Vec<Entry>,
    unmute: Vec<Entry>,
}

impl KeywordMatcher {
    /// Compiles both tables. A malformed pattern is a startup error.
    pub fn new(mute_phrases: &BTreeMap<String, u32>, unmute_phrases: &[String]) -> Result<Self> {
        let mute = mute_phrases
            .iter()
            .map(|(source, severity)| {
                Ok(Entry {
                    source: source.clone(),
                    phrase: Phrase::compile(source)?,
                    severity: *severity,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let unmute = unmute_phrases
            .iter()
            .map(|source| {
                Ok(Entry {
                    source: source.clone(),
                    phrase: Phrase::compile(source)?,
                    severity: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { mute, unmute })
    }

    pub fn mute_phrase_count(&self) -> usize {
        self.mute.len()
    }

    pub fn unmute_phrase_count(&self) -> usize {
        self.unmute.len()
    }

    /// The most severe mute phrase found in `text`. Ties go to table order.
    pub fn match_mute(&self, text: &str) -> Option<PhraseMatch> {
        let normalized = normalize(text);
        let mut best: Option<&Entry> = None;
        for entry in &self.mute {
            if !entry.phrase.is_match(text, &normalized) {
                continue;
            }
            if best.is_none_or(|b| entry.severity > b.severity) {
                best = Some(entry);
            }
        }
        best.map(|entry| PhraseMatch {
            phrase: entry.source.clone(),
            severity: entry.severity,
        })
    }

    pub fn match_unmute(&self, text: &str) -> bool {
        let normalized = normalize(text);
        self.unmute
            .iter()
            .any(|entry| entry.phrase.is_match(text, &normalized))
    }
}

/// Lowercases and strips everything but letters, digits and whitespace.
pub fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect()
}

/// True when `token` appears in the normalized text as a whole word.
pub fn requires_address(text: &str, token: &str) -> bool {
    let token = normalize(token);
    if token.is_empty() {
        return false;
    }
    normalize(text).split_whitespace().any(|word| word == token)
}

pub fn is_addressed(text: &str, tokens: &[String]) -> bool {
    tokens.iter().any(|token| requires_address(text, token))
}
