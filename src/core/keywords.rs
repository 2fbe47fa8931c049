//! Phrase matching for incident messages.
//!
//! Phrases are matched case-insensitively on word boundaries. Patterns are
//! compiled once from configuration and shared read-only across workers.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::LabelConfig;
use crate::error::{PipelineError, Result};
use crate::ingest::RaceControlMessage;

/// Maximum number of named keyword flags (one bit each in a mask).
pub const MAX_KEYWORDS: usize = 64;

/// Regex alternation of the escaped phrases, whitespace-tolerant.
fn alternation(phrases: &[String]) -> Result<String> {
    let alternatives: Vec<String> = phrases
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| regex::escape(p).replace(' ', r"\s+"))
        .collect();
    if alternatives.is_empty() {
        return Err(PipelineError::InvalidConfig("empty phrase list".into()));
    }
    Ok(alternatives.join("|"))
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
}

/// Compile a list of phrases into one case-insensitive, word-bounded regex.
pub fn phrase_pattern(phrases: &[String]) -> Result<Regex> {
    compile(&format!(r"(?i)\b(?:{})\b", alternation(phrases)?))
}

/// Like [`phrase_pattern`], but a phrase from `first` must appear before a
/// phrase from `then` in the same text.
pub fn ordered_pattern(first: &[String], then: &[String]) -> Result<Regex> {
    compile(&format!(
        r"(?is)\b(?:{})\b.*\b(?:{})\b",
        alternation(first)?,
        alternation(then)?
    ))
}

/// Named presence flags evaluated per message.
#[derive(Debug, Clone)]
pub struct KeywordSet {
    names: Vec<String>,
    patterns: Vec<Regex>,
}

impl KeywordSet {
    /// Build from `(name, phrases)` pairs; order defines the bit layout.
    pub fn new<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut names = Vec::new();
        let mut patterns = Vec::new();
        for (name, phrases) in entries {
            patterns.push(phrase_pattern(&phrases)?);
            names.push(name);
        }
        if names.len() > MAX_KEYWORDS {
            return Err(PipelineError::InvalidConfig(format!(
                "at most {MAX_KEYWORDS} keyword flags are supported"
            )));
        }
        Ok(Self { names, patterns })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Bit `i` is set when keyword `i` occurs in `text`.
    pub fn mask(&self, text: &str) -> u64 {
        self.patterns
            .iter()
            .enumerate()
            .filter(|(_, pattern)| pattern.is_match(text))
            .fold(0u64, |mask, (i, _)| mask | (1 << i))
    }
}

/// Which intervention a message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    SafetyCar,
    VirtualSafetyCar,
}

/// Role of a message in event formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Start(InterventionKind),
    End(InterventionKind),
    /// Mentions an intervention but cannot be resolved to start or end
    Ambiguous,
    Irrelevant,
}

/// Classifies incident messages against the intervention vocabulary.
///
/// Structured category/flag fields are the primary signal; the free text
/// is the fallback, where a start marker only counts after the intervention
/// is named. End markers always win, so "SAFETY CAR IN THIS LAP" is never
/// read as a deployment.
#[derive(Debug, Clone)]
pub struct MessageClassifier {
    categories: Vec<String>,
    vsc_categories: Vec<String>,
    flags: Vec<String>,
    mention: Regex,
    vsc_mention: Regex,
    start: Regex,
    end: Regex,
}

impl MessageClassifier {
    pub fn new(config: &LabelConfig) -> Result<Self> {
        Ok(Self {
            categories: config.categories.clone(),
            vsc_categories: config.vsc_categories.clone(),
            flags: config.flags.clone(),
            mention: phrase_pattern(&config.keywords)?,
            vsc_mention: phrase_pattern(&config.vsc_keywords)?,
            start: ordered_pattern(&config.keywords, &config.start_markers)?,
            end: phrase_pattern(&config.end_markers)?,
        })
    }

    pub fn classify(&self, message: &RaceControlMessage) -> MessageClass {
        let text = message.message.as_str();
        let category = message.category();
        let flag = message.flag();

        let structured = category.is_some_and(|c| contains_ignore_case(&self.categories, c))
            || flag.is_some_and(|f| contains_ignore_case(&self.flags, f));
        let mentioned = self.mention.is_match(text);

        if !structured && !mentioned {
            return MessageClass::Irrelevant;
        }

        let kind = if category.is_some_and(|c| contains_ignore_case(&self.vsc_categories, c))
            || flag.is_some_and(|f| self.vsc_mention.is_match(f))
            || self.vsc_mention.is_match(text)
        {
            InterventionKind::VirtualSafetyCar
        } else {
            InterventionKind::SafetyCar
        };

        if self.end.is_match(text) {
            MessageClass::End(kind)
        } else if structured || self.start.is_match(text) {
            MessageClass::Start(kind)
        } else {
            MessageClass::Ambiguous
        }
    }
}

fn contains_ignore_case(haystack: &[String], needle: &str) -> bool {
    haystack.iter().any(|h| h.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn classifier() -> MessageClassifier {
        MessageClassifier::new(&LabelConfig::default()).unwrap()
    }

    fn msg(text: &str, category: &str, flag: &str) -> RaceControlMessage {
        let mut m = RaceControlMessage::new(Utc::now(), text);
        if !category.is_empty() {
            m = m.with_category(category);
        }
        if !flag.is_empty() {
            m = m.with_flag(flag);
        }
        m
    }

    #[test]
    fn test_detects_safety_car_category() {
        let class = classifier().classify(&msg("SAFETY CAR DEPLOYED", "SafetyCar", ""));
        assert_eq!(class, MessageClass::Start(InterventionKind::SafetyCar));
    }

    #[test]
    fn test_detects_vsc_category() {
        let class = classifier().classify(&msg("VIRTUAL SAFETY CAR DEPLOYED", "Vsc", "VSC"));
        assert_eq!(class, MessageClass::Start(InterventionKind::VirtualSafetyCar));
    }

    #[test]
    fn test_end_markers_win() {
        let c = classifier();
        assert_eq!(
            c.classify(&msg("SAFETY CAR ENDING", "SafetyCar", "SC")),
            MessageClass::End(InterventionKind::SafetyCar)
        );
        assert_eq!(
            c.classify(&msg("SAFETY CAR IN THIS LAP", "", "")),
            MessageClass::End(InterventionKind::SafetyCar)
        );
        assert_eq!(
            c.classify(&msg("vsc ending", "", "")),
            MessageClass::End(InterventionKind::VirtualSafetyCar)
        );
    }

    #[test]
    fn test_text_fallback_and_irrelevant() {
        let c = classifier();
        assert_eq!(
            c.classify(&msg("Safety Car Deployed", "", "")),
            MessageClass::Start(InterventionKind::SafetyCar)
        );
        assert_eq!(c.classify(&msg("TRACK CLEAR", "", "")), MessageClass::Irrelevant);
        assert_eq!(
            c.classify(&msg("TRACK LIMITS REMINDER", "TrackLimits", "")),
            MessageClass::Irrelevant
        );
    }

    #[test]
    fn test_unresolvable_mention_is_ambiguous() {
        let class = classifier().classify(&msg("SAFETY CAR LIGHTS CHECK", "Other", ""));
        assert_eq!(class, MessageClass::Ambiguous);
    }

    #[test]
    fn test_start_marker_must_follow_the_mention() {
        let c = classifier();
        let note = msg("CAR 4 OUT OF POSITION BEHIND THE SAFETY CAR - NOTED", "Other", "");
        assert_eq!(c.classify(&note), MessageClass::Ambiguous);
        assert_eq!(
            c.classify(&msg("VSC PERIOD STARTED", "", "")),
            MessageClass::Start(InterventionKind::VirtualSafetyCar)
        );
    }

    #[test]
    fn test_keyword_mask_bits() {
        let set = KeywordSet::new(vec![
            ("debris".to_string(), vec!["DEBRIS".to_string()]),
            ("yellow".to_string(), vec!["YELLOW".to_string()]),
            ("red".to_string(), vec!["RED FLAG".to_string()]),
        ])
        .unwrap();

        assert_eq!(set.mask("Double yellow in sector 2, debris on track"), 0b011);
        assert_eq!(set.mask("RED  FLAG"), 0b100);
        assert_eq!(set.mask("REDFLAGGED"), 0);
        assert_eq!(set.len(), 3);
    }
}
