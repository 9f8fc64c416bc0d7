use serde::{Deserialize, Serialize};
use std::fmt;
use strsim::jaro_winkler;

/// Deterministic matcher for table and column names the model may have
/// misspelled, re-cased or pluralized.
#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    /// Similarity threshold (0.0-1.0) a single candidate must reach
    pub similarity_threshold: f64,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.90,
        }
    }
}

/// Why a reference was mapped onto a different schema name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRationale {
    CaseInsensitive,
    SingularPlural,
    Similarity,
    /// Exact name on a table the intent did not list but a join reaches
    JoinableTable,
}

impl fmt::Display for MatchRationale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MatchRationale::CaseInsensitive => "case-insensitive match",
            MatchRationale::SingularPlural => "singular/plural match",
            MatchRationale::Similarity => "closest name above similarity threshold",
            MatchRationale::JoinableTable => "exact name on a table reachable by join",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The reference is a schema name as written
    Exact(String),
    Substitute {
        candidate: String,
        score: f64,
        rationale: MatchRationale,
    },
    /// Several candidates are equally plausible
    Ambiguous(Vec<String>),
    NoMatch,
}

impl FuzzyMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
        }
    }

    /// Lowercase, unify separators to `_`, drop other punctuation.
    pub fn normalize_string(&self, s: &str) -> String {
        let mut normalized = String::with_capacity(s.len());
        for c in s.trim().to_lowercase().chars() {
            if c.is_alphanumeric() {
                normalized.push(c);
            } else if (c.is_whitespace() || matches!(c, '-' | '_' | '.'))
                && !normalized.ends_with('_')
            {
                normalized.push('_');
            }
        }
        normalized.trim_matches('_').to_string()
    }

    /// Fold the last word of an identifier to its singular form.
    pub fn singularize(word: &str) -> String {
        let (head, last) = match word.rfind('_') {
            Some(idx) => (&word[..=idx], &word[idx + 1..]),
            None => ("", word),
        };
        let singular = if last.len() > 3 && last.ends_with("ies") {
            format!("{}y", &last[..last.len() - 3])
        } else if ["ches", "shes", "sses", "xes"].iter().any(|s| last.ends_with(s)) {
            last[..last.len() - 2].to_string()
        } else if last.len() > 1 && last.ends_with('s') && !last.ends_with("ss") {
            last[..last.len() - 1].to_string()
        } else {
            last.to_string()
        };
        format!("{}{}", head, singular)
    }

    fn canonical(&self, s: &str) -> String {
        Self::singularize(&self.normalize_string(s))
    }

    /// Similarity between two names (0.0-1.0, higher = more similar).
    ///
    /// Jaro-Winkler on the canonical forms, with a small bonus when one name
    /// contains the other.
    pub fn similarity(&self, s1: &str, s2: &str) -> f64 {
        let norm1 = self.canonical(s1);
        let norm2 = self.canonical(s2);
        if norm1.is_empty() || norm2.is_empty() {
            return 0.0;
        }
        if norm1 == norm2 {
            return 1.0;
        }

        let jw_score = jaro_winkler(&norm1, &norm2);

        let is_substring = norm1.contains(&norm2) || norm2.contains(&norm1);
        let substring_bonus = if is_substring {
            let len_diff = (norm1.len() as f64 - norm2.len() as f64).abs();
            let max_len = norm1.len().max(norm2.len()) as f64;
            (1.0 - (len_diff / max_len)) * 0.1
        } else {
            0.0
        };

        (jw_score + substring_bonus).min(1.0)
    }

    /// Resolve `target` against `candidates`.
    ///
    /// Tier 1 accepts a unique case-insensitive or singular/plural equal name.
    /// Tier 2 accepts the only candidate at or above the threshold; two or
    /// more candidates above it are ambiguous. Candidate order never changes
    /// the outcome.
    pub fn best_match<'a, I>(&self, target: &str, candidates: I) -> MatchOutcome
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut candidates: Vec<&str> = candidates.into_iter().collect();
        candidates.sort_unstable();
        candidates.dedup();

        if candidates.contains(&target) {
            return MatchOutcome::Exact(target.to_string());
        }

        let lowered = target.to_lowercase();
        let case_matches: Vec<&str> = candidates
            .iter()
            .copied()
            .filter(|c| c.to_lowercase() == lowered)
            .collect();
        if let Some(outcome) = Self::unique(case_matches, MatchRationale::CaseInsensitive) {
            return outcome;
        }

        let canonical = self.canonical(target);
        let plural_matches: Vec<&str> = candidates
            .iter()
            .copied()
            .filter(|c| self.canonical(c) == canonical)
            .collect();
        if let Some(outcome) = Self::unique(plural_matches, MatchRationale::SingularPlural) {
            return outcome;
        }

        let mut scored: Vec<(&str, f64)> = candidates
            .iter()
            .map(|c| (*c, self.similarity(target, c)))
            .filter(|(_, score)| *score >= self.similarity_threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        match scored.as_slice() {
            [] => MatchOutcome::NoMatch,
            [(candidate, score)] => MatchOutcome::Substitute {
                candidate: candidate.to_string(),
                score: *score,
                rationale: MatchRationale::Similarity,
            },
            many => MatchOutcome::Ambiguous(many.iter().map(|(c, _)| c.to_string()).collect()),
        }
    }

    fn unique(matches: Vec<&str>, rationale: MatchRationale) -> Option<MatchOutcome> {
        match matches.as_slice() {
            [] => None,
            [single] => Some(MatchOutcome::Substitute {
                candidate: single.to_string(),
                score: 1.0,
                rationale,
            }),
            many => Some(MatchOutcome::Ambiguous(
                many.iter().map(|c| c.to_string()).collect(),
            )),
        }
    }
}
