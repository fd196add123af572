//! Fuzzy candidate scoring and selection.

use crate::record::Record;
use async_trait::async_trait;
use serde::Serialize;

/// Outcome of a lookup against a secondary source. Absence and failure are
/// kept apart so callers can count them separately.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Error(String),
}

impl<T> Lookup<T> {
    pub fn is_error(&self) -> bool {
        matches!(self, Lookup::Error(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            _ => None,
        }
    }
}

impl Lookup<Vec<Candidate>> {
    /// Build from a candidate list; an empty list is `NotFound`.
    pub fn from_candidates(candidates: Vec<Candidate>) -> Self {
        if candidates.is_empty() {
            Lookup::NotFound
        } else {
            Lookup::Found(candidates)
        }
    }

    /// Candidates to score. Failures count as zero candidates.
    pub fn into_candidates(self) -> Vec<Candidate> {
        self.found().unwrap_or_default()
    }
}

/// A record returned by a secondary source together with the text it is
/// scored on and whether it carries the institutional trust signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub title: String,
    pub trusted: bool,
    pub record: Record,
}

/// Scored candidate for one left-side key.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub left_key: String,
    pub candidate: Candidate,
    pub score: f64,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FuzzyConfig {
    pub threshold: f64,
    pub trust_bonus: f64,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            trust_bonus: 0.05,
        }
    }
}

/// Secondary source queried by the fuzzy pass.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Candidates for a free-text query, in the order the source returns them.
    async fn lookup(&self, query: &str) -> Lookup<Vec<Candidate>>;
}

/// Normalized Levenshtein similarity of the lowercased, trimmed strings.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    strsim::normalized_levenshtein(&a, &b)
}

/// Score every candidate against `left_title`, bonus included.
pub fn score_candidates(left_title: &str, candidates: &[Candidate], config: &FuzzyConfig) -> Vec<f64> {
    candidates
        .iter()
        .map(|c| {
            let base = similarity_ratio(left_title, &c.title);
            if c.trusted {
                base + config.trust_bonus
            } else {
                base
            }
        })
        .collect()
}

/// Highest score wins; on equal scores the earlier candidate is kept.
/// Returns the winner's index and score.
pub fn best_index(scores: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((idx, score)),
        }
    }
    best
}

/// Pick the best candidate from pre-computed scores. `None` only when there
/// are no candidates; a below-threshold winner comes back with
/// `accepted == false`.
pub fn select_best_scored(
    left_key: &str,
    candidates: Vec<Candidate>,
    scores: &[f64],
    threshold: f64,
) -> Option<MatchCandidate> {
    let (idx, score) = best_index(&scores[..scores.len().min(candidates.len())])?;
    let candidate = candidates.into_iter().nth(idx)?;
    Some(MatchCandidate {
        left_key: left_key.to_string(),
        candidate,
        score,
        accepted: score >= threshold,
    })
}

/// Score and select in one step.
pub fn select_best(left_key: &str, left_title: &str, candidates: Vec<Candidate>, config: &FuzzyConfig) -> Option<MatchCandidate> {
    let scores = score_candidates(left_title, &candidates, config);
    select_best_scored(left_key, candidates, &scores, config.threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, trusted: bool) -> Candidate {
        Candidate {
            title: title.to_string(),
            trusted,
            record: Record::new("openalex", title),
        }
    }

    #[test]
    fn test_similarity_ratio_bounds() {
        assert!((similarity_ratio("Deep Learning", " deep learning ") - 1.0).abs() < 1e-9);
        assert!(similarity_ratio("abc", "xyz") < 0.01);
        let r = similarity_ratio("Deep Learning for X", "Deep Learning for Y");
        assert!(r > 0.9 && r < 1.0);
    }

    #[test]
    fn test_accepts_highest_above_threshold() {
        let candidates = vec![candidate("a", false), candidate("b", false), candidate("c", false)];
        let best = select_best_scored("Deep Learning for X", candidates, &[0.95, 0.82, 0.60], 0.8).unwrap();
        assert!(best.accepted);
        assert_eq!(best.candidate.title, "a");
        assert!((best.score - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_below_threshold() {
        let candidates = vec![candidate("a", false), candidate("b", false)];
        let best = select_best_scored("Deep Learning for X", candidates, &[0.75, 0.70], 0.8).unwrap();
        assert!(!best.accepted);
        assert_eq!(best.candidate.title, "a");
    }

    #[test]
    fn test_ties_go_to_first_candidate() {
        let candidates = vec![candidate("first", false), candidate("second", false)];
        for _ in 0..5 {
            let best = select_best_scored("k", candidates.clone(), &[0.9, 0.9], 0.8).unwrap();
            assert_eq!(best.candidate.title, "first");
        }
        assert_eq!(best_index(&[0.5, 0.9, 0.9, 0.1]), Some((1, 0.9)));
        assert_eq!(best_index(&[]), None);
    }

    #[test]
    fn test_trust_bonus_can_tip_the_balance() {
        let config = FuzzyConfig {
            threshold: 0.9,
            trust_bonus: 0.05,
        };
        let title = "Robust estimation of tidal flows";
        let near = "Robust estimation of tidal flow";
        let plain = select_best("k", title, vec![candidate(near, false)], &config).unwrap();
        let trusted = select_best("k", title, vec![candidate(near, true)], &config).unwrap();
        assert!((trusted.score - plain.score - 0.05).abs() < 1e-9);

        let picked = select_best("k", title, vec![candidate(near, false), candidate(near, true)], &config).unwrap();
        assert!(picked.candidate.trusted);
    }

    #[test]
    fn test_lookup_variants() {
        assert_eq!(Lookup::from_candidates(vec![]), Lookup::NotFound);
        assert!(Lookup::<Vec<Candidate>>::Error("boom".into()).into_candidates().is_empty());
        assert!(Lookup::<Vec<Candidate>>::Error("boom".into()).is_error());
        assert_eq!(
            Lookup::from_candidates(vec![candidate("a", false)]).into_candidates().len(),
            1
        );
    }
}
