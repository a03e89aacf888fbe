//! Fuzzy text ranking and default result ordering.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

/// Per-field score multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankWeights {
    /// Program title.
    pub title: f64,
    /// Partner title.
    pub partner: f64,
    /// Any other searchable text.
    pub other: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            title: 3.0,
            partner: 2.0,
            other: 1.0,
        }
    }
}

/// Which weight a piece of searchable text carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextRole {
    Title,
    Partner,
    Other,
}

impl RankWeights {
    pub fn weight(&self, role: TextRole) -> f64 {
        match role {
            TextRole::Title => self.title,
            TextRole::Partner => self.partner,
            TextRole::Other => self.other,
        }
    }
}

/// Searchable text gathered for one result.
#[derive(Debug, Clone, Default)]
pub struct SearchDocument {
    parts: Vec<(TextRole, String)>,
}

impl SearchDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: TextRole, text: impl Into<String>) {
        let text = text.into();
        if !text.trim().is_empty() {
            self.parts.push((role, text));
        }
    }
}

/// Lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Similarity of `query` to `text` in `0.0..=1.0`.
///
/// A literal substring hit scores 1.0. Otherwise each query token takes
/// its best Jaro-Winkler match among the text's tokens and the mean is
/// returned.
pub fn similarity(query: &str, text: &str) -> f64 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let text_tokens = tokenize(text);
    if text_tokens.is_empty() {
        return 0.0;
    }
    if text_tokens.join(" ").contains(&query_tokens.join(" ")) {
        return 1.0;
    }

    let total: f64 = query_tokens
        .iter()
        .map(|q| {
            text_tokens
                .iter()
                .map(|t| jaro_winkler(q, t))
                .fold(0.0, f64::max)
        })
        .sum();
    total / query_tokens.len() as f64
}

/// Weighted score of `doc` against `query`, or `None` when no part reaches
/// `threshold`.
///
/// The score is the best `similarity × weight` among parts at or above the
/// threshold, so a title hit outranks an equally good partner hit.
pub fn score(query: &str, doc: &SearchDocument, weights: &RankWeights, threshold: f64) -> Option<f64> {
    doc.parts
        .iter()
        .filter_map(|(role, text)| {
            let sim = similarity(query, text);
            (sim >= threshold).then(|| sim * weights.weight(*role))
        })
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))))
}

/// Ordering for unranked results: earliest upcoming start first, results
/// without one last.
pub fn compare_upcoming(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Ordering for ranked results: higher score first.
pub fn compare_scores(a: Option<f64>, b: Option<f64>) -> Ordering {
    let a = a.unwrap_or(f64::NEG_INFINITY);
    let b = b.unwrap_or(f64::NEG_INFINITY);
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(parts: &[(TextRole, &str)]) -> SearchDocument {
        let mut d = SearchDocument::new();
        for (role, text) in parts {
            d.push(*role, *text);
        }
        d
    }

    #[test]
    fn substring_is_exact_match() {
        assert_eq!(similarity("robot", "Junior Robotics Lab"), 1.0);
        assert_eq!(similarity("junior robotics", "Junior Robotics Lab"), 1.0);
    }

    #[test]
    fn typos_score_high_unrelated_low() {
        assert!(similarity("robotcs", "Robotics") > 0.9);
        assert!(similarity("pottery", "Robotics") < 0.8);
        assert_eq!(similarity("", "Robotics"), 0.0);
        assert_eq!(similarity("robot", "   "), 0.0);
    }

    #[test]
    fn title_outweighs_partner() {
        let weights = RankWeights::default();
        let title = doc(&[(TextRole::Title, "Chess Club")]);
        let partner = doc(&[(TextRole::Partner, "Chess Club")]);
        let t = score("chess", &title, &weights, 0.8).unwrap();
        let p = score("chess", &partner, &weights, 0.8).unwrap();
        assert!(t > p);
    }

    #[test]
    fn below_threshold_is_excluded() {
        let weights = RankWeights::default();
        let d = doc(&[(TextRole::Title, "Pottery"), (TextRole::Other, "Clay")]);
        assert_eq!(score("robotics", &d, &weights, 0.8), None);
        assert_eq!(score("robotics", &SearchDocument::new(), &weights, 0.8), None);
    }

    #[test]
    fn upcoming_nulls_last() {
        let d1 = NaiveDate::from_ymd_opt(2025, 6, 1);
        let d2 = NaiveDate::from_ymd_opt(2025, 7, 1);
        let mut dates = vec![None, d2, d1];
        dates.sort_by(|a, b| compare_upcoming(*a, *b));
        assert_eq!(dates, vec![d1, d2, None]);
    }

    #[test]
    fn scores_descend() {
        let mut scores = vec![Some(1.0), Some(3.0), None, Some(2.0)];
        scores.sort_by(|a, b| compare_scores(*a, *b));
        assert_eq!(scores, vec![Some(3.0), Some(2.0), Some(1.0), None]);
    }
}
