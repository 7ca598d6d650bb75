//! Sentiment scoring seam. The pipeline only consumes polarity scores; the
//! scorer itself is swappable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("scorer rejected text: {0}")]
    Rejected(String),
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
}

/// Maps review text to a polarity in `[-1.0, 1.0]`.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> Result<f64, ScoreError>;
}

/// Word weights for product reviews.
///
/// Values in `(0.0, 1.0]` are positive, in `[-1.0, 0.0)` negative.
const LEXICON: &[(&str, f64)] = &[
    ("love", 0.5),
    ("loved", 0.5),
    ("excellent", 0.5),
    ("perfect", 0.5),
    ("amazing", 0.5),
    ("best", 0.5),
    ("great", 0.4),
    ("recommend", 0.4),
    ("happy", 0.4),
    ("sturdy", 0.3),
    ("good", 0.3),
    ("works", 0.2),
    ("easy", 0.2),
    ("quality", 0.2),
    ("nice", 0.3),
    ("worst", -0.6),
    ("terrible", -0.6),
    ("awful", -0.6),
    ("defective", -0.6),
    ("broken", -0.5),
    ("broke", -0.5),
    ("useless", -0.5),
    ("waste", -0.5),
    ("refund", -0.4),
    ("returned", -0.4),
    ("disappointed", -0.4),
    ("flimsy", -0.4),
    ("poor", -0.4),
    ("bad", -0.4),
    ("cheap", -0.3),
    ("stopped", -0.3),
];

const NEGATIONS: &[&str] = &["not", "no", "never", "don't", "didn't", "doesn't", "isn't", "wasn't"];

/// Lexicon scorer: sums word weights, flips the sign of a weighted word that
/// directly follows a negation, and clamps to `[-1.0, 1.0]`. Empty text scores `0.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconScorer;

impl SentimentScorer for LexiconScorer {
    fn score(&self, text: &str) -> Result<f64, ScoreError> {
        Ok(lexicon_score(text))
    }
}

pub fn lexicon_score(text: &str) -> f64 {
    let mut score = 0.0_f64;
    let mut negate = false;
    for word in text.split_whitespace() {
        let w = word
            .trim_matches(|c: char| !c.is_alphabetic() && c != '\'')
            .to_lowercase();
        if NEGATIONS.contains(&w.as_str()) {
            negate = true;
            continue;
        }
        if let Some(&(_, weight)) = LEXICON.iter().find(|(lex, _)| *lex == w) {
            score += if negate { -weight } else { weight };
        }
        negate = false;
    }
    score.clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_unknown_text_is_neutral() {
        assert_eq!(lexicon_score(""), 0.0);
        assert_eq!(lexicon_score("   "), 0.0);
        assert_eq!(lexicon_score("arrived on tuesday"), 0.0);
    }

    #[test]
    fn polarity_follows_lexicon() {
        assert!(lexicon_score("Great blender, would recommend!") > 0.0);
        assert!(lexicon_score("Arrived broken. Total waste.") < 0.0);
    }

    #[test]
    fn negation_flips_the_next_weighted_word() {
        let score = lexicon_score("not good");
        assert!(score < 0.0, "expected negative score, got {score}");
    }

    #[test]
    fn scores_are_clamped() {
        assert_eq!(lexicon_score("love love love perfect amazing best"), 1.0);
        assert_eq!(lexicon_score("worst terrible awful defective broken"), -1.0);
    }
}
