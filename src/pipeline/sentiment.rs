use std::collections::HashSet;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static POSITIVE_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "great", "good", "excellent", "love", "perfect", "interested", "yes", "sure",
        "awesome", "wonderful", "happy", "thanks", "thank", "helpful", "agree",
        "definitely", "absolutely", "fantastic", "amazing", "appreciate", "nice",
        "glad", "right", "exactly",
    ]
    .into_iter()
    .collect()
});

static NEGATIVE_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "bad", "terrible", "hate", "no", "never", "expensive", "problem", "issue",
        "worried", "concern", "concerned", "difficult", "frustrated", "angry",
        "annoyed", "disappointed", "unfortunately", "wrong", "awful", "confused",
        "waste", "cancel", "useless", "unhappy",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

/// Keyword counts for one turn plus the resulting label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentimentReading {
    pub label: SentimentLabel,
    pub positive_hits: usize,
    pub negative_hits: usize,
}

impl SentimentReading {
    /// Net polarity in [-1, 1]; 0 when no keyword matched.
    pub fn score(&self) -> f64 {
        let total = self.positive_hits + self.negative_hits;
        if total == 0 {
            return 0.0;
        }
        (self.positive_hits as f64 - self.negative_hits as f64) / total as f64
    }

    /// Negative keywords present and not outnumbered. A tie leans negative here
    /// even though the label itself is neutral.
    pub fn leans_negative(&self) -> bool {
        self.negative_hits > 0 && self.negative_hits >= self.positive_hits
    }
}

/// Count positive and negative keyword hits. Strictly more positive hits is
/// positive, strictly more negative is negative, anything else is neutral.
pub fn analyze(text: &str) -> SentimentReading {
    let mut positive_hits = 0;
    let mut negative_hits = 0;

    for word in words(text) {
        if POSITIVE_WORDS.contains(word.as_str()) {
            positive_hits += 1;
        } else if NEGATIVE_WORDS.contains(word.as_str()) {
            negative_hits += 1;
        }
    }

    let label = match positive_hits.cmp(&negative_hits) {
        std::cmp::Ordering::Greater => SentimentLabel::Positive,
        std::cmp::Ordering::Less => SentimentLabel::Negative,
        std::cmp::Ordering::Equal => SentimentLabel::Neutral,
    };

    SentimentReading {
        label,
        positive_hits,
        negative_hits,
    }
}

/// Lowercased words, keeping inner apostrophes ("don't").
pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| !w.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_more_positive_is_positive() {
        let r = analyze("Yes, that sounds great, thanks!");
        assert_eq!(r.label, SentimentLabel::Positive);
        assert_eq!(r.positive_hits, 3);
        assert!(r.score() > 0.0);
    }

    #[test]
    fn strictly_more_negative_is_negative() {
        let r = analyze("This is a terrible waste of my time");
        assert_eq!(r.label, SentimentLabel::Negative);
        assert!(r.leans_negative());
    }

    #[test]
    fn tie_is_neutral_but_leans_negative() {
        let r = analyze("good product but a real problem for us");
        assert_eq!(r.label, SentimentLabel::Neutral);
        assert_eq!(r.score(), 0.0);
        assert!(r.leans_negative());
    }

    #[test]
    fn no_keywords_is_neutral_and_not_negative() {
        let r = analyze("I am calling about the invoice");
        assert_eq!(r.label, SentimentLabel::Neutral);
        assert!(!r.leans_negative());
    }

    #[test]
    fn words_strip_punctuation() {
        let w: Vec<String> = words("Don't, STOP! 'quoted'").collect();
        assert_eq!(w, vec!["don't", "stop", "quoted"]);
    }
}
