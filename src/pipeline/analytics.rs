use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::EmotionScores;

static WON_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    keyword_regex(&[
        "sign me up",
        "sign up",
        "let's do it",
        "let's go ahead",
        "go ahead",
        "deal",
        "buy",
        "purchase",
        "sounds good",
        "i'm in",
        "send me the contract",
    ])
});

static LOST_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    keyword_regex(&[
        "not interested",
        "no thanks",
        "no thank you",
        "don't call",
        "do not call",
        "remove me",
        "stop calling",
        "not for us",
        "never",
    ])
});

fn keyword_regex(words: &[&str]) -> Regex {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).expect("escaped keyword alternation")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentTrend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Won,
    Lost,
    FollowUp,
}

/// Tuning constants for the running aggregate.
#[derive(Debug, Clone, Copy)]
pub struct AnalyticsSettings {
    pub trend_threshold: f64,
    pub dominant_emotion_threshold: f64,
    pub outcome_window: usize,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            trend_threshold: 0.2,
            dominant_emotion_threshold: 0.5,
            outcome_window: 3,
        }
    }
}

/// Mutable per-call aggregate, upserted after every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningAnalytics {
    pub total_turns: u32,
    pub sentiment_samples: u32,
    pub sentiment_average: f64,
    pub sentiment_trend: SentimentTrend,
    #[serde(default)]
    pub dominant_emotion: Option<String>,
    pub total_objections: u32,
    pub resolved_objections: u32,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    pub updated_at: DateTime<Utc>,
}

impl RunningAnalytics {
    fn new() -> Self {
        Self {
            total_turns: 0,
            sentiment_samples: 0,
            sentiment_average: 0.0,
            sentiment_trend: SentimentTrend::Stable,
            dominant_emotion: None,
            total_objections: 0,
            resolved_objections: 0,
            outcome: None,
            updated_at: Utc::now(),
        }
    }
}

/// Builds the [`RunningAnalytics`] record lazily on the first turn.
#[derive(Debug)]
pub struct AnalyticsAggregator {
    record: Option<RunningAnalytics>,
    settings: AnalyticsSettings,
}

impl AnalyticsAggregator {
    pub fn new(settings: AnalyticsSettings) -> Self {
        Self {
            record: None,
            settings,
        }
    }

    pub fn snapshot(&self) -> Option<&RunningAnalytics> {
        self.record.as_ref()
    }

    fn record_mut(&mut self) -> &mut RunningAnalytics {
        let record = self.record.get_or_insert_with(RunningAnalytics::new);
        record.updated_at = Utc::now();
        record
    }

    pub fn record_turn(&mut self) {
        self.record_mut().total_turns += 1;
    }

    /// Fold one turn's sentiment score into the running mean.
    pub fn record_sentiment(&mut self, score: f64) {
        let threshold = self.settings.trend_threshold;
        let record = self.record_mut();
        let n = record.sentiment_samples as f64;
        record.sentiment_average = (record.sentiment_average * n + score) / (n + 1.0);
        record.sentiment_samples += 1;
        record.sentiment_trend = classify_trend(record.sentiment_average, threshold);
    }

    /// Update the dominant emotion when the top score clears the threshold.
    /// Returns whether the value changed.
    pub fn record_emotions(&mut self, scores: &EmotionScores) -> bool {
        let threshold = self.settings.dominant_emotion_threshold;
        let Some((label, score)) = top_emotion(scores) else {
            return false;
        };
        if score <= threshold {
            return false;
        }
        let record = self.record_mut();
        if record.dominant_emotion.as_deref() == Some(label) {
            return false;
        }
        record.dominant_emotion = Some(label.to_string());
        true
    }

    pub fn record_objection(&mut self) {
        self.record_mut().total_objections += 1;
    }

    pub fn record_resolved(&mut self, count: u32) {
        if count > 0 {
            self.record_mut().resolved_objections += count;
        }
    }

    /// Classify the call outcome from the last customer turns. Only at completion.
    pub fn finalize<S: AsRef<str>>(&mut self, customer_turns: &[S]) -> Outcome {
        let outcome = classify_outcome(customer_turns, self.settings.outcome_window);
        self.record_mut().outcome = Some(outcome);
        outcome
    }
}

pub fn classify_trend(average: f64, threshold: f64) -> SentimentTrend {
    if average > threshold {
        SentimentTrend::Improving
    } else if average < -threshold {
        SentimentTrend::Declining
    } else {
        SentimentTrend::Stable
    }
}

/// Won keywords are checked across the whole window before lost keywords.
pub fn classify_outcome<S: AsRef<str>>(customer_turns: &[S], window: usize) -> Outcome {
    let start = customer_turns.len().saturating_sub(window);
    let tail = &customer_turns[start..];

    if tail.iter().any(|t| WON_KEYWORDS.is_match(t.as_ref())) {
        Outcome::Won
    } else if tail.iter().any(|t| LOST_KEYWORDS.is_match(t.as_ref())) {
        Outcome::Lost
    } else {
        Outcome::FollowUp
    }
}

fn top_emotion(scores: &EmotionScores) -> Option<(&str, f64)> {
    scores
        .iter()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(k, v)| (k.as_str(), *v))
}
