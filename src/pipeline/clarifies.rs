use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::{ClarifiesStepRecord, ObjectionEvent, Resolution};
use crate::pipeline::objection::{self, DetectedObjection, ObjectionCategory};
use crate::pipeline::sentiment::{self, SentimentLabel, SentimentReading};

/// Word count above which a turn calls for active listening.
pub const DEFAULT_LONG_MESSAGE_WORDS: usize = 15;

/// CLARIFIES sales-conversation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClarifiesStep {
    #[serde(rename = "C")]
    Concern,
    #[serde(rename = "L")]
    Listen,
    #[serde(rename = "A")]
    Acknowledge,
    #[serde(rename = "R")]
    Respond,
    #[serde(rename = "I")]
    Inform,
    #[serde(rename = "F")]
    Find,
    #[serde(rename = "I2")]
    Involve,
    #[serde(rename = "E")]
    Ensure,
    #[serde(rename = "S")]
    Seal,
}

impl ClarifiesStep {
    pub fn code(self) -> &'static str {
        match self {
            ClarifiesStep::Concern => "C",
            ClarifiesStep::Listen => "L",
            ClarifiesStep::Acknowledge => "A",
            ClarifiesStep::Respond => "R",
            ClarifiesStep::Inform => "I",
            ClarifiesStep::Find => "F",
            ClarifiesStep::Involve => "I2",
            ClarifiesStep::Ensure => "E",
            ClarifiesStep::Seal => "S",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ClarifiesStep::Concern => "Concern",
            ClarifiesStep::Listen => "Listen",
            ClarifiesStep::Acknowledge => "Acknowledge",
            ClarifiesStep::Respond => "Respond",
            ClarifiesStep::Inform => "Inform",
            ClarifiesStep::Find => "Find",
            ClarifiesStep::Involve => "Involve",
            ClarifiesStep::Ensure => "Ensure",
            ClarifiesStep::Seal => "Seal",
        }
    }

    /// Step that follows when nothing in the turn demands otherwise.
    pub fn default_next(self) -> Self {
        match self {
            ClarifiesStep::Concern => ClarifiesStep::Listen,
            ClarifiesStep::Listen => ClarifiesStep::Acknowledge,
            ClarifiesStep::Acknowledge => ClarifiesStep::Respond,
            ClarifiesStep::Respond => ClarifiesStep::Inform,
            ClarifiesStep::Inform => ClarifiesStep::Find,
            ClarifiesStep::Find => ClarifiesStep::Involve,
            ClarifiesStep::Involve => ClarifiesStep::Ensure,
            ClarifiesStep::Ensure => ClarifiesStep::Seal,
            ClarifiesStep::Seal => ClarifiesStep::Concern,
        }
    }
}

impl fmt::Display for ClarifiesStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDecision {
    pub next: ClarifiesStep,
    pub reasoning: String,
}

/// Choose the next step for one customer turn. First matching rule wins:
/// objection, question, negative sentiment, positive close, long message,
/// then the default progression.
pub fn next_step(
    current: ClarifiesStep,
    text: &str,
    objection: Option<ObjectionCategory>,
    sentiment: &SentimentReading,
    long_message_words: usize,
) -> StepDecision {
    if let Some(category) = objection {
        return StepDecision {
            next: ClarifiesStep::Concern,
            reasoning: format!(
                "New objection detected ({category}); returning to Concern to surface it."
            ),
        };
    }

    if text.contains('?') {
        return StepDecision {
            next: ClarifiesStep::Inform,
            reasoning: "Customer asked a question; moving to Inform to answer it.".to_string(),
        };
    }

    if sentiment.leans_negative() {
        return StepDecision {
            next: ClarifiesStep::Acknowledge,
            reasoning: "Customer sentiment is negative; acknowledging before responding."
                .to_string(),
        };
    }

    if sentiment.label == SentimentLabel::Positive
        && matches!(
            current,
            ClarifiesStep::Inform | ClarifiesStep::Find | ClarifiesStep::Ensure
        )
    {
        return StepDecision {
            next: ClarifiesStep::Seal,
            reasoning: format!("Customer is positive during {}; ready to close.", current.name()),
        };
    }

    let word_count = sentiment::words(text).count();
    if word_count > long_message_words {
        return StepDecision {
            next: ClarifiesStep::Listen,
            reasoning: format!("Long message ({word_count} words); active listening required."),
        };
    }

    let next = current.default_next();
    StepDecision {
        next,
        reasoning: format!("Natural progression from {} to {}.", current.name(), next.name()),
    }
}

/// Everything learned from one customer turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnInsight {
    pub sentiment: SentimentReading,
    pub objection: Option<ObjectionEvent>,
    pub step: ClarifiesStepRecord,
    /// Pending objections considered resolved by this turn.
    pub resolved_objections: u32,
}

/// Per-call CLARIFIES state: current step, step sequence, open objections.
#[derive(Debug)]
pub struct ClarifiesTracker {
    current: ClarifiesStep,
    sequence: u32,
    pending_objections: u32,
    long_message_words: usize,
}

impl ClarifiesTracker {
    pub fn new(long_message_words: usize) -> Self {
        Self {
            current: ClarifiesStep::Concern,
            sequence: 0,
            pending_objections: 0,
            long_message_words,
        }
    }

    pub fn current(&self) -> ClarifiesStep {
        self.current
    }

    /// Classify a customer turn and advance the step machine. Empty turns are
    /// not classified and return `None`.
    pub fn observe_customer_turn(&mut self, text: &str) -> Option<TurnInsight> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let reading = sentiment::analyze(text);
        let detected: Option<DetectedObjection> = objection::detect(text);
        let decision = next_step(
            self.current,
            text,
            detected.map(|d| d.category),
            &reading,
            self.long_message_words,
        );

        let objection = detected.map(|d| ObjectionEvent {
            category: d.category,
            text: text.to_string(),
            confidence: d.confidence,
            resolution: Resolution::Pending,
            step: self.current,
            detected_at: Utc::now(),
        });

        let resolved_objections = if objection.is_some() {
            self.pending_objections += 1;
            0
        } else if reading.label == SentimentLabel::Positive {
            std::mem::take(&mut self.pending_objections)
        } else {
            0
        };

        self.sequence += 1;
        self.current = decision.next;

        Some(TurnInsight {
            sentiment: reading,
            objection,
            step: ClarifiesStepRecord {
                step: decision.next,
                sequence: self.sequence,
                effectiveness: (reading.score() + 1.0) / 2.0,
                reasoning: decision.reasoning,
                recorded_at: Utc::now(),
            },
            resolved_objections,
        })
    }
}
