use crate::model::{ConversationTurn, EmotionScores, QaPair, Role};

/// Per-call transcript buffer.
///
/// A transcript turn is held back until its prosody scores arrive (or the
/// next turn starts), so emotion enrichment happens before the turn is
/// persisted and never mutates a stored turn.
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Vec<ConversationTurn>,
    pending: Option<ConversationTurn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new turn. Returns the previous pending turn, now final.
    pub fn begin(&mut self, role: Role, text: impl Into<String>) -> Option<ConversationTurn> {
        let previous = self.flush();
        self.pending = Some(ConversationTurn::new(role, text));
        previous
    }

    /// Attach emotion scores to the pending turn when the role matches and
    /// return it as final. Scores for any other role are not attached.
    pub fn enrich(&mut self, role: Role, scores: EmotionScores) -> Option<ConversationTurn> {
        match &mut self.pending {
            Some(turn) if turn.role == role => {
                turn.emotions = Some(scores);
                self.flush()
            }
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<ConversationTurn> {
        let turn = self.pending.take()?;
        self.turns.push(turn.clone());
        Some(turn)
    }

    /// Attach the classified sentiment to the last final turn.
    pub fn set_last_sentiment(&mut self, turn: &ConversationTurn) {
        if let Some(last) = self.turns.last_mut() {
            last.sentiment = turn.sentiment;
        }
    }

    #[cfg(test)]
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn customer_messages(&self) -> Vec<&str> {
        self.messages(Role::Customer)
    }

    #[cfg(test)]
    pub fn agent_messages(&self) -> Vec<&str> {
        self.messages(Role::Agent)
    }

    fn messages(&self, role: Role) -> Vec<&str> {
        self.turns
            .iter()
            .filter(|t| t.role == role)
            .map(|t| t.text.as_str())
            .collect()
    }

    /// Pair each customer utterance with the agent turn that answers it.
    /// Consecutive customer turns are joined into one question.
    pub fn qa_pairs(&self) -> Vec<QaPair> {
        let mut pairs = Vec::new();
        let mut question: Option<(String, Option<EmotionScores>)> = None;

        for turn in self.turns.iter().filter(|t| !t.text.trim().is_empty()) {
            match turn.role {
                Role::Customer => {
                    question = Some(match question.take() {
                        Some((text, emotions)) => (
                            format!("{text} {}", turn.text.trim()),
                            turn.emotions.clone().or(emotions),
                        ),
                        None => (turn.text.trim().to_string(), turn.emotions.clone()),
                    });
                }
                Role::Agent => {
                    if let Some((text, emotions)) = question.take() {
                        pairs.push(QaPair {
                            question: text,
                            answer: turn.text.trim().to_string(),
                            emotions,
                        });
                    }
                }
                Role::System => {}
            }
        }
        pairs
    }
}
