//! Conversation state
//!
//! Bounded, append-only history of question/answer turns for one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Role of a turn's author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A single turn in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
}

impl Turn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// History capped at `capacity` turns; the oldest turn is evicted first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    capacity: usize,
    turns: VecDeque<Turn>,
}

impl ConversationState {
    pub fn new(capacity: usize) -> Self {
        Self {
            created_at: Utc::now(),
            updated_at: Utc::now(),
            capacity,
            turns: VecDeque::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, turn: Turn) {
        if self.capacity == 0 {
            return;
        }
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
        self.updated_at = Utc::now();
    }

    /// The most recent `n` turns, oldest first.
    pub fn window(&self, n: usize) -> Vec<Turn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.updated_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Plain transcript, oldest first.
    pub fn formatted(&self) -> String {
        let mut context = String::new();
        for turn in &self.turns {
            let role = match turn.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
            };
            context.push_str(&format!("{}: {}\n", role, turn.content));
        }
        context
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_TURNS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_most_recent_in_order() {
        let mut state = ConversationState::new(10);
        for i in 0..12 {
            state.append(Turn::user(format!("Question {}", i)));
        }

        let window = state.window(10);
        assert_eq!(window.len(), 10);
        let contents: Vec<String> = window.into_iter().map(|t| t.content).collect();
        let expected: Vec<String> = (2..12).map(|i| format!("Question {}", i)).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn test_reset_empties_window() {
        let mut state = ConversationState::default();
        state.append(Turn::user("What was the total spending?"));
        state.append(Turn::assistant("$89.59B"));
        assert_eq!(state.len(), 2);

        state.reset();
        assert!(state.window(10).is_empty());
        assert!(state.is_empty());
    }

    #[test]
    fn test_small_window_and_formatting() {
        let mut state = ConversationState::new(4);
        state.append(Turn::user("a"));
        state.append(Turn::assistant("b"));
        state.append(Turn::user("c"));

        let last_two: Vec<String> = state.window(2).into_iter().map(|t| t.content).collect();
        assert_eq!(last_two, vec!["b", "c"]);
        assert_eq!(state.window(50).len(), 3);
        assert!(state.formatted().starts_with("User: a\nAssistant: b\n"));
    }
}
