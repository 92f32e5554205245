//! Bounded conversation history

use std::collections::VecDeque;

use super::ChatMessage;

/// System prompt plus the most recent user/assistant exchanges
///
/// Only completed turns are recorded. When the cap is exceeded the oldest
/// exchange is dropped as a pair; the system prompt is never trimmed.
#[derive(Debug, Clone)]
pub struct Conversation {
    system_prompt: Option<String>,
    messages: VecDeque<ChatMessage>,
    max_messages: usize,
}

impl Conversation {
    /// Create a history holding at most `max_messages` non-system messages
    ///
    /// An empty system prompt is omitted from requests.
    #[must_use]
    pub fn new(system_prompt: impl Into<String>, max_messages: usize) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            system_prompt: (!system_prompt.trim().is_empty()).then_some(system_prompt),
            messages: VecDeque::new(),
            max_messages: max_messages.max(2),
        }
    }

    /// Record a completed exchange
    pub fn push_exchange(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.messages.push_back(ChatMessage::user(user));
        self.messages.push_back(ChatMessage::assistant(assistant));

        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
            self.messages.pop_front();
        }
    }

    /// Messages to prepend to the next request
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.system_prompt
            .iter()
            .map(ChatMessage::system)
            .chain(self.messages.iter().cloned())
            .collect()
    }

    /// Number of recorded non-system messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Forget every exchange, keeping the system prompt
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn test_snapshot_starts_with_system_prompt() {
        let mut history = Conversation::new("be brief", 10);
        history.push_exchange("hi", "hello");

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0], ChatMessage::system("be brief"));
        assert_eq!(snapshot[1], ChatMessage::user("hi"));
        assert_eq!(snapshot[2], ChatMessage::assistant("hello"));
    }

    #[test]
    fn test_oldest_pair_trimmed_first() {
        let mut history = Conversation::new("sys", 4);
        history.push_exchange("one", "1");
        history.push_exchange("two", "2");
        history.push_exchange("three", "3");

        assert_eq!(history.len(), 4);
        let snapshot = history.snapshot();
        assert_eq!(snapshot[0].role, Role::System);
        assert_eq!(snapshot[1], ChatMessage::user("two"));
        assert_eq!(snapshot[4], ChatMessage::assistant("3"));
    }

    #[test]
    fn test_empty_system_prompt_omitted() {
        let mut history = Conversation::new("  ", 4);
        assert!(history.snapshot().is_empty());

        history.push_exchange("q", "a");
        history.clear();
        assert!(history.is_empty());
    }
}
