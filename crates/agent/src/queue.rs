//! FIFO buffers for steering and follow-up messages.

use std::collections::VecDeque;
use turnloop_core::{AgentMessage, QueueMode};

/// A queue of messages waiting to be injected into a run.
#[derive(Debug, Clone, Default)]
pub struct MessageQueue {
    items: VecDeque<AgentMessage>,
    mode: QueueMode,
}

impl MessageQueue {
    pub fn new(mode: QueueMode) -> Self {
        Self {
            items: VecDeque::new(),
            mode,
        }
    }

    pub fn push(&mut self, message: AgentMessage) {
        self.items.push_back(message);
    }

    /// Take messages according to the drain mode: everything, or the oldest one.
    pub fn drain(&mut self) -> Vec<AgentMessage> {
        match self.mode {
            QueueMode::All => self.items.drain(..).collect(),
            QueueMode::OneAtATime => self.items.pop_front().into_iter().collect(),
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: QueueMode) {
        self.mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnloop_core::Message;

    fn queue_of(mode: QueueMode, texts: &[&str]) -> MessageQueue {
        let mut q = MessageQueue::new(mode);
        for t in texts {
            q.push(Message::user(*t).into());
        }
        q
    }

    #[test]
    fn all_mode_drains_everything_in_order() {
        let mut q = queue_of(QueueMode::All, &["a", "b", "c"]);
        let drained: Vec<String> = q.drain().iter().map(|m| m.text()).collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn one_at_a_time_drains_oldest_only() {
        let mut q = queue_of(QueueMode::OneAtATime, &["a", "b"]);
        assert_eq!(q.drain()[0].text(), "a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain()[0].text(), "b");
        assert!(q.drain().is_empty());
    }
}
