//! The chat/message store the engine writes into. The tree of messages is
//! owned elsewhere; the engine only pushes partial updates by id.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{ChatStreamError, CoreResult};
use crate::model::{Message, MessageUpdate};

pub trait MessageStore: Send + Sync {
    fn update_message(&self, id: &str, update: MessageUpdate) -> CoreResult<()>;
    fn get_message(&self, id: &str) -> Option<Message>;
}

/// Process-local store. Updating an unknown id creates the message.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<HashMap<String, Message>>,
    updates: Mutex<HashMap<String, usize>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, message: Message) {
        self.lock_messages().insert(message.id.clone(), message);
    }

    /// Number of updates received for `id` since creation.
    pub fn update_count(&self, id: &str) -> usize {
        self.updates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn lock_messages(&self) -> std::sync::MutexGuard<'_, HashMap<String, Message>> {
        self.messages.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl MessageStore for InMemoryMessageStore {
    fn update_message(&self, id: &str, update: MessageUpdate) -> CoreResult<()> {
        if id.is_empty() {
            return Err(ChatStreamError::Validation("message id is empty".into()));
        }
        self.lock_messages()
            .entry(id.to_string())
            .or_insert_with(|| Message {
                id: id.to_string(),
                ..Default::default()
            })
            .apply(update);
        *self
            .updates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(id.to_string())
            .or_default() += 1;
        Ok(())
    }

    fn get_message(&self, id: &str) -> Option<Message> {
        self.lock_messages().get(id).cloned()
    }
}
