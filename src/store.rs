//! In-memory conversation store.
//!
//! Holds every conversation record plus the "active" pointer. No I/O happens
//! here; every mutation is synchronous and bumps [`SessionStore::revision`]
//! so whatever renders the state can tell it changed.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_CONVERSATION_NAME: &str = "New Chat";

static NEXT_CONVERSATION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque conversation handle. Allocated from a process-wide counter and
/// never reused, even after the conversation is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(u64);

impl ConversationId {
    fn next() -> Self {
        Self(NEXT_CONVERSATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Data URI of an attached image, kept for display only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>, image: Option<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            image: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    id: ConversationId,
    name: String,
    model: String,
    temperature: f64,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

/// Rejects NaN and anything outside `[0.0, 1.0]`.
pub fn validate_temperature(value: f64) -> Result<f64, StoreError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(StoreError::Validation(format!(
            "temperature {} outside [0, 1]",
            value
        )))
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    // Creation order doubles as iteration and fallover order.
    conversations: Vec<Conversation>,
    active: Option<ConversationId>,
    revision: u64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with one active conversation, as at process start.
    pub fn with_default(model: &str, temperature: f64) -> Result<Self, StoreError> {
        let mut store = Self::new();
        let id = store.create(model, temperature)?;
        store.activate(id)?;
        Ok(store)
    }

    pub fn create(&mut self, model: &str, temperature: f64) -> Result<ConversationId, StoreError> {
        let temperature = validate_temperature(temperature)?;
        let id = ConversationId::next();
        self.conversations.push(Conversation {
            id,
            name: DEFAULT_CONVERSATION_NAME.to_string(),
            model: model.to_string(),
            temperature,
            messages: Vec::new(),
        });
        self.touch();
        tracing::debug!(%id, model, temperature, "conversation created");
        Ok(id)
    }

    pub fn rename(&mut self, id: ConversationId, name: &str) -> Result<(), StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation(
                "conversation name must not be empty".to_string(),
            ));
        }
        self.get_mut(id)?.name = name.to_string();
        self.touch();
        Ok(())
    }

    pub fn set_temperature(&mut self, id: ConversationId, value: f64) -> Result<(), StoreError> {
        let value = validate_temperature(value)?;
        self.get_mut(id)?.temperature = value;
        self.touch();
        Ok(())
    }

    pub fn set_model(&mut self, id: ConversationId, model: &str) -> Result<(), StoreError> {
        self.get_mut(id)?.model = model.to_string();
        self.touch();
        Ok(())
    }

    /// Appends to the end of the history and returns the new length.
    pub fn append(&mut self, id: ConversationId, message: Message) -> Result<usize, StoreError> {
        let conversation = self.get_mut(id)?;
        conversation.messages.push(message);
        let len = conversation.messages.len();
        self.touch();
        Ok(len)
    }

    /// Removes the conversation and reports whether it was the active one.
    /// When it was, the first remaining conversation becomes active, or none
    /// if the store is now empty.
    pub fn delete(&mut self, id: ConversationId) -> Result<bool, StoreError> {
        let index = self
            .conversations
            .iter()
            .position(|c| c.id == id)
            .ok_or(StoreError::NotFound(id))?;
        self.conversations.remove(index);

        let was_active = self.active == Some(id);
        if was_active {
            self.active = self.conversations.first().map(|c| c.id);
        }
        self.touch();
        tracing::debug!(%id, was_active, next_active = ?self.active, "conversation deleted");
        Ok(was_active)
    }

    pub fn activate(&mut self, id: ConversationId) -> Result<(), StoreError> {
        self.get(id)?;
        if self.active != Some(id) {
            self.active = Some(id);
            self.touch();
        }
        Ok(())
    }

    pub fn active_id(&self) -> Option<ConversationId> {
        self.active
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active.and_then(|id| self.get(id).ok())
    }

    pub fn get(&self, id: ConversationId) -> Result<&Conversation, StoreError> {
        self.conversations
            .iter()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.conversations.iter().any(|c| c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Monotonic change counter, bumped on every successful mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn get_mut(&mut self, id: ConversationId) -> Result<&mut Conversation, StoreError> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}
