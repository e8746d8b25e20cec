//! Orchestrates conversations, the pending input and the inference server.
//!
//! Sending is split in two phases. [`SessionController::begin_send`] runs
//! synchronously: it appends the user's message, clears the input and hands
//! back a [`PendingTurn`] tagged with a per-conversation sequence number.
//! [`SessionController::complete_turn`] applies the outcome once the network
//! call resolves. Everything between the two can run on another task while
//! the controller keeps serving other actions.

use crate::attachment::{AttachmentSlot, EncodedImage, SelectionTicket};
use crate::config::Config;
use crate::error::{ClientError, StoreError};
use crate::ollama::{ChatMessageRequest, ChatRequest, InferenceBackend, ModelDescriptor};
use crate::store::{Conversation, ConversationId, Message, SessionStore};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Prompt sent with an image when the user typed nothing.
pub const DEFAULT_IMAGE_PROMPT: &str = "What is in this image?";
/// Assistant message recorded when a turn fails for any reason.
pub const FAILURE_TEXT: &str = "Sorry, something went wrong.";

/// A dispatched turn awaiting its reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    pub conversation: ConversationId,
    pub seq: u64,
    pub request: ChatRequest,
}

/// Builds the chat request for a new user turn.
///
/// Text turns carry the whole prior history plus the new message. Image
/// turns are single-shot: one user message holding the image and no
/// history.
pub fn build_request(
    conversation: &Conversation,
    text: &str,
    image: Option<&EncodedImage>,
) -> ChatRequest {
    let messages = match image {
        Some(image) => {
            let content = if text.trim().is_empty() {
                DEFAULT_IMAGE_PROMPT.to_string()
            } else {
                text.to_string()
            };
            vec![ChatMessageRequest {
                role: "user".to_string(),
                content,
                images: Some(vec![image.base64_payload().to_string()]),
            }]
        }
        None => conversation
            .messages()
            .iter()
            .map(|m| ChatMessageRequest::new(m.role.as_str(), m.content.clone()))
            .chain(std::iter::once(ChatMessageRequest::new("user", text)))
            .collect(),
    };
    ChatRequest::new(conversation.model(), conversation.temperature(), messages)
}

/// Runs one completion under a deadline. Cancellation and timeout surface as
/// errors so they take the same fallback path as network failures.
pub async fn run_turn<B: InferenceBackend + ?Sized>(
    backend: &B,
    request: &ChatRequest,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<String, ClientError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        result = tokio::time::timeout(deadline, backend.chat(request)) => {
            result.unwrap_or(Err(ClientError::Timeout))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RenameEdit {
    target: ConversationId,
    text: String,
}

pub struct SessionController {
    store: SessionStore,
    catalog: Vec<ModelDescriptor>,
    draft: String,
    attachment: AttachmentSlot,
    editing: Option<RenameEdit>,
    next_seq: HashMap<ConversationId, u64>,
    in_flight: HashSet<(ConversationId, u64)>,
    default_model: String,
    default_temperature: f64,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl SessionController {
    /// Starts with one active conversation using the configured defaults.
    pub fn new(config: &Config) -> Result<Self, StoreError> {
        let store = SessionStore::with_default(&config.default_model, config.default_temperature)?;
        Ok(Self {
            store,
            catalog: Vec::new(),
            draft: String::new(),
            attachment: AttachmentSlot::new(),
            editing: None,
            next_seq: HashMap::new(),
            in_flight: HashSet::new(),
            default_model: config.default_model.clone(),
            default_temperature: config.default_temperature,
            request_timeout: config.request_timeout(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn active_id(&self) -> Option<ConversationId> {
        self.store.active_id()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // Conversations

    pub fn new_conversation(&mut self) -> Result<ConversationId, StoreError> {
        let id = self
            .store
            .create(&self.default_model, self.default_temperature)?;
        self.store.activate(id)?;
        tracing::info!(%id, "new conversation");
        Ok(id)
    }

    pub fn select(&mut self, id: ConversationId) -> Result<(), StoreError> {
        self.store.activate(id)
    }

    /// Deletes `id`; returns whether it was the active conversation.
    pub fn delete(&mut self, id: ConversationId) -> Result<bool, StoreError> {
        let was_active = self.store.delete(id)?;
        if self.editing.as_ref().is_some_and(|e| e.target == id) {
            self.editing = None;
        }
        self.next_seq.remove(&id);
        Ok(was_active)
    }

    pub fn set_temperature(&mut self, id: ConversationId, value: f64) -> Result<(), StoreError> {
        self.store.set_temperature(id, value)
    }

    pub fn set_model(&mut self, id: ConversationId, model: &str) -> Result<(), StoreError> {
        self.store.set_model(id, model)
    }

    // Rename editing

    /// Enters edit mode for `id`, seeded with its current name.
    pub fn start_rename(&mut self, id: ConversationId) -> Result<(), StoreError> {
        let name = self.store.get(id)?.name().to_string();
        self.editing = Some(RenameEdit {
            target: id,
            text: name,
        });
        Ok(())
    }

    pub fn edit_rename(&mut self, text: &str) {
        if let Some(edit) = self.editing.as_mut() {
            edit.text = text.to_string();
        }
    }

    pub fn editing(&self) -> Option<(ConversationId, &str)> {
        self.editing.as_ref().map(|e| (e.target, e.text.as_str()))
    }

    /// Leaves edit mode unconditionally. A blank name keeps the prior one and
    /// returns `Ok(false)`.
    pub fn commit_rename(&mut self) -> Result<bool, StoreError> {
        let Some(edit) = self.editing.take() else {
            return Ok(false);
        };
        if edit.text.trim().is_empty() {
            return Ok(false);
        }
        self.store.rename(edit.target, &edit.text)?;
        Ok(true)
    }

    // Pending input

    pub fn set_draft(&mut self, text: &str) {
        self.draft = text.to_string();
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn select_image(&mut self, path: impl Into<PathBuf>) -> SelectionTicket {
        self.attachment.select(path)
    }

    pub fn attach_encoded(&mut self, ticket: SelectionTicket, image: EncodedImage) -> bool {
        self.attachment.fulfil(ticket, image)
    }

    pub fn clear_image(&mut self) {
        self.attachment.clear();
    }

    /// Records a failed encode. Returns `false` when the failure belongs to a
    /// selection that has since been replaced or cleared.
    pub fn fail_image(&mut self, ticket: SelectionTicket) -> bool {
        self.attachment.fail(ticket)
    }

    pub fn attachment(&self) -> &AttachmentSlot {
        &self.attachment
    }

    // Model catalog

    pub async fn load_models<B: InferenceBackend + ?Sized>(&mut self, backend: &B) {
        let result = backend.list_models().await;
        self.apply_catalog(result);
    }

    /// Stores a fetched catalog. A failed fetch leaves it empty; conversations
    /// keep whatever model they already hold.
    pub fn apply_catalog(&mut self, result: Result<Vec<ModelDescriptor>, ClientError>) {
        match result {
            Ok(models) => self.catalog = models,
            Err(e) => {
                tracing::error!(error = %e, "failed to load model catalog");
                self.catalog.clear();
            }
        }
    }

    pub fn catalog(&self) -> &[ModelDescriptor] {
        &self.catalog
    }

    pub fn model_choices(&self) -> Vec<&str> {
        self.catalog.iter().filter_map(|m| m.identifier()).collect()
    }

    // Sending

    /// Phase one of a send. Returns `Ok(None)` without touching anything when
    /// there is neither text nor an encoded image.
    pub fn begin_send(&mut self, id: ConversationId) -> Result<Option<PendingTurn>, StoreError> {
        let conversation = self.store.get(id)?;
        let image = self.attachment.image().cloned();
        if self.draft.trim().is_empty() && image.is_none() {
            return Ok(None);
        }
        if image.is_none() && self.attachment.path().is_some() {
            tracing::warn!(%id, "image still encoding, sending text only");
        }

        let request = build_request(conversation, &self.draft, image.as_ref());
        let text = std::mem::take(&mut self.draft);
        self.attachment.clear();
        self.store
            .append(id, Message::user(text, image.map(|i| i.data_uri().to_string())))?;

        let seq = self.next_seq.entry(id).or_insert(0);
        *seq += 1;
        let turn = PendingTurn {
            conversation: id,
            seq: *seq,
            request,
        };
        self.in_flight.insert((id, turn.seq));
        tracing::debug!(%id, seq = turn.seq, messages = turn.request.messages.len(), "turn dispatched");
        Ok(Some(turn))
    }

    /// Phase two of a send. Appends the reply, or the fixed failure text, to
    /// the conversation the turn came from and clears the attachment. Returns
    /// `false`, leaving the pending input untouched, when the turn was already
    /// applied or its conversation no longer exists.
    pub fn complete_turn(
        &mut self,
        turn: &PendingTurn,
        outcome: Result<String, ClientError>,
    ) -> bool {
        if !self.in_flight.remove(&(turn.conversation, turn.seq)) {
            tracing::debug!(id = %turn.conversation, seq = turn.seq, "duplicate completion ignored");
            return false;
        }

        let content = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(id = %turn.conversation, seq = turn.seq, error = %e, "chat turn failed");
                FAILURE_TEXT.to_string()
            }
        };

        match self.store.append(turn.conversation, Message::assistant(content)) {
            Ok(_) => {
                self.attachment.clear();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping reply for deleted conversation");
                false
            }
        }
    }

    pub fn is_awaiting_reply(&self, id: ConversationId) -> bool {
        self.in_flight.iter().any(|(c, _)| *c == id)
    }

    /// A token for one turn, cancelled by [`SessionController::shutdown`].
    pub fn turn_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Cancels every outstanding turn.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Both phases in one call. Returns the assistant text that was appended,
    /// or `None` for a no-op send.
    pub async fn send<B: InferenceBackend + ?Sized>(
        &mut self,
        backend: &B,
        id: ConversationId,
    ) -> Result<Option<String>, StoreError> {
        let Some(turn) = self.begin_send(id)? else {
            return Ok(None);
        };
        let cancel = self.turn_token();
        let outcome = run_turn(backend, &turn.request, self.request_timeout, &cancel).await;
        self.complete_turn(&turn, outcome);

        let reply = self
            .store
            .get(id)?
            .messages()
            .last()
            .map(|m| m.content.clone());
        Ok(reply)
    }
}
