//! Line-oriented chat shell driven by an action channel.
//!
//! Every state change happens in [`App::update`] on the loop that owns the
//! app. Network calls and file reads run on spawned tasks and report back by
//! sending another [`Action`].

use crate::attachment::{self, EncodedImage, SelectionTicket};
use crate::config::Config;
use crate::controller::{run_turn, PendingTurn, SessionController};
use crate::error::{ClientError, StoreError};
use crate::ollama::{InferenceBackend, ModelDescriptor, OllamaClient};
use crate::store::{ConversationId, Role};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const HELP: &str = "\
/new               start a new conversation
/list              list conversations
/switch N          make conversation N active
/rename N NAME     rename conversation N
/delete N          delete conversation N
/temp T            set temperature (0.0 - 1.0) of the active conversation
/models            list models reported by the server
/model NAME        set the model of the active conversation
/image PATH        attach an image to the next message
/unimage           drop the pending image
/help              show this help
/quit              exit
anything else is sent as a message";

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Quit,
    Help,
    LoadModels,
    ModelsLoaded(Result<Vec<ModelDescriptor>, ClientError>),
    SendMessage(String),
    TurnCompleted(PendingTurn, Result<String, ClientError>),
    NewConversation,
    ListConversations,
    SwitchConversation(usize),
    RenameConversation(usize, String),
    DeleteConversation(usize),
    SetTemperature(f64),
    SetModel(String),
    ListModels,
    AttachImage(PathBuf),
    ImageEncoded(SelectionTicket, Result<EncodedImage, String>),
    RemoveImage,
    Error(String),
}

/// Parses one line of user input. Conversation numbers are 1-based as shown
/// by `/list`.
pub fn parse_input(line: &str) -> Action {
    let trimmed = line.trim();
    let Some(command) = trimmed.strip_prefix('/') else {
        return Action::SendMessage(line.to_string());
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(n, r)| (n, r.trim()))
        .unwrap_or((command, ""));

    let index = |arg: &str| -> Result<usize, String> {
        match arg.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(n - 1),
            _ => Err(format!("expected a conversation number, got {:?}", arg)),
        }
    };

    let parsed = match name {
        "quit" | "q" => Ok(Action::Quit),
        "help" => Ok(Action::Help),
        "new" => Ok(Action::NewConversation),
        "list" => Ok(Action::ListConversations),
        "models" => Ok(Action::ListModels),
        "unimage" => Ok(Action::RemoveImage),
        "switch" => index(rest).map(Action::SwitchConversation),
        "delete" => index(rest).map(Action::DeleteConversation),
        "rename" => {
            let (n, new_name) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            index(n).map(|i| Action::RenameConversation(i, new_name.to_string()))
        }
        "temp" => rest
            .parse::<f64>()
            .map(Action::SetTemperature)
            .map_err(|_| format!("expected a number, got {:?}", rest)),
        "model" if !rest.is_empty() => Ok(Action::SetModel(rest.to_string())),
        "image" if !rest.is_empty() => Ok(Action::AttachImage(PathBuf::from(rest))),
        _ => Err(format!("unknown command: /{} (try /help)", name)),
    };
    parsed.unwrap_or_else(Action::Error)
}

pub struct App {
    pub controller: SessionController,
    backend: Arc<dyn InferenceBackend>,
    action_tx: mpsc::UnboundedSender<Action>,
    output: Vec<String>,
}

impl App {
    pub fn new(
        action_tx: mpsc::UnboundedSender<Action>,
        config: &Config,
    ) -> Result<Self, StoreError> {
        let backend = Arc::new(OllamaClient::new(config.ollama_url.clone()));
        Self::with_backend(action_tx, config, backend)
    }

    pub fn with_backend(
        action_tx: mpsc::UnboundedSender<Action>,
        config: &Config,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            controller: SessionController::new(config)?,
            backend,
            action_tx,
            output: Vec::new(),
        })
    }

    /// Lines produced since the last call, for the caller to print.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub fn prompt(&self) -> String {
        let Some(conv) = self.controller.store().active() else {
            return "(no conversation, /new to start) > ".to_string();
        };
        let mut prompt = format!(
            "[{} | {} | t={:.1}]",
            conv.name(),
            conv.model(),
            conv.temperature()
        );
        if self.controller.is_awaiting_reply(conv.id()) {
            prompt.push_str(" …");
        }
        if let Some(path) = self.controller.attachment().path() {
            prompt.push_str(&format!(" +{}", path.display()));
        }
        prompt.push_str(" > ");
        prompt
    }

    fn say(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    fn nth_id(&self, index: usize) -> Option<ConversationId> {
        self.controller.store().iter().nth(index).map(|c| c.id())
    }

    fn report(&mut self, result: Result<(), StoreError>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "rejected action");
            self.say(format!("error: {}", e));
        }
    }

    /// Applies one action. Returns `true` when anything visible changed.
    pub fn update(&mut self, action: Action) -> bool {
        match action {
            Action::Quit => {
                self.controller.shutdown();
                false
            }
            Action::Help => {
                self.say(HELP);
                true
            }
            Action::Error(e) => {
                self.say(format!("error: {}", e));
                true
            }
            Action::LoadModels => {
                let backend = self.backend.clone();
                let tx = self.action_tx.clone();
                tokio::spawn(async move {
                    let result = backend.list_models().await;
                    let _ = tx.send(Action::ModelsLoaded(result));
                });
                false
            }
            Action::ModelsLoaded(result) => {
                if let Err(e) = &result {
                    self.say(format!("could not load models: {}", e));
                }
                self.controller.apply_catalog(result);
                true
            }
            Action::ListModels => {
                let choices = self.controller.model_choices().join(", ");
                if choices.is_empty() {
                    self.say("no models available");
                } else {
                    self.say(format!("models: {}", choices));
                }
                true
            }
            Action::SendMessage(text) => {
                let Some(id) = self.controller.active_id() else {
                    self.say("no active conversation, /new to start one");
                    return true;
                };
                self.controller.set_draft(&text);
                match self.controller.begin_send(id) {
                    Ok(Some(turn)) => {
                        self.dispatch(turn);
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        self.report(Err(e));
                        true
                    }
                }
            }
            Action::TurnCompleted(turn, outcome) => {
                if !self.controller.complete_turn(&turn, outcome) {
                    return false;
                }
                self.show_reply(turn.conversation);
                true
            }
            Action::NewConversation => {
                let result = self.controller.new_conversation().map(|_| ());
                self.report(result);
                true
            }
            Action::ListConversations => {
                let active = self.controller.active_id();
                let lines: Vec<String> = self
                    .controller
                    .store()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        let marker = if Some(c.id()) == active { "*" } else { " " };
                        format!(
                            "{} {}. {} ({} messages, {}, t={:.1})",
                            marker,
                            i + 1,
                            c.name(),
                            c.messages().len(),
                            c.model(),
                            c.temperature()
                        )
                    })
                    .collect();
                if lines.is_empty() {
                    self.say("no conversations");
                }
                self.output.extend(lines);
                true
            }
            Action::SwitchConversation(index) => {
                let result = self.by_index(index).and_then(|id| {
                    self.controller.select(id)?;
                    Ok(id)
                });
                match result {
                    Ok(id) => self.show_history(id),
                    Err(e) => self.report(Err(e)),
                }
                true
            }
            Action::RenameConversation(index, name) => {
                let result = self.by_index(index).and_then(|id| {
                    self.controller.start_rename(id)?;
                    self.controller.edit_rename(&name);
                    self.controller.commit_rename().map(|_| ())
                });
                self.report(result);
                true
            }
            Action::DeleteConversation(index) => {
                let result = self
                    .by_index(index)
                    .and_then(|id| self.controller.delete(id).map(|_| ()));
                self.report(result);
                true
            }
            Action::SetTemperature(value) => {
                let result = self
                    .active()
                    .and_then(|id| self.controller.set_temperature(id, value));
                self.report(result);
                true
            }
            Action::SetModel(model) => {
                if !self.controller.catalog().is_empty()
                    && !self.controller.model_choices().contains(&model.as_str())
                {
                    self.say(format!("note: {} is not in the server's model list", model));
                }
                let result = self
                    .active()
                    .and_then(|id| self.controller.set_model(id, &model));
                self.report(result);
                true
            }
            Action::AttachImage(path) => {
                let ticket = self.controller.select_image(path.clone());
                let tx = self.action_tx.clone();
                tokio::spawn(async move {
                    let result = attachment::encode_file(&path)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = tx.send(Action::ImageEncoded(ticket, result));
                });
                true
            }
            Action::ImageEncoded(ticket, result) => match result {
                Ok(image) => self.controller.attach_encoded(ticket, image),
                Err(e) => {
                    if !self.controller.fail_image(ticket) {
                        tracing::debug!(error = %e, "ignoring encode failure of a replaced image");
                        return false;
                    }
                    self.say(format!("error: {}", e));
                    true
                }
            },
            Action::RemoveImage => {
                self.controller.clear_image();
                true
            }
        }
    }

    fn dispatch(&self, turn: PendingTurn) {
        let backend = self.backend.clone();
        let tx = self.action_tx.clone();
        let deadline = self.controller.request_timeout();
        let cancel = self.controller.turn_token();
        tokio::spawn(async move {
            let outcome = run_turn(backend.as_ref(), &turn.request, deadline, &cancel).await;
            let _ = tx.send(Action::TurnCompleted(turn, outcome));
        });
    }

    fn by_index(&self, index: usize) -> Result<ConversationId, StoreError> {
        self.nth_id(index).ok_or_else(|| {
            StoreError::Validation(format!("no conversation numbered {}", index + 1))
        })
    }

    fn active(&self) -> Result<ConversationId, StoreError> {
        self.controller
            .active_id()
            .ok_or_else(|| StoreError::Validation("no active conversation".to_string()))
    }

    fn show_reply(&mut self, id: ConversationId) {
        let Ok(conv) = self.controller.store().get(id) else {
            return;
        };
        let Some(reply) = conv.messages().last() else {
            return;
        };
        let line = if Some(id) == self.controller.active_id() {
            format!("assistant: {}", reply.content)
        } else {
            format!("(new reply in \"{}\")", conv.name())
        };
        self.say(line);
    }

    fn show_history(&mut self, id: ConversationId) {
        let Ok(conv) = self.controller.store().get(id) else {
            return;
        };
        let lines: Vec<String> = conv
            .messages()
            .iter()
            .map(|m| {
                let who = match m.role {
                    Role::User => "you",
                    Role::Assistant => "assistant",
                };
                let image = if m.image.is_some() { " [image]" } else { "" };
                format!("{}:{} {}", who, image, m.content)
            })
            .collect();
        self.output.extend(lines);
    }
}
