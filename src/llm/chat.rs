//! Chat turns against the conversation model with per-session history

use crate::integration::config::ChatConfig;
use crate::llm::prompts::{merge_context, InteractionContext};
use crate::messages::{Session, SessionStore};
use crate::models::{ChatPrompt, ChatTurn, ModelKind, ModelRegistry};
use crate::utils::perf::Stopwatch;
use crate::{Result, SellerError};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of one chat turn
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub response: String,
    pub session_id: Uuid,
    /// Seconds spent on the turn
    pub processing_time: f64,
    pub confidence: f32,
}

pub struct ChatService {
    sessions: Arc<SessionStore>,
    registry: Arc<ModelRegistry>,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(sessions: Arc<SessionStore>, registry: Arc<ModelRegistry>, config: ChatConfig) -> Self {
        Self {
            sessions,
            registry,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Send a plain message. Without a session id a new session is started;
    /// an unknown id is an error.
    pub async fn send(&self, message: &str, session_id: Option<Uuid>) -> Result<ChatReply> {
        self.respond(session_id, message, message.trim().to_string())
            .await
    }

    /// Send a transcript together with what the other steps learned about the
    /// customer. History records only what the customer said.
    pub async fn send_with_context(
        &self,
        session_id: Option<Uuid>,
        context: &InteractionContext,
    ) -> Result<ChatReply> {
        self.respond(session_id, &context.transcript, merge_context(context))
            .await
    }

    async fn respond(
        &self,
        session_id: Option<Uuid>,
        message: &str,
        user_prompt: String,
    ) -> Result<ChatReply> {
        let stopwatch = Stopwatch::start();
        let message = message.trim();
        if message.is_empty() {
            return Err(SellerError::InvalidParameters("message must not be empty".to_string()));
        }
        let chars = message.chars().count();
        if chars > self.config.max_message_chars {
            return Err(SellerError::InvalidParameters(format!(
                "message is {} characters, limit is {}",
                chars, self.config.max_message_chars
            )));
        }

        let existing = self.existing_session(session_id)?;
        let history: Vec<ChatTurn> = existing
            .as_ref()
            .map(|session| {
                session
                    .recent(self.config.context_messages)
                    .iter()
                    .map(|entry| ChatTurn {
                        role: entry.role,
                        text: entry.text.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let prompt = ChatPrompt {
            system: self.config.system_prompt.clone(),
            history,
            user: user_prompt,
        };
        debug!(
            "Chat turn for session {:?} with {} history entries",
            session_id,
            prompt.history.len()
        );

        let handle = self.registry.acquire(ModelKind::Conversation).await?;
        let model = handle.chat_model()?;
        let completion = handle.run(move || model.generate(&prompt)).await?;

        let response = completion.text.trim().to_string();
        if response.is_empty() {
            return Err(SellerError::InferenceFailure(
                "conversation model returned an empty response".to_string(),
            ));
        }

        // A new session only exists once its first turn succeeded
        let session_id = match existing {
            Some(session) => session.id,
            None => self.sessions.create().id,
        };
        self.sessions.append_exchange(session_id, message, response.as_str())?;
        info!(
            "Chat reply for session {} in {}ms",
            session_id,
            stopwatch.elapsed_ms()
        );

        Ok(ChatReply {
            response,
            session_id,
            processing_time: stopwatch.elapsed().as_secs_f64(),
            confidence: completion
                .confidence
                .unwrap_or(self.config.default_confidence),
        })
    }

    fn existing_session(&self, session_id: Option<Uuid>) -> Result<Option<Session>> {
        let Some(id) = session_id else {
            return Ok(None);
        };
        let session = self.sessions.get(id)?;
        if !session.is_active {
            return Err(SellerError::InvalidState(format!("session {} has ended", id)));
        }
        Ok(Some(session))
    }
}
